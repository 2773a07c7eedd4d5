mod handlers;

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use validator::Validate;

use handlers::{EmptyDiameterHandler, EmptyRadiusHandler};
use igor_config::{
    ConfigManager, DiameterPeersConfig, DiameterServerConfig, RadiusClientsConfig,
    RadiusServerConfig, RoutingRuleConfig,
};
use igor_core::{IgorError, Result};
use igor_dict::freeradius::parse_freeradius_dictionary;
use igor_dict::{DiameterDictionary, RadiusDictionary};
use igor_peer::PeerSettings;
use igor_radius_engine::RadiusServer;
use igor_router::{advertised_applications, DiameterRouter, RoutingRules};

#[tokio::main]
async fn main() {
    // Initialize logging
    igor_logging::init();

    // Register metrics
    igor_metrics::register_metrics();

    info!(
        service = "igor",
        version = env!("CARGO_PKG_VERSION"),
        "starting AAA server"
    );

    let bootstrap =
        std::env::var("IGOR_BOOTSTRAP").unwrap_or_else(|_| "resources/searchRules.json".to_string());
    let instance_name = std::env::var("IGOR_INSTANCE").unwrap_or_default();

    if let Err(e) = run(&bootstrap, &instance_name).await {
        eprintln!("igor failed to start: {e}");
        std::process::exit(1);
    }
}

async fn run(bootstrap: &str, instance_name: &str) -> Result<()> {
    let config = ConfigManager::from_bootstrap(bootstrap, instance_name).await?;

    // Dictionaries, immutable after load
    let diameter_dict = Arc::new(DiameterDictionary::from_json(
        &config.get_object("diameterDictionary.json").await?,
    )?);
    let radius_dict = Arc::new(load_radius_dictionary(&config, bootstrap).await?);

    // Typed configuration objects
    let server_config: DiameterServerConfig =
        config.get_json_object("diameterServer.json").await?;
    server_config
        .validate()
        .map_err(|e| IgorError::Config(e.to_string()))?;

    let peers: DiameterPeersConfig = config.get_json_object("diameterPeers.json").await?;
    for peer in &peers.0 {
        peer.validate().map_err(|e| IgorError::Config(e.to_string()))?;
    }

    let routes: Vec<RoutingRuleConfig> = config.get_json_object("diameterRoutes.json").await?;
    for route in &routes {
        route.validate().map_err(|e| IgorError::Config(e.to_string()))?;
    }

    let radius_config: RadiusServerConfig = config.get_json_object("radiusServer.json").await?;
    radius_config
        .validate()
        .map_err(|e| IgorError::Config(e.to_string()))?;
    let radius_clients: RadiusClientsConfig =
        config.get_json_object("radiusClients.json").await?;

    // Diameter router with its peer actors
    let (auth_applications, acct_applications) =
        advertised_applications(&routes, &diameter_dict);
    let origin_host = server_config.diameter_host.clone();
    let origin_realm = server_config.diameter_realm.clone();
    let settings = Arc::new(PeerSettings {
        dict: diameter_dict.clone(),
        server: server_config,
        peers,
        auth_applications,
        acct_applications,
    });

    let diameter_handler = Arc::new(EmptyDiameterHandler {
        dict: diameter_dict.clone(),
        origin_host,
        origin_realm,
    });
    let router = DiameterRouter::new(
        settings,
        Arc::new(RoutingRules::new(routes)),
        diameter_handler,
    )
    .await?;

    // RADIUS server
    let radius_server = RadiusServer::new(
        radius_config,
        radius_clients,
        radius_dict,
        Arc::new(EmptyRadiusHandler),
    )
    .await?;

    info!("igor is up");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    router.shutdown().await;
    radius_server.close();
    Ok(())
}

// The RADIUS dictionary is FreeRADIUS-style text; $INCLUDE directives
// resolve against the directory holding the bootstrap file
async fn load_radius_dictionary(
    config: &ConfigManager,
    bootstrap: &str,
) -> Result<RadiusDictionary> {
    let text = config.get_object("radiusDictionary.txt").await?;

    let base = Path::new(bootstrap)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let resolver = move |name: &str| -> Result<String> {
        std::fs::read_to_string(base.join(name))
            .map_err(|e| IgorError::Config(format!("could not read dictionary {name}: {e}")))
    };

    parse_freeradius_dictionary(&text, &resolver)
}
