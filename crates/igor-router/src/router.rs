use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use igor_config::DiameterPeerConfig;
use igor_core::{IgorError, Result};
use igor_diameter::DiameterMessage;
use igor_metrics::DIAMETER_ROUTE_NOT_FOUND;
use igor_peer::{DiameterHandler, DiameterPeer, PeerControlEvent, PeerSettings, PeerStatus};

use crate::rules::RoutingRules;

// Reconnection backoff for active peers, doubled per consecutive failure
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

// Immutable snapshot of the engaged peers, republished by the supervisor
// on every PeerUp and PeerDown so routing never blocks on mutations
type PeerSnapshot = Arc<HashMap<String, DiameterPeer>>;

enum RouterCommand {
    Shutdown { done: oneshot::Sender<()> },
}

/// Owns the set of peer actors, enforces one engaged connection per
/// Origin-Host, and routes outbound requests by realm and application
pub struct DiameterRouter {
    settings: Arc<PeerSettings>,
    rules: Arc<RoutingRules>,
    snapshot: Arc<RwLock<PeerSnapshot>>,
    command_tx: mpsc::Sender<RouterCommand>,
    local_addr: SocketAddr,
}

impl DiameterRouter {
    /// Start the router: one actor per configured active peer, plus the
    /// passive listener
    pub async fn new(
        settings: Arc<PeerSettings>,
        rules: Arc<RoutingRules>,
        handler: Arc<dyn DiameterHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((
            settings.server.bind_address.as_str(),
            settings.server.bind_port,
        ))
        .await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "diameter router listening");

        let snapshot: Arc<RwLock<PeerSnapshot>> = Arc::new(RwLock::new(Arc::new(HashMap::new())));
        let (command_tx, command_rx) = mpsc::channel(16);
        let (control_tx, control_rx) = mpsc::channel(64);

        let mut supervisor = Supervisor {
            settings: settings.clone(),
            handler,
            listener,
            control_tx,
            control_rx,
            command_rx,
            snapshot: snapshot.clone(),
            peers: HashMap::new(),
            engaged: HashMap::new(),
            reconnect: DelayQueue::new(),
            attempts: HashMap::new(),
            next_key: 0,
            shutting_down: false,
            shutdown_done: None,
        };

        for config in settings.peers.active_peers() {
            supervisor.spawn_active(config.clone());
        }

        tokio::spawn(supervisor.run());

        Ok(Self {
            settings,
            rules,
            snapshot,
            command_tx,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Origin-Hosts of the currently engaged peers
    pub fn engaged_peers(&self) -> Vec<String> {
        self.snapshot.read().unwrap().keys().cloned().collect()
    }

    /// Route a request to a peer selected by the first matching rule.
    /// Candidate peers that are not Engaged are skipped; with the rule's
    /// retry flag, a retryable peer failure moves on to the next
    /// candidate.
    pub async fn route(&self, message: DiameterMessage, timeout: Duration) -> Result<DiameterMessage> {
        let realm = message.destination_realm().unwrap_or_default();
        let application_id = message.application_id;

        let Some(rule) = self.rules.find(&realm, application_id, &self.settings.dict) else {
            DIAMETER_ROUTE_NOT_FOUND.with_label_values(&[&realm]).inc();
            return Err(IgorError::NoRoute {
                realm,
                application: application_id.to_string(),
            });
        };

        let snapshot = self.snapshot.read().unwrap().clone();
        let mut last_error: Option<IgorError> = None;

        for host in rule.candidates() {
            let Some(peer) = snapshot.get(host) else {
                continue;
            };
            if peer.status() != PeerStatus::Engaged {
                continue;
            }

            match peer.request(message.clone(), timeout).await {
                Ok(answer) => return Ok(answer),
                Err(e) if rule.config.retry && e.is_retryable() => {
                    warn!(peer = host, error = %e, "peer failed, trying next candidate");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => {
                DIAMETER_ROUTE_NOT_FOUND.with_label_values(&[&realm]).inc();
                Err(IgorError::NoRoute {
                    realm,
                    application: application_id.to_string(),
                })
            }
        }
    }

    /// Disengage every peer, wait for all of them to report down, then
    /// stop the listener
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(RouterCommand::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

struct PeerEntry {
    handle: DiameterPeer,
    // Present for active peers, used to schedule reconnection
    config: Option<DiameterPeerConfig>,
    engaged_host: Option<String>,
}

struct Supervisor {
    settings: Arc<PeerSettings>,
    handler: Arc<dyn DiameterHandler>,
    listener: TcpListener,
    control_tx: mpsc::Sender<PeerControlEvent>,
    control_rx: mpsc::Receiver<PeerControlEvent>,
    command_rx: mpsc::Receiver<RouterCommand>,
    snapshot: Arc<RwLock<PeerSnapshot>>,
    peers: HashMap<u64, PeerEntry>,
    // Origin-Host to peer key, the uniqueness invariant
    engaged: HashMap<String, u64>,
    reconnect: DelayQueue<DiameterPeerConfig>,
    // Consecutive connection failures per active peer host
    attempts: HashMap<String, u32>,
    next_key: u64,
    shutting_down: bool,
    shutdown_done: Option<oneshot::Sender<()>>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.control_rx.recv() => {
                    self.handle_control(event).await;
                    if self.shutting_down && self.peers.is_empty() {
                        break;
                    }
                }

                result = self.listener.accept(), if !self.shutting_down => match result {
                    Ok((stream, addr)) => {
                        debug!(remote = %addr, "new passive connection");
                        let key = self.allocate_key();
                        let handle = DiameterPeer::new_passive(
                            key,
                            self.settings.clone(),
                            stream,
                            self.control_tx.clone(),
                            self.handler.clone(),
                        );
                        self.peers.insert(key, PeerEntry {
                            handle,
                            config: None,
                            engaged_host: None,
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                },

                Some(expired) = self.reconnect.next(), if !self.shutting_down => {
                    let config = expired.into_inner();
                    debug!(peer = %config.diameter_host, "reconnecting active peer");
                    self.spawn_active(config);
                }

                Some(command) = self.command_rx.recv() => match command {
                    RouterCommand::Shutdown { done } => {
                        info!("diameter router shutting down");
                        self.shutting_down = true;
                        self.shutdown_done = Some(done);
                        if self.peers.is_empty() {
                            break;
                        }
                        for entry in self.peers.values() {
                            let handle = entry.handle.clone();
                            tokio::spawn(async move { handle.disengage().await });
                        }
                    }
                },
            }
        }

        if let Some(done) = self.shutdown_done.take() {
            let _ = done.send(());
        }
    }

    fn allocate_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    fn spawn_active(&mut self, config: DiameterPeerConfig) {
        let key = self.allocate_key();
        let handle = DiameterPeer::new_active(
            key,
            self.settings.clone(),
            config.clone(),
            self.control_tx.clone(),
            self.handler.clone(),
        );
        self.peers.insert(
            key,
            PeerEntry {
                handle,
                config: Some(config),
                engaged_host: None,
            },
        );
    }

    async fn handle_control(&mut self, event: PeerControlEvent) {
        match event {
            PeerControlEvent::PeerUp { key, diameter_host } => {
                // At most one engaged peer per Origin-Host: a newcomer for
                // an already engaged host is closed
                if let Some(existing) = self.engaged.get(&diameter_host) {
                    if *existing != key {
                        warn!(
                            peer = %diameter_host,
                            "duplicate connection for engaged origin host, closing newcomer"
                        );
                        if let Some(entry) = self.peers.get(&key) {
                            let handle = entry.handle.clone();
                            tokio::spawn(async move { handle.disengage().await });
                        }
                        return;
                    }
                }

                info!(peer = %diameter_host, "peer engaged");
                self.attempts.remove(&diameter_host);
                self.engaged.insert(diameter_host.clone(), key);
                if let Some(entry) = self.peers.get_mut(&key) {
                    entry.engaged_host = Some(diameter_host);
                }
                self.publish_snapshot();
            }

            PeerControlEvent::PeerDown { key, diameter_host, error } => {
                match &error {
                    Some(e) => warn!(peer = ?diameter_host, error = %e, "peer down"),
                    None => info!(peer = ?diameter_host, "peer down"),
                }

                let Some(entry) = self.peers.remove(&key) else {
                    return;
                };
                if let Some(host) = &entry.engaged_host {
                    if self.engaged.get(host) == Some(&key) {
                        self.engaged.remove(host);
                    }
                }
                self.publish_snapshot();

                // Recycle active peers on a capped exponential backoff
                if !self.shutting_down {
                    if let Some(config) = entry.config {
                        let attempts = self
                            .attempts
                            .entry(config.diameter_host.clone())
                            .or_insert(0);
                        let delay = RECONNECT_BASE
                            .saturating_mul(1u32 << (*attempts).min(16))
                            .min(RECONNECT_CAP);
                        *attempts += 1;
                        debug!(
                            peer = %config.diameter_host,
                            delay_millis = delay.as_millis() as u64,
                            "scheduling reconnection"
                        );
                        self.reconnect.insert(config, delay);
                    }
                }
            }
        }
    }

    // Swap in a fresh snapshot of the engaged peers
    fn publish_snapshot(&self) {
        let mut table = HashMap::with_capacity(self.engaged.len());
        for (host, key) in &self.engaged {
            if let Some(entry) = self.peers.get(key) {
                table.insert(host.clone(), entry.handle.clone());
            }
        }
        *self.snapshot.write().unwrap() = Arc::new(table);
    }
}
