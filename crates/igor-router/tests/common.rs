use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use igor_config::{DiameterPeersConfig, DiameterServerConfig};
use igor_core::constants::DIAMETER_SUCCESS;
use igor_core::Result;
use igor_dict::DiameterDictionary;
use igor_diameter::DiameterMessage;
use igor_peer::{DiameterHandler, PeerSettings};

pub const BASE_DICTIONARY: &str = r#"{
    "Avps": [
        {"Code": 257, "Name": "Host-IP-Address", "Type": "Address"},
        {"Code": 258, "Name": "Auth-Application-Id", "Type": "Unsigned32"},
        {"Code": 259, "Name": "Acct-Application-Id", "Type": "Unsigned32"},
        {"Code": 263, "Name": "Session-Id", "Type": "UTF8String"},
        {"Code": 264, "Name": "Origin-Host", "Type": "DiameterIdentity"},
        {"Code": 266, "Name": "Vendor-Id", "Type": "Unsigned32"},
        {"Code": 267, "Name": "Firmware-Revision", "Type": "Unsigned32"},
        {"Code": 268, "Name": "Result-Code", "Type": "Unsigned32"},
        {"Code": 269, "Name": "Product-Name", "Type": "UTF8String"},
        {"Code": 278, "Name": "Origin-State-Id", "Type": "Unsigned32"},
        {"Code": 283, "Name": "Destination-Realm", "Type": "DiameterIdentity"},
        {"Code": 296, "Name": "Origin-Realm", "Type": "DiameterIdentity"},
        {"Code": 1, "Name": "User-Name", "Type": "UTF8String"}
    ],
    "Applications": [
        {"Code": 0, "Name": "Base", "AppType": "auth"},
        {"Code": 1000, "Name": "TestApplication", "AppType": "auth"}
    ],
    "Commands": [
        {"Code": 257, "Name": "Capabilities-Exchange"},
        {"Code": 280, "Name": "Device-Watchdog"},
        {"Code": 282, "Name": "Disconnect-Peer"},
        {"Code": 2000, "Name": "TestRequest"}
    ]
}"#;

pub fn dictionary() -> Arc<DiameterDictionary> {
    Arc::new(DiameterDictionary::from_json(BASE_DICTIONARY).unwrap())
}

pub fn settings(diameter_host: &str, peers_json: &str) -> Arc<PeerSettings> {
    let peers: DiameterPeersConfig = serde_json::from_str(peers_json).unwrap();
    Arc::new(PeerSettings {
        dict: dictionary(),
        server: DiameterServerConfig {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 0,
            diameter_host: diameter_host.to_string(),
            diameter_realm: "igor".to_string(),
            vendor_id: 9001,
            firmware_revision: 1,
        },
        peers,
        auth_applications: vec![1000],
        acct_applications: vec![],
    })
}

/// Handler answering every request with DIAMETER_SUCCESS
pub struct EchoHandler {
    pub dict: Arc<DiameterDictionary>,
}

#[async_trait]
impl DiameterHandler for EchoHandler {
    async fn handle(&self, request: DiameterMessage) -> Result<DiameterMessage> {
        let mut answer = DiameterMessage::new_answer(&request);
        answer.add_origin_avps("echo.igor", "igor", &self.dict)?;
        answer.add("Result-Code", DIAMETER_SUCCESS, &self.dict)?;
        Ok(answer)
    }
}

/// Raw-socket remote Diameter server: accepts connections, completes the
/// CER/CEA handshake and answers every request, stamping its identity.
/// A request carrying User-Name "die" makes it drop that connection; the
/// kill switch drops the listener.
pub struct StubServer {
    pub addr: SocketAddr,
    pub kill: Option<oneshot::Sender<()>>,
}

pub async fn stub_server(origin_host: &'static str) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut kill_rx => return,
                result = listener.accept() => {
                    let Ok((stream, _)) = result else { return };
                    tokio::spawn(stub_connection(stream, origin_host));
                }
            }
        }
    });

    StubServer {
        addr,
        kill: Some(kill_tx),
    }
}

async fn stub_connection(mut stream: TcpStream, origin_host: &'static str) {
    let dict = dictionary();

    let Ok(cer) = DiameterMessage::read_from(&mut stream, &dict).await else {
        return;
    };
    let mut cea = DiameterMessage::new_answer(&cer);
    cea.add_origin_avps(origin_host, "igor", &dict).unwrap();
    cea.add("Result-Code", DIAMETER_SUCCESS, &dict).unwrap();
    if stream.write_all(&cea.to_bytes()).await.is_err() {
        return;
    }

    loop {
        let Ok(message) = DiameterMessage::read_from(&mut stream, &dict).await else {
            return;
        };
        if !message.is_request {
            continue;
        }
        match message.get_str_avp("User-Name").as_str() {
            // Drop the connection without answering
            "die" => return,
            // Keep the connection but never answer this request
            "stall" => continue,
            _ => {}
        }
        let mut answer = DiameterMessage::new_answer(&message);
        answer.add_origin_avps(origin_host, "igor", &dict).unwrap();
        answer.add("Result-Code", DIAMETER_SUCCESS, &dict).unwrap();
        if stream.write_all(&answer.to_bytes()).await.is_err() {
            return;
        }
    }
}
