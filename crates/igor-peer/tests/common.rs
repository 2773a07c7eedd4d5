use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

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

/// Settings for one side of a peering, with the given identity and
/// configured peer table
pub fn settings(diameter_host: &str, peers_json: &str) -> Arc<PeerSettings> {
    let peers: DiameterPeersConfig = serde_json::from_str(peers_json).unwrap();
    Arc::new(PeerSettings {
        dict: dictionary(),
        server: DiameterServerConfig {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 3868,
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

/// Handler that always fails, so no answer is ever transmitted
pub struct FailingHandler;

#[async_trait]
impl DiameterHandler for FailingHandler {
    async fn handle(&self, _request: DiameterMessage) -> Result<DiameterMessage> {
        Err(igor_core::IgorError::Internal("no answer".to_string()))
    }
}

/// Raw-socket stand-in for a remote peer: accept one connection and
/// complete the CER/CEA handshake with the given identity
pub async fn accept_and_engage(
    listener: &TcpListener,
    dict: &DiameterDictionary,
    origin_host: &str,
) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();

    let cer = DiameterMessage::read_from(&mut stream, dict).await.unwrap();
    assert_eq!(cer.command_code, 257);
    assert!(cer.is_request);

    let mut cea = DiameterMessage::new_answer(&cer);
    cea.add_origin_avps(origin_host, "igor", dict).unwrap();
    cea.add("Result-Code", DIAMETER_SUCCESS, dict).unwrap();
    write_message(&mut stream, &cea).await;

    stream
}

pub async fn write_message(stream: &mut TcpStream, message: &DiameterMessage) {
    use tokio::io::AsyncWriteExt;
    stream.write_all(&message.to_bytes()).await.unwrap();
}
