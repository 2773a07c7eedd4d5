use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use igor_config::{RadiusClientsConfig, RadiusServerConfig};
use igor_core::constants::{ACCESS_REQUEST, RADIUS_MAX_PACKET_SIZE};
use igor_core::Result;
use igor_dict::RadiusDictionary;
use igor_metrics::{RADIUS_SERVER_DROPS, RADIUS_SERVER_REQUESTS, RADIUS_SERVER_RESPONSES};
use igor_radius::packet::{validate_message_authenticator, validate_request_authenticator};
use igor_radius::RadiusPacket;

/// Handler for RADIUS requests accepted by the server. Invoked on a child
/// task; on error no response is sent and the client retries.
#[async_trait]
pub trait RadiusHandler: Send + Sync {
    async fn handle(&self, request: RadiusPacket) -> Result<RadiusPacket>;
}

/// RADIUS server socket: validates incoming datagrams against the
/// configured clients table and dispatches them to the handler
pub struct RadiusServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl RadiusServer {
    pub async fn new(
        config: RadiusServerConfig,
        clients: RadiusClientsConfig,
        dict: Arc<RadiusDictionary>,
        handler: Arc<dyn RadiusHandler>,
    ) -> Result<Self> {
        let socket =
            UdpSocket::bind((config.bind_address.as_str(), config.bind_port)).await?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "radius server listening");

        let cancel = CancellationToken::new();
        tokio::spawn(read_loop(
            Arc::new(socket),
            clients,
            dict,
            handler,
            cancel.clone(),
        ));

        Ok(Self { local_addr, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the reader loop and release the socket
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RadiusServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// Single reader loop; responses are written concurrently from the
// per-request handler tasks through the shared socket
async fn read_loop(
    socket: Arc<UdpSocket>,
    clients: RadiusClientsConfig,
    dict: Arc<RadiusDictionary>,
    handler: Arc<dyn RadiusHandler>,
    cancel: CancellationToken,
) {
    let mut buffer = [0u8; RADIUS_MAX_PACKET_SIZE];

    loop {
        let (size, remote) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("radius server socket closed");
                return;
            }
            result = socket.recv_from(&mut buffer) => match result {
                Ok(received) => received,
                Err(e) => {
                    error!(error = %e, "radius server read error");
                    continue;
                }
            },
        };

        let client_ip = remote.ip().to_string();
        let client = match clients.find(remote.ip()) {
            Ok(client) => client,
            Err(_) => {
                RADIUS_SERVER_DROPS.with_label_values(&[&client_ip, "0"]).inc();
                warn!(client = %client_ip, "datagram from unknown client");
                continue;
            }
        };
        let secret = client.secret.clone();

        let datagram = Bytes::copy_from_slice(&buffer[..size]);
        let packet = match RadiusPacket::from_bytes(&datagram, &secret, None, &dict) {
            Ok(packet) => packet,
            Err(e) => {
                RADIUS_SERVER_DROPS.with_label_values(&[&client_ip, "0"]).inc();
                error!(client = %client_ip, error = %e, "could not decode datagram");
                continue;
            }
        };

        // The request authenticator is verifiable for every code except
        // Access-Request, whose authenticator is random
        if packet.code != ACCESS_REQUEST && !validate_request_authenticator(&datagram, &secret) {
            RADIUS_SERVER_DROPS
                .with_label_values(&[&client_ip, &packet.code.to_string()])
                .inc();
            warn!(client = %client_ip, packet = %packet, "invalid request authenticator");
            continue;
        }
        if !validate_message_authenticator(&datagram, &secret) {
            RADIUS_SERVER_DROPS
                .with_label_values(&[&client_ip, &packet.code.to_string()])
                .inc();
            warn!(client = %client_ip, packet = %packet, "invalid message authenticator");
            continue;
        }

        RADIUS_SERVER_REQUESTS
            .with_label_values(&[&client_ip, &packet.code.to_string()])
            .inc();
        debug!(client = %client_ip, packet = %packet, "received radius packet");

        let socket = socket.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let code = packet.code;

            let response = match handler.handle(packet).await {
                Ok(response) => response,
                Err(e) => {
                    // No response: the client will retry
                    RADIUS_SERVER_DROPS
                        .with_label_values(&[&client_ip, &code.to_string()])
                        .inc();
                    error!(client = %client_ip, error = %e, "handler error, discarding packet");
                    return;
                }
            };

            let response_code = response.code;
            let response_bytes = match response.to_bytes(&secret) {
                Ok(bytes) => bytes,
                Err(e) => {
                    RADIUS_SERVER_DROPS
                        .with_label_values(&[&client_ip, &code.to_string()])
                        .inc();
                    error!(client = %client_ip, error = %e, "could not serialize response");
                    return;
                }
            };

            if let Err(e) = socket.send_to(&response_bytes, remote).await {
                RADIUS_SERVER_DROPS
                    .with_label_values(&[&client_ip, &code.to_string()])
                    .inc();
                error!(client = %client_ip, error = %e, "could not send response");
                return;
            }

            RADIUS_SERVER_RESPONSES
                .with_label_values(&[&client_ip, &response_code.to_string()])
                .inc();
            debug!(client = %client_ip, "sent radius response");
        });
    }
}
