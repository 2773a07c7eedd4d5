use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use igor_core::constants::RADIUS_MAX_PACKET_SIZE;
use igor_core::{IgorError, Result};
use igor_dict::RadiusDictionary;
use igor_metrics::{RADIUS_CLIENT_REQUESTS, RADIUS_CLIENT_RESPONSES, RADIUS_CLIENT_TIMEOUTS};
use igor_radius::packet::validate_response_authenticator;
use igor_radius::RadiusPacket;

const DEFAULT_POOL_SIZE: usize = 4;

// In-flight requests keyed by (destination, identifier). The key space
// is the identifier uniqueness domain of the spec: one identifier may
// not be reused toward a destination while its request is outstanding.
type PendingMap = Arc<DashMap<(SocketAddr, u8), PendingRequest>>;

struct PendingRequest {
    secret: String,
    // The authenticator field as it went out on the wire, which keys the
    // response authenticator and the response ciphers
    request_authenticator: [u8; 16],
    reply_to: oneshot::Sender<RadiusPacket>,
}

/// RADIUS client engine: a pool of ephemeral-port sockets with
/// demultiplexing readers, and per-packet retransmission across
/// tries × server-tries
pub struct RadiusClientEngine {
    dict: Arc<RadiusDictionary>,
    sockets: Vec<Arc<UdpSocket>>,
    next_socket: AtomicUsize,
    pending: PendingMap,
    cancel: CancellationToken,
}

impl RadiusClientEngine {
    pub async fn new(dict: Arc<RadiusDictionary>) -> Result<Self> {
        Self::with_pool_size(dict, DEFAULT_POOL_SIZE).await
    }

    pub async fn with_pool_size(dict: Arc<RadiusDictionary>, pool_size: usize) -> Result<Self> {
        let pending: PendingMap = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let mut sockets = Vec::with_capacity(pool_size);
        for _ in 0..pool_size.max(1) {
            let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
            tokio::spawn(reader_loop(
                socket.clone(),
                dict.clone(),
                pending.clone(),
                cancel.clone(),
            ));
            sockets.push(socket);
        }

        Ok(Self {
            dict,
            sockets,
            next_socket: AtomicUsize::new(0),
            pending,
            cancel,
        })
    }

    /// Stop the reader loops and release the sockets
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Send a request with retransmission: up to `tries` attempts per
    /// destination, the destination list walked up to `server_tries`
    /// times. Each attempt gets a fresh identifier, unused among the
    /// in-flight requests toward that destination.
    pub async fn send(
        &self,
        packet: &RadiusPacket,
        destinations: &[SocketAddr],
        per_request_timeout: Duration,
        tries: u32,
        server_tries: u32,
        secret: &str,
    ) -> Result<RadiusPacket> {
        if destinations.is_empty() {
            return Err(IgorError::Config("no destinations".to_string()));
        }

        for _server_try in 0..server_tries.max(1) {
            for destination in destinations {
                for _attempt in 0..tries.max(1) {
                    match self
                        .attempt(packet, *destination, per_request_timeout, secret)
                        .await?
                    {
                        Some(response) => {
                            RADIUS_CLIENT_RESPONSES
                                .with_label_values(&[
                                    &destination.to_string(),
                                    &response.code.to_string(),
                                ])
                                .inc();
                            return Ok(response);
                        }
                        None => {
                            RADIUS_CLIENT_TIMEOUTS
                                .with_label_values(&[&destination.to_string()])
                                .inc();
                            debug!(destination = %destination, "radius attempt timed out");
                        }
                    }
                }
            }
        }

        Err(IgorError::Timeout)
    }

    // One send attempt. Ok(None) is a timeout; hard failures (identifier
    // exhaustion, socket errors) abort the whole send.
    async fn attempt(
        &self,
        packet: &RadiusPacket,
        destination: SocketAddr,
        per_request_timeout: Duration,
        secret: &str,
    ) -> Result<Option<RadiusPacket>> {
        let mut attempt = packet.clone();

        let (reply_tx, reply_rx) = oneshot::channel();
        let identifier = self.allocate_identifier(destination, secret, reply_tx)?;
        attempt.identifier = identifier;

        let bytes = match attempt.to_bytes(secret) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.pending.remove(&(destination, identifier));
                return Err(e);
            }
        };

        // The wire authenticator keys the response validation; fix up the
        // entry now that serialization computed it
        let request_authenticator: [u8; 16] = bytes[4..20].try_into().unwrap();
        if let Some(mut entry) = self.pending.get_mut(&(destination, identifier)) {
            entry.request_authenticator = request_authenticator;
        }

        let socket = self.pick_socket();
        if let Err(e) = socket.send_to(&bytes, destination).await {
            self.pending.remove(&(destination, identifier));
            return Err(e.into());
        }
        RADIUS_CLIENT_REQUESTS
            .with_label_values(&[&destination.to_string(), &attempt.code.to_string()])
            .inc();

        match tokio::time::timeout(per_request_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            // Reader dropped the slot without filling it
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                // Free the identifier for later attempts
                self.pending.remove(&(destination, identifier));
                Ok(None)
            }
        }
    }

    fn pick_socket(&self) -> Arc<UdpSocket> {
        let index = self.next_socket.fetch_add(1, Ordering::Relaxed) % self.sockets.len();
        self.sockets[index].clone()
    }

    // Reserve an identifier unused among the in-flight requests toward
    // this destination
    fn allocate_identifier(
        &self,
        destination: SocketAddr,
        secret: &str,
        reply_to: oneshot::Sender<RadiusPacket>,
    ) -> Result<u8> {
        let start: u8 = rand::random();
        let mut entry = Some(PendingRequest {
            secret: secret.to_string(),
            request_authenticator: [0u8; 16],
            reply_to,
        });

        for offset in 0..=255u16 {
            let identifier = (start as u16 + offset) as u8;
            if let Entry::Vacant(vacant) = self.pending.entry((destination, identifier)) {
                vacant.insert(entry.take().unwrap());
                return Ok(identifier);
            }
        }

        Err(IgorError::DuplicateId(format!(
            "no free identifier toward {destination}"
        )))
    }

    pub fn dictionary(&self) -> &Arc<RadiusDictionary> {
        &self.dict
    }
}

impl Drop for RadiusClientEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// Demultiplex responses arriving on one pool socket to their pending
// entries by (source, identifier)
async fn reader_loop(
    socket: Arc<UdpSocket>,
    dict: Arc<RadiusDictionary>,
    pending: PendingMap,
    cancel: CancellationToken,
) {
    let mut buffer = [0u8; RADIUS_MAX_PACKET_SIZE];

    loop {
        let (size, remote) = tokio::select! {
            _ = cancel.cancelled() => return,
            result = socket.recv_from(&mut buffer) => match result {
                Ok(received) => received,
                Err(_) => continue,
            },
        };

        if size < 20 {
            continue;
        }
        let datagram = Bytes::copy_from_slice(&buffer[..size]);
        let identifier = datagram[1];
        let key = (remote, identifier);

        // Validate before consuming the entry so a forged datagram does
        // not cancel the real response
        let valid = match pending.get(&key) {
            Some(entry) => validate_response_authenticator(
                &datagram,
                &entry.request_authenticator,
                &entry.secret,
            ),
            None => {
                debug!(remote = %remote, identifier, "response with no pending request");
                continue;
            }
        };
        if !valid {
            warn!(remote = %remote, identifier, "invalid response authenticator");
            continue;
        }

        let Some((_, entry)) = pending.remove(&key) else {
            continue;
        };
        match RadiusPacket::from_bytes(
            &datagram,
            &entry.secret,
            Some(&entry.request_authenticator),
            &dict,
        ) {
            Ok(response) => {
                let _ = entry.reply_to.send(response);
            }
            Err(e) => {
                warn!(remote = %remote, error = %e, "could not decode response");
            }
        }
    }
}
