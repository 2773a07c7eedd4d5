use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use igor_config::{DiameterPeerConfig, DiameterPeersConfig, DiameterServerConfig};
use igor_core::constants::{
    CMD_CAPABILITIES_EXCHANGE, CMD_DEVICE_WATCHDOG, CMD_DISCONNECT_PEER, DIAMETER_SUCCESS,
    DIAMETER_UNKNOWN_PEER, EVENT_LOOP_CAPACITY,
};
use igor_core::{IgorError, Result};
use igor_dict::DiameterDictionary;
use igor_diameter::DiameterMessage;
use igor_metrics::{
    DIAMETER_ANSWERS_RECEIVED, DIAMETER_ANSWERS_SENT, DIAMETER_ENGAGED_PEERS,
    DIAMETER_REQUESTS_RECEIVED, DIAMETER_REQUESTS_SENT, DIAMETER_REQUEST_TIMEOUTS,
    DIAMETER_STALLED_ANSWERS,
};

use crate::events::{PeerControlEvent, PeerEvent, PeerStatus, ReplySlot};

// Close the connection when this many watchdog requests are unanswered
const MAX_OUTSTANDING_DWA: u32 = 2;

// Placeholder period until the CER/CEA exchange fixes the real one
const IDLE_WATCHDOG: Duration = Duration::from_secs(3600);

/// Handler for non-base requests received from a peer. Invoked on a child
/// task; on error no answer is transmitted and the remote times out.
#[async_trait]
pub trait DiameterHandler: Send + Sync {
    async fn handle(&self, request: DiameterMessage) -> Result<DiameterMessage>;
}

/// Context shared by every peer of one server instance
pub struct PeerSettings {
    pub dict: Arc<DiameterDictionary>,
    pub server: DiameterServerConfig,
    /// Configured peer table, used to validate incoming CERs
    pub peers: DiameterPeersConfig,
    /// Application codes advertised in CER and CEA
    pub auth_applications: Vec<u32>,
    pub acct_applications: Vec<u32>,
}

/// Handle on a peer actor. The actor owns all mutable state (socket,
/// pending table, status); the handle communicates with it exclusively
/// through the event channel.
#[derive(Clone)]
pub struct DiameterPeer {
    key: u64,
    configured_host: Option<String>,
    event_tx: mpsc::Sender<PeerEvent>,
    status_rx: watch::Receiver<PeerStatus>,
}

impl DiameterPeer {
    /// Create a peer that dials the remote endpoint and initiates the
    /// CER/CEA handshake
    pub fn new_active(
        key: u64,
        settings: Arc<PeerSettings>,
        peer_config: DiameterPeerConfig,
        control_tx: mpsc::Sender<PeerControlEvent>,
        handler: Arc<dyn DiameterHandler>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_LOOP_CAPACITY);
        let (status_tx, status_rx) = watch::channel(PeerStatus::Connecting);

        debug!(peer = %peer_config.diameter_host, "creating active diameter peer");

        let connect_cancel = CancellationToken::new();
        spawn_dialer(&peer_config, event_tx.clone(), connect_cancel.clone());

        let actor = PeerActor {
            key,
            settings,
            peer_config: Some(peer_config.clone()),
            status: PeerStatus::Connecting,
            status_tx,
            event_tx: event_tx.clone(),
            event_rx,
            control_tx,
            handler,
            writer: None,
            remote_addr: None,
            read_task: None,
            read_cancel: CancellationToken::new(),
            connect_cancel,
            pending: HashMap::new(),
            outstanding_dwa: 0,
            watchdog: idle_watchdog(),
            engaged_host: None,
            peer_down_sent: false,
        };
        tokio::spawn(actor.run());

        Self {
            key,
            configured_host: Some(peer_config.diameter_host),
            event_tx,
            status_rx,
        }
    }

    /// Create a peer over an already accepted connection. The identity is
    /// learned from the CER and reported in the PeerUp event.
    pub fn new_passive(
        key: u64,
        settings: Arc<PeerSettings>,
        stream: TcpStream,
        control_tx: mpsc::Sender<PeerControlEvent>,
        handler: Arc<dyn DiameterHandler>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_LOOP_CAPACITY);
        let (status_tx, status_rx) = watch::channel(PeerStatus::Connected);

        let remote_addr = stream.peer_addr().ok();
        debug!(remote = ?remote_addr, "creating passive diameter peer");

        let (read_half, write_half) = stream.into_split();
        let read_cancel = CancellationToken::new();
        let read_task = spawn_read_loop(
            read_half,
            settings.dict.clone(),
            event_tx.clone(),
            read_cancel.clone(),
        );

        let actor = PeerActor {
            key,
            settings,
            peer_config: None,
            status: PeerStatus::Connected,
            status_tx,
            event_tx: event_tx.clone(),
            event_rx,
            control_tx,
            handler,
            writer: Some(write_half),
            remote_addr,
            read_task: Some(read_task),
            read_cancel,
            connect_cancel: CancellationToken::new(),
            pending: HashMap::new(),
            outstanding_dwa: 0,
            watchdog: idle_watchdog(),
            engaged_host: None,
            peer_down_sent: false,
        };
        tokio::spawn(actor.run());

        Self {
            key,
            configured_host: None,
            event_tx,
            status_rx,
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// The configured Diameter host for active peers; passive peers report
    /// theirs in the PeerUp event
    pub fn configured_host(&self) -> Option<&str> {
        self.configured_host.as_deref()
    }

    pub fn status(&self) -> PeerStatus {
        *self.status_rx.borrow()
    }

    /// Send a request and wait for the answer or an error. The timeout is
    /// owned by the caller: on expiry a cancellation is sent to the actor,
    /// which is the authority on whether the entry still exists.
    pub async fn request(
        &self,
        mut message: DiameterMessage,
        timeout: Duration,
    ) -> Result<DiameterMessage> {
        if message.application_id == 0 {
            return Err(IgorError::Protocol(
                "base application messages are handled by the peer itself".to_string(),
            ));
        }
        if !message.is_request {
            return Err(IgorError::Protocol("message is not a request".to_string()));
        }
        if self.status() != PeerStatus::Engaged {
            return Err(IgorError::Protocol(format!(
                "peer is not engaged: {:?}",
                self.status()
            )));
        }

        if message.hop_by_hop_id == 0 {
            message.hop_by_hop_id = rand::random();
        }
        let hop_by_hop_id = message.hop_by_hop_id;
        let command_code = message.command_code;
        let peer = self.configured_host.clone().unwrap_or_default();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.event_tx
            .send(PeerEvent::Egress {
                message,
                reply_to: Some(reply_tx),
            })
            .await
            .map_err(|_| IgorError::Protocol("peer event loop is closed".to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            // The actor dropped the slot without filling it: it is gone
            Ok(Err(_)) => Err(IgorError::Protocol("peer closed".to_string())),
            Err(_) => {
                let _ = self
                    .event_tx
                    .send(PeerEvent::Cancel { hop_by_hop_id })
                    .await;
                DIAMETER_REQUEST_TIMEOUTS
                    .with_label_values(&[&peer, &command_code.to_string()])
                    .inc();
                Err(IgorError::Timeout)
            }
        }
    }

    /// Send a request and invoke the callback with the answer or error
    pub fn request_async<F>(&self, message: DiameterMessage, timeout: Duration, callback: F)
    where
        F: FnOnce(Result<DiameterMessage>) + Send + 'static,
    {
        let peer = self.clone();
        tokio::spawn(async move {
            callback(peer.request(message, timeout).await);
        });
    }

    /// Initiate an orderly disconnection. A PeerDown event will follow on
    /// the control channel.
    pub async fn disengage(&self) {
        let _ = self.event_tx.send(PeerEvent::Close).await;
    }
}

fn idle_watchdog() -> Interval {
    let mut interval = interval_at(Instant::now() + IDLE_WATCHDOG, IDLE_WATCHDOG);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

// Dial the remote endpoint with a cancellable deadline, then report to
// the event loop
fn spawn_dialer(
    config: &DiameterPeerConfig,
    event_tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    let addr = format!("{}:{}", config.ip_address, config.port);
    let timeout = Duration::from_millis(config.connection_timeout_millis);

    tokio::spawn(async move {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(timeout, TcpStream::connect(&addr)) => match result {
                Ok(Ok(stream)) => PeerEvent::ConnectionEstablished(stream),
                Ok(Err(e)) => PeerEvent::ConnectionError(e.into()),
                Err(_) => PeerEvent::ConnectionError(IgorError::Timeout),
            },
        };
        let _ = event_tx.send(event).await;
    });
}

// Read framed messages and feed them to the event loop until EOF, error
// or cancellation
fn spawn_read_loop(
    mut read_half: OwnedReadHalf,
    dict: Arc<DiameterDictionary>,
    event_tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = DiameterMessage::read_from(&mut read_half, &dict) => result,
            };
            match result {
                Ok(message) => {
                    if event_tx.send(PeerEvent::Ingress(message)).await.is_err() {
                        return;
                    }
                }
                Err(IgorError::Network(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    let _ = event_tx.try_send(PeerEvent::ReadEof);
                    return;
                }
                Err(e) => {
                    let _ = event_tx.try_send(PeerEvent::ReadError(e));
                    return;
                }
            }
        }
    })
}

enum Flow {
    Continue,
    Exit,
}

// The actor: single logical thread of control owning socket, pending
// table and status
struct PeerActor {
    key: u64,
    settings: Arc<PeerSettings>,
    // Configured for active peers, learned from the CER for passive ones
    peer_config: Option<DiameterPeerConfig>,
    status: PeerStatus,
    status_tx: watch::Sender<PeerStatus>,
    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: mpsc::Receiver<PeerEvent>,
    control_tx: mpsc::Sender<PeerControlEvent>,
    handler: Arc<dyn DiameterHandler>,
    writer: Option<OwnedWriteHalf>,
    remote_addr: Option<SocketAddr>,
    read_task: Option<JoinHandle<()>>,
    read_cancel: CancellationToken,
    connect_cancel: CancellationToken,
    // Outstanding requests: hop-by-hop identifier to single-shot slot
    pending: HashMap<u32, ReplySlot>,
    outstanding_dwa: u32,
    watchdog: Interval,
    engaged_host: Option<String>,
    peer_down_sent: bool,
}

impl PeerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.watchdog.tick() => {
                    if self.status == PeerStatus::Engaged {
                        if let Flow::Exit = self.handle_watchdog().await {
                            return;
                        }
                    }
                }
                event = self.event_rx.recv() => match event {
                    Some(event) => {
                        if let Flow::Exit = self.handle_event(event).await {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    }

    fn peer_label(&self) -> String {
        self.engaged_host
            .clone()
            .or_else(|| self.peer_config.as_ref().map(|c| c.diameter_host.clone()))
            .or_else(|| self.remote_addr.map(|a| a.to_string()))
            .unwrap_or_default()
    }

    fn set_status(&mut self, status: PeerStatus) {
        self.status = status;
        let _ = self.status_tx.send(status);
    }

    async fn handle_event(&mut self, event: PeerEvent) -> Flow {
        match event {
            PeerEvent::ConnectionEstablished(stream) => {
                debug!(peer = %self.peer_label(), "connection established");
                self.remote_addr = stream.peer_addr().ok();
                let (read_half, write_half) = stream.into_split();
                self.writer = Some(write_half);
                self.read_task = Some(spawn_read_loop(
                    read_half,
                    self.settings.dict.clone(),
                    self.event_tx.clone(),
                    self.read_cancel.clone(),
                ));
                self.set_status(PeerStatus::Connected);

                // Active peer: open with our CER
                match self.build_cer() {
                    Ok(cer) => self.send_or_close(cer).await,
                    Err(e) => {
                        error!(peer = %self.peer_label(), error = %e, "could not build CER");
                        self.do_close(Some(e)).await;
                        Flow::Exit
                    }
                }
            }

            PeerEvent::ConnectionError(e) => {
                error!(peer = %self.peer_label(), error = %e, "connection error");
                self.do_close(Some(e)).await;
                Flow::Exit
            }

            PeerEvent::ReadEof => {
                if self.status < PeerStatus::Closing {
                    debug!(peer = %self.peer_label(), "connection terminated by remote peer");
                }
                self.do_close(None).await;
                Flow::Exit
            }

            PeerEvent::ReadError(e) => {
                if self.status < PeerStatus::Closing {
                    error!(peer = %self.peer_label(), error = %e, "read error");
                    self.do_close(Some(e)).await;
                } else {
                    // The error is the read loop noticing our own close
                    self.do_close(None).await;
                }
                Flow::Exit
            }

            PeerEvent::Egress { message, reply_to } => self.handle_egress(message, reply_to).await,

            PeerEvent::Ingress(message) => self.handle_ingress(message).await,

            PeerEvent::Cancel { hop_by_hop_id } => {
                debug!(peer = %self.peer_label(), hop_by_hop_id, "cancelling request");
                match self.pending.remove(&hop_by_hop_id) {
                    Some(slot) => {
                        let _ = slot.send(Err(IgorError::Timeout));
                    }
                    None => {
                        // The answer won the race
                        debug!(peer = %self.peer_label(), hop_by_hop_id, "cancel for a request no longer pending");
                    }
                }
                Flow::Continue
            }

            PeerEvent::Close => {
                debug!(peer = %self.peer_label(), "processing close command");
                self.do_close(None).await;
                Flow::Exit
            }
        }
    }

    async fn handle_egress(
        &mut self,
        mut message: DiameterMessage,
        reply_to: Option<ReplySlot>,
    ) -> Flow {
        if !matches!(self.status, PeerStatus::Connected | PeerStatus::Engaged) {
            error!(
                peer = %self.peer_label(),
                code = message.command_code,
                status = ?self.status,
                "message not sent because of peer status"
            );
            if let Some(slot) = reply_to {
                let _ = slot.send(Err(IgorError::Protocol(format!(
                    "peer status is {:?}",
                    self.status
                ))));
            }
            return Flow::Continue;
        }

        if message.hop_by_hop_id == 0 {
            message.hop_by_hop_id = rand::random();
        }

        if let Some(slot) = reply_to {
            if self.pending.contains_key(&message.hop_by_hop_id) {
                let _ = slot.send(Err(IgorError::DuplicateId(format!(
                    "hop-by-hop id {} already pending",
                    message.hop_by_hop_id
                ))));
                return Flow::Continue;
            }

            match self.write_message(&message).await {
                Ok(()) => {
                    DIAMETER_REQUESTS_SENT
                        .with_label_values(&[&self.peer_label(), &message.command_code.to_string()])
                        .inc();
                    self.pending.insert(message.hop_by_hop_id, slot);
                    Flow::Continue
                }
                Err(e) => {
                    let _ = slot.send(Err(IgorError::Protocol(format!("write error: {e}"))));
                    self.do_close(Some(e)).await;
                    Flow::Exit
                }
            }
        } else {
            match self.write_message(&message).await {
                Ok(()) => {
                    let counter = if message.is_request {
                        &*DIAMETER_REQUESTS_SENT
                    } else {
                        &*DIAMETER_ANSWERS_SENT
                    };
                    counter
                        .with_label_values(&[&self.peer_label(), &message.command_code.to_string()])
                        .inc();
                    Flow::Continue
                }
                Err(e) => {
                    self.do_close(Some(e)).await;
                    Flow::Exit
                }
            }
        }
    }

    async fn handle_ingress(&mut self, message: DiameterMessage) -> Flow {
        debug!(peer = %self.peer_label(), message = %message, "received message");

        if message.is_request {
            DIAMETER_REQUESTS_RECEIVED
                .with_label_values(&[&self.peer_label(), &message.command_code.to_string()])
                .inc();

            if message.application_id == 0 {
                return self.handle_base_request(message).await;
            }

            // Non-base request: dispatch to the handler on a child task;
            // the answer comes back as an egress event
            let handler = self.handler.clone();
            let event_tx = self.event_tx.clone();
            let peer = self.peer_label();
            tokio::spawn(async move {
                match handler.handle(message).await {
                    Ok(answer) => {
                        let _ = event_tx
                            .send(PeerEvent::Egress {
                                message: answer,
                                reply_to: None,
                            })
                            .await;
                    }
                    Err(e) => {
                        // No answer is transmitted; the remote times out
                        error!(peer = %peer, error = %e, "handler error");
                    }
                }
            });
            Flow::Continue
        } else {
            DIAMETER_ANSWERS_RECEIVED
                .with_label_values(&[&self.peer_label(), &message.command_code.to_string()])
                .inc();

            if message.application_id == 0 {
                return self.handle_base_answer(message).await;
            }

            match self.pending.remove(&message.hop_by_hop_id) {
                Some(slot) => {
                    // Single shot: a slot is filled at most once
                    let _ = slot.send(Ok(message));
                }
                None => {
                    DIAMETER_STALLED_ANSWERS
                        .with_label_values(&[&self.peer_label()])
                        .inc();
                    warn!(peer = %self.peer_label(), message = %message, "stalled diameter answer");
                }
            }
            Flow::Continue
        }
    }

    async fn handle_base_request(&mut self, message: DiameterMessage) -> Flow {
        match message.command_code {
            CMD_CAPABILITIES_EXCHANGE => match self.handle_cer(&message) {
                Ok((cea, origin_host)) => {
                    if let Flow::Exit = self.send_or_close(cea).await {
                        return Flow::Exit;
                    }
                    self.engage(origin_host).await;
                    Flow::Continue
                }
                Err(e) => {
                    error!(peer = %self.peer_label(), error = %e, "CER rejected");
                    // Tell the remote why before disconnecting
                    if let Ok(mut cea) = self.build_answer(&message) {
                        let _ = cea.add(
                            "Result-Code",
                            DIAMETER_UNKNOWN_PEER,
                            &self.settings.dict,
                        );
                        let _ = self.write_message(&cea).await;
                    }
                    self.do_close(Some(e)).await;
                    Flow::Exit
                }
            },

            CMD_DEVICE_WATCHDOG => {
                let dwa = self.build_answer(&message).and_then(|mut dwa| {
                    dwa.add("Result-Code", DIAMETER_SUCCESS, &self.settings.dict)?;
                    Ok(dwa)
                });
                match dwa {
                    Ok(dwa) => self.send_or_close(dwa).await,
                    Err(e) => {
                        self.do_close(Some(e)).await;
                        Flow::Exit
                    }
                }
            }

            CMD_DISCONNECT_PEER => {
                debug!(peer = %self.peer_label(), "received disconnect peer request");
                if let Ok(mut dpa) = self.build_answer(&message) {
                    let _ = dpa.add("Result-Code", DIAMETER_SUCCESS, &self.settings.dict);
                    let _ = self.write_message(&dpa).await;
                }
                self.do_close(None).await;
                Flow::Exit
            }

            other => {
                warn!(peer = %self.peer_label(), code = other, "unhandled base application request");
                Flow::Continue
            }
        }
    }

    async fn handle_base_answer(&mut self, message: DiameterMessage) -> Flow {
        match message.command_code {
            CMD_CAPABILITIES_EXCHANGE => {
                let expected_host = self
                    .peer_config
                    .as_ref()
                    .map(|c| c.diameter_host.clone())
                    .unwrap_or_default();

                let failure = if self.status != PeerStatus::Connected {
                    Some(format!("CEA received in status {:?}", self.status))
                } else if message.origin_host().as_deref() != Some(expected_host.as_str()) {
                    Some(format!(
                        "CEA Origin-Host {:?} does not match {}",
                        message.origin_host(),
                        expected_host
                    ))
                } else if message.get_result_code() != Some(DIAMETER_SUCCESS) {
                    // Any non-success Result-Code closes the connection
                    Some(format!(
                        "CEA Result-Code {:?}",
                        message.get_result_code()
                    ))
                } else {
                    None
                };

                match failure {
                    None => {
                        self.engage(expected_host).await;
                        Flow::Continue
                    }
                    Some(reason) => {
                        error!(peer = %self.peer_label(), reason = %reason, "capabilities exchange failed");
                        self.do_close(Some(IgorError::Protocol(reason))).await;
                        Flow::Exit
                    }
                }
            }

            CMD_DEVICE_WATCHDOG => {
                if message.get_result_code() == Some(DIAMETER_SUCCESS) {
                    debug!(peer = %self.peer_label(), "received DWA");
                    self.outstanding_dwa = self.outstanding_dwa.saturating_sub(1);
                    Flow::Continue
                } else {
                    let reason = format!(
                        "bad result code in answer to DWR: {:?}",
                        message.get_result_code()
                    );
                    error!(peer = %self.peer_label(), reason = %reason, "watchdog failed");
                    self.do_close(Some(IgorError::Protocol(reason))).await;
                    Flow::Exit
                }
            }

            other => {
                warn!(peer = %self.peer_label(), code = other, "unhandled base application answer");
                Flow::Continue
            }
        }
    }

    async fn handle_watchdog(&mut self) -> Flow {
        if self.outstanding_dwa >= MAX_OUTSTANDING_DWA {
            error!(
                peer = %self.peer_label(),
                outstanding = self.outstanding_dwa,
                "too many unanswered watchdog requests"
            );
            self.do_close(Some(IgorError::Protocol(
                "watchdog requests unanswered".to_string(),
            )))
            .await;
            return Flow::Exit;
        }

        debug!(peer = %self.peer_label(), "watchdog tick");
        let dwr = self.build_request("Device-Watchdog");
        match dwr {
            Ok(dwr) => {
                self.outstanding_dwa += 1;
                self.send_or_close(dwr).await
            }
            Err(e) => {
                self.do_close(Some(e)).await;
                Flow::Exit
            }
        }
    }

    // Validate an incoming CER against the configured peer table and the
    // origin network ACL. On success returns the CEA and the engaged host.
    fn handle_cer(&mut self, message: &DiameterMessage) -> Result<(DiameterMessage, String)> {
        if self.status != PeerStatus::Connected {
            return Err(IgorError::Protocol(format!(
                "CER received in status {:?}",
                self.status
            )));
        }

        let origin_host = message
            .origin_host()
            .ok_or_else(|| IgorError::Protocol("CER without Origin-Host".to_string()))?;

        let remote_ip = self
            .remote_addr
            .map(|a| a.ip())
            .ok_or_else(|| IgorError::Protocol("no remote address".to_string()))?;

        if !self.settings.peers.validate_incoming(&origin_host, remote_ip) {
            return Err(IgorError::Protocol(format!(
                "peer {origin_host} at {remote_ip} not allowed"
            )));
        }

        // Grab the peer configuration, the watchdog interval in particular
        self.peer_config = Some(self.settings.peers.find_peer(&origin_host)?.clone());

        let mut cea = self.build_answer(message)?;
        cea.add("Result-Code", DIAMETER_SUCCESS, &self.settings.dict)?;
        self.push_ce_attributes(&mut cea)?;

        Ok((cea, origin_host))
    }

    async fn engage(&mut self, diameter_host: String) {
        self.set_status(PeerStatus::Engaged);
        self.engaged_host = Some(diameter_host.clone());
        self.outstanding_dwa = 0;

        // Arm the watchdog with the configured interval
        let interval = self
            .peer_config
            .as_ref()
            .map(|c| Duration::from_millis(c.watchdog_interval_millis))
            .unwrap_or(IDLE_WATCHDOG);
        self.watchdog = interval_at(Instant::now() + interval, interval);
        self.watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        DIAMETER_ENGAGED_PEERS.inc();
        let _ = self
            .control_tx
            .send(PeerControlEvent::PeerUp {
                key: self.key,
                diameter_host,
            })
            .await;
    }

    fn build_request(&self, command: &str) -> Result<DiameterMessage> {
        let dict = &self.settings.dict;
        let mut message = DiameterMessage::new_request("Base", command, dict)?;
        message.add_origin_avps(
            &self.settings.server.diameter_host,
            &self.settings.server.diameter_realm,
            dict,
        )?;
        Ok(message)
    }

    fn build_answer(&self, request: &DiameterMessage) -> Result<DiameterMessage> {
        let dict = &self.settings.dict;
        let mut answer = DiameterMessage::new_answer(request);
        answer.add_origin_avps(
            &self.settings.server.diameter_host,
            &self.settings.server.diameter_realm,
            dict,
        )?;
        Ok(answer)
    }

    fn build_cer(&self) -> Result<DiameterMessage> {
        let mut cer = self.build_request("Capabilities-Exchange")?;
        self.push_ce_attributes(&mut cer)?;
        Ok(cer)
    }

    // Capability attributes common to CER and CEA
    fn push_ce_attributes(&self, message: &mut DiameterMessage) -> Result<()> {
        let dict = &self.settings.dict;
        let server = &self.settings.server;

        if server.bind_address != "0.0.0.0" {
            message.add("Host-IP-Address", server.bind_address.as_str(), dict)?;
        }
        message.add("Vendor-Id", server.vendor_id, dict)?;
        message.add("Product-Name", "igor", dict)?;
        message.add("Firmware-Revision", server.firmware_revision, dict)?;
        message.add("Origin-State-Id", 1u32, dict)?;
        for code in &self.settings.auth_applications {
            message.add("Auth-Application-Id", *code, dict)?;
        }
        for code in &self.settings.acct_applications {
            message.add("Acct-Application-Id", *code, dict)?;
        }
        Ok(())
    }

    async fn write_message(&mut self, message: &DiameterMessage) -> Result<()> {
        debug!(peer = %self.peer_label(), message = %message, "sending message");
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| IgorError::Protocol("no connection".to_string()))?;
        writer.write_all(&message.to_bytes()).await?;
        Ok(())
    }

    async fn send_or_close(&mut self, message: DiameterMessage) -> Flow {
        match self.write_message(&message).await {
            Ok(()) => {
                let counter = if message.is_request {
                    &*DIAMETER_REQUESTS_SENT
                } else {
                    &*DIAMETER_ANSWERS_SENT
                };
                counter
                    .with_label_values(&[&self.peer_label(), &message.command_code.to_string()])
                    .inc();
                Flow::Continue
            }
            Err(e) => {
                error!(peer = %self.peer_label(), error = %e, "write error");
                self.do_close(Some(e)).await;
                Flow::Exit
            }
        }
    }

    // Close everything and report PeerDown, exactly once. Idempotent.
    async fn do_close(&mut self, error: Option<IgorError>) {
        if self.peer_down_sent {
            return;
        }
        self.peer_down_sent = true;

        if self.status == PeerStatus::Engaged {
            DIAMETER_ENGAGED_PEERS.dec();
        }
        // No more requests are accepted past this point
        self.set_status(PeerStatus::Closing);

        // Stop a dialer that may still be running
        self.connect_cancel.cancel();

        // Closing the write half sends FIN; the read loop is told to stop
        // and awaited so no reader leaks
        self.writer = None;
        self.read_cancel.cancel();
        if let Some(task) = self.read_task.take() {
            task.abort();
            let _ = task.await;
        }

        // Fail every outstanding request
        for (_, slot) in self.pending.drain() {
            let _ = slot.send(Err(IgorError::Protocol("peer closed".to_string())));
        }

        self.set_status(PeerStatus::Closed);
        let _ = self
            .control_tx
            .send(PeerControlEvent::PeerDown {
                key: self.key,
                diameter_host: self.engaged_host.clone(),
                error,
            })
            .await;
    }
}
