use tokio::net::TcpStream;
use tokio::sync::oneshot;

use igor_core::{IgorError, Result};
use igor_diameter::DiameterMessage;

/// Lifecycle status of a peer. Ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerStatus {
    /// Dialing the remote endpoint (active peers)
    Connecting,
    /// Transport up, CER/CEA not yet completed
    Connected,
    /// CER/CEA completed, eligible for request routing
    Engaged,
    /// Disconnection in progress, no more requests accepted
    Closing,
    /// Event loop terminated
    Closed,
}

/// Single-shot slot an answer or error is delivered into
pub(crate) type ReplySlot = oneshot::Sender<Result<DiameterMessage>>;

/// Events processed by the peer event loop. All state mutations happen in
/// response to one of these, in FIFO order of arrival.
pub(crate) enum PeerEvent {
    /// The dialer task established the connection (active peers)
    ConnectionEstablished(TcpStream),
    /// The dialer task failed or timed out
    ConnectionError(IgorError),
    /// The read loop saw a clean EOF
    ReadEof,
    /// The read loop failed
    ReadError(IgorError),
    /// A message to write to the peer. Requests with a reply slot get a
    /// pending-table entry keyed by hop-by-hop identifier.
    Egress {
        message: DiameterMessage,
        reply_to: Option<ReplySlot>,
    },
    /// A message read from the peer
    Ingress(DiameterMessage),
    /// A request timer fired: remove the pending entry and fail it
    Cancel { hop_by_hop_id: u32 },
    /// Orderly disconnection
    Close,
}

/// Lifecycle reports on the control channel, consumed by the router
#[derive(Debug)]
pub enum PeerControlEvent {
    /// CER/CEA completed. For passive peers the Diameter host is the one
    /// reported in the CER; the router must enforce that no other engaged
    /// peer exists for it.
    PeerUp { key: u64, diameter_host: String },
    /// Terminal: the peer is down and may be recycled
    PeerDown {
        key: u64,
        diameter_host: Option<String>,
        error: Option<IgorError>,
    },
}
