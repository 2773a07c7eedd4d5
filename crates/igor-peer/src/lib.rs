// Peer event and control types
pub mod events;

// The per-peer actor
pub mod peer;

// Re-export commonly used types
pub use events::{PeerControlEvent, PeerStatus};
pub use peer::{DiameterHandler, DiameterPeer, PeerSettings};
