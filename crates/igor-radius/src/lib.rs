// Shared-secret keyed cipher transforms
pub mod cipher;

// RADIUS attribute codec module
pub mod avp;

// RADIUS packet codec module
pub mod packet;

// Re-export commonly used types
pub use avp::{RadiusAvp, RadiusValue};
pub use packet::RadiusPacket;
