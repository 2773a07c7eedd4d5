// Diameter AVP codec module
pub mod avp;

// Diameter message codec module
pub mod message;

// Re-export commonly used types
pub use avp::{AvpValue, DiameterAvp};
pub use message::DiameterMessage;
