// The RADIUS UDP server socket
pub mod server;

// The retrying client engine
pub mod client;

// Re-export commonly used types
pub use client::RadiusClientEngine;
pub use server::{RadiusHandler, RadiusServer};
