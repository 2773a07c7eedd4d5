// Routing rule matching and peer selection
pub mod rules;

// The router supervisor owning the peer table
pub mod router;

// Re-export commonly used types
pub use router::DiameterRouter;
pub use rules::{advertised_applications, RoutingRules};
