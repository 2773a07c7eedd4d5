// Error types module
pub mod error;

// Protocol constants module
pub mod constants;

// Re-export commonly used types
pub use error::{IgorError, Result};
