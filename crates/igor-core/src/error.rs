use thiserror::Error;

/// Main error type for the igor AAA server
#[derive(Error, Debug)]
pub enum IgorError {
    // ========================================
    // Codec errors
    // ========================================
    #[error("malformed wire input: {0}")]
    Decode(String),

    #[error("attribute not found in dictionary: {0}")]
    UnknownAttribute(String),

    #[error("message does not conform to command schema: {0}")]
    Schema(String),

    // ========================================
    // Peer and routing errors
    // ========================================
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("timeout waiting for answer")]
    Timeout,

    #[error("duplicate identifier: {0}")]
    DuplicateId(String),

    #[error("no engaged peer for realm {realm} and application {application}")]
    NoRoute { realm: String, application: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    // ========================================
    // RADIUS errors
    // ========================================
    #[error("no configured secret for client {0}")]
    UnknownClient(String),

    #[error("invalid authenticator: {0}")]
    Auth(String),

    // ========================================
    // System errors
    // ========================================
    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IgorError {
    /// Convert error to a Diameter Result-Code
    pub fn to_result_code(&self) -> u32 {
        match self {
            Self::Decode(_) => crate::constants::DIAMETER_INVALID_AVP_VALUE,
            Self::Schema(_) => crate::constants::DIAMETER_MISSING_AVP,
            Self::NoRoute { .. } => crate::constants::DIAMETER_UNABLE_TO_DELIVER,
            Self::Timeout => crate::constants::DIAMETER_UNABLE_TO_DELIVER,
            Self::Protocol(_) => crate::constants::DIAMETER_UNKNOWN_PEER,
            _ => crate::constants::DIAMETER_UNABLE_TO_COMPLY,
        }
    }

    /// Check if a request failing with this error may be retried on
    /// another peer
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::DuplicateId(_))
    }
}

/// Result type alias for igor operations
pub type Result<T> = std::result::Result<T, IgorError>;
