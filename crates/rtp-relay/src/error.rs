//! Error types for the relay

/// Result type alias using relay Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a relay session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing negotiation fields (session not created)
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Media engine could not allocate a pipeline, or the session table is full
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Media engine rejected the SDP offer
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Command issued outside the session state that supports it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Outbound send on the signaling connection failed
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Inbound signaling message could not be understood
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Media engine RPC failure
    #[error("Media engine error: {0}")]
    EngineError(String),

    /// Media engine did not answer in time
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Invalid startup configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is reported to the client as an `error` message.
    ///
    /// Transport errors are only logged: the transport they would travel on
    /// is the one that just failed.
    pub fn is_reported(&self) -> bool {
        !matches!(self, Error::TransportError(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::ConfigurationError(_) | Error::InvalidConfig(_))
    }

    /// Short taxonomy name, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigurationError(_) => "ConfigurationError",
            Error::ResourceExhausted(_) => "ResourceExhausted",
            Error::NegotiationFailed(_) => "NegotiationFailed",
            Error::InvalidState(_) => "InvalidState",
            Error::TransportError(_) => "TransportError",
            Error::MalformedMessage(_) => "MalformedMessage",
            Error::EngineError(_) => "EngineError",
            Error::OperationTimeout(_) => "OperationTimeout",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::SerializationError(_) => "SerializationError",
            Error::IoError(_) => "IoError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
