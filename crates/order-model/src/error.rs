use thiserror::Error;

/// Errors produced while turning a queue payload into an order document.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not a well-formed order document.
    #[error("Malformed order document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A timestamp could not be parsed, or carried no UTC offset.
    #[error("Invalid timestamp '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Result type for decoding operations.
pub type Result<T> = std::result::Result<T, DecodeError>;
