use thiserror::Error;

/// Failure talking to (or understanding) an external AI collaborator.
///
/// These are external-service failures: the engine does not retry them
/// locally, it fails the job and lets the caller decide.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiError {
    /// Connection failed, timed out, or the body could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// Non-2xx response from the provider.
    #[error("api error: {0}")]
    Api(String),

    /// The response did not have the expected shape.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing API key or similar.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type AiResult<T> = Result<T, AiError>;
