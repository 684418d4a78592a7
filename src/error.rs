use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid config for {entity}: {reason}")]
    ConfigInvalid { entity: String, reason: String },
    #[error("request body exceeds {0} byte limit")]
    BodyTooLarge(usize),
    #[error("failed to read request body: {0}")]
    BodyRead(String),
    #[error("provider {0:?} not found")]
    ProviderMissing(String),
    #[error("failed to set model field: {0}")]
    ModelOverride(String),
    #[error("upstream request failed: {0}")]
    UpstreamDispatch(#[from] reqwest::Error),
    #[error("request signing failed: {0}")]
    Signing(String),
    #[error("all attempts exhausted")]
    AttemptsExhausted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
