use std::error::Error;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum OpsgateError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("deserialization failed: {0}")]
    DeserializeJson(#[from] serde_json::Error),
    #[error("failed to parse URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("unknown session type {0}")]
    UnknownSessionType(String),
    #[error("insecure file {path:?}: {reason}")]
    InsecureFile { path: PathBuf, reason: String },
    #[error("Session end")]
    SessionEnd,
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl OpsgateError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
