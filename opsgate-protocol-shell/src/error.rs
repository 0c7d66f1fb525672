#[derive(thiserror::Error, Debug)]
pub enum ShellError {
    #[error("failed to spawn the terminal: {0}")]
    PtySpawnFailed(String),
    #[error("terminal control failed: {0}")]
    ControlFailed(String),
    #[error("no command configured for this platform")]
    NoCommandForPlatform,
    #[error("invalid session properties: {0}")]
    InvalidProperties(#[from] serde_json::Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}
