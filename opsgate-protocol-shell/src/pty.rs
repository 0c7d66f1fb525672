//! Abstract terminal surface. How a PTY is actually spawned is
//! OS-specific and supplied by the embedding agent; the session only
//! needs byte-stream handles and resize/stop/wait control.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ShellError;

#[derive(Debug, Clone, Default)]
pub struct PtyRequest {
    /// Command to run instead of the default login shell.
    pub command: Option<String>,
    pub run_as_elevated: bool,
    pub cols: u32,
    pub rows: u32,
}

#[async_trait]
pub trait PtyControl: Send + Sync {
    async fn resize(&self, cols: u32, rows: u32) -> Result<(), ShellError>;

    /// Waits for the process to exit and returns its exit code.
    async fn wait(&self) -> Result<i32, ShellError>;

    async fn stop(&self) -> Result<(), ShellError>;
}

pub struct PtyPair {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Present only when the factory keeps stderr separate (pipe-backed
    /// command execution); a real PTY merges the streams.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub control: Box<dyn PtyControl>,
}

#[async_trait]
pub trait PtyFactory: Send + Sync {
    async fn spawn(&self, request: &PtyRequest) -> Result<PtyPair, ShellError>;
}
