//! Pipe-backed fallback terminal: runs the configured command under
//! `/bin/sh` with piped stdio. Used for non-interactive command
//! sessions and wherever the embedding agent supplies no real PTY
//! factory. Resize is a no-op since pipes have no geometry.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tracing::*;

use crate::error::ShellError;
use crate::pty::{PtyControl, PtyFactory, PtyPair, PtyRequest};

const DEFAULT_SHELL: &str = "/bin/sh";

pub struct PipePtyFactory {
    shell: String,
}

impl Default for PipePtyFactory {
    fn default() -> Self {
        PipePtyFactory {
            shell: DEFAULT_SHELL.to_owned(),
        }
    }
}

impl PipePtyFactory {
    pub fn new(shell: impl Into<String>) -> Self {
        PipePtyFactory {
            shell: shell.into(),
        }
    }
}

struct PipeControl {
    exit: watch::Receiver<Option<i32>>,
    kill: Arc<Notify>,
}

#[async_trait]
impl PtyControl for PipeControl {
    async fn resize(&self, _cols: u32, _rows: u32) -> Result<(), ShellError> {
        Ok(())
    }

    async fn wait(&self) -> Result<i32, ShellError> {
        let mut exit = self.exit.clone();
        loop {
            if let Some(code) = *exit.borrow_and_update() {
                return Ok(code);
            }
            exit.changed()
                .await
                .map_err(|_| ShellError::ControlFailed("process reaper gone".to_owned()))?;
        }
    }

    async fn stop(&self) -> Result<(), ShellError> {
        self.kill.notify_one();
        Ok(())
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(1)
    }
}

#[async_trait]
impl PtyFactory for PipePtyFactory {
    async fn spawn(&self, request: &PtyRequest) -> Result<PtyPair, ShellError> {
        let mut command = Command::new(&self.shell);
        if let Some(line) = &request.command {
            command.arg("-c").arg(line);
        } else {
            command.arg("-i");
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|error| ShellError::PtySpawnFailed(error.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ShellError::PtySpawnFailed("no stdin handle".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ShellError::PtySpawnFailed("no stdout handle".to_owned()))?;
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let kill_signal = kill.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => {
                        let _ = exit_tx.send(Some(exit_code(status)));
                    }
                    Err(error) => {
                        warn!(%error, "Failed waiting on the child process");
                        let _ = exit_tx.send(Some(1));
                    }
                },
                _ = kill_signal.notified() => {
                    let _ = child.kill().await;
                    let code = child
                        .wait()
                        .await
                        .map(exit_code)
                        .unwrap_or(1);
                    let _ = exit_tx.send(Some(code));
                }
            }
        });

        Ok(PtyPair {
            reader: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            writer: Box::new(stdin),
            control: Box::new(PipeControl {
                exit: exit_rx,
                kill,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_runs_a_command_and_reports_exit_code() {
        let factory = PipePtyFactory::default();
        let mut pair = factory
            .spawn(&PtyRequest {
                command: Some("printf hello; exit 3".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut out = Vec::new();
        pair.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(pair.control.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stop_terminates_the_process() {
        let factory = PipePtyFactory::default();
        let pair = factory
            .spawn(&PtyRequest {
                command: Some("sleep 60".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();

        pair.control.stop().await.unwrap();
        let code = pair.control.wait().await.unwrap();
        assert_ne!(code, 0);
    }
}
