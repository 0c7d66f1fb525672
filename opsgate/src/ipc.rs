//! Worker-side message bus: answers health and termination requests
//! from the supervising parent over its well-known local sockets. The
//! worker always dials; the parent listens. Respondent failures are
//! contained and retried so they can never take the worker down.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use opsgate_common::WorkerConfig;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::*;

const WORKER_MODE_LONG_RUNNING: &str = "LongRunning";

#[derive(Debug, Deserialize)]
#[serde(tag = "Type")]
enum ParentRequest {
    GetWorkerHealthRequest,
    TerminateWorkerRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HealthResult<'a> {
    worker_name: &'a str,
    mode: &'a str,
    pid: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TerminateResult {
    success: bool,
}

pub struct IpcHandles {
    /// Receives `true` once the parent asked the worker to terminate.
    pub termination_rx: mpsc::Receiver<bool>,
    /// Receives `true` once the termination channel is established.
    pub termination_connected_rx: mpsc::Receiver<bool>,
}

pub struct WorkerIpcBus {
    config: WorkerConfig,
    worker_name: String,
}

impl WorkerIpcBus {
    pub fn new(config: WorkerConfig, worker_name: String) -> Self {
        WorkerIpcBus {
            config,
            worker_name,
        }
    }

    pub fn start(self) -> IpcHandles {
        let (termination_tx, termination_rx) = mpsc::channel(1);
        let (connected_tx, termination_connected_rx) = mpsc::channel(1);

        let health_socket = self.config.health_socket.clone();
        let retry_delay = self.config.health_frequency;
        let worker_name = self.worker_name.clone();
        supervise("health", move || {
            let socket = health_socket.clone();
            let worker_name = worker_name.clone();
            async move { health_respondent(socket, retry_delay, worker_name).await }
        });

        let termination_socket = self.config.termination_socket.clone();
        supervise("termination", move || {
            let socket = termination_socket.clone();
            let termination_tx = termination_tx.clone();
            let connected_tx = connected_tx.clone();
            async move {
                termination_respondent(socket, retry_delay, termination_tx, connected_tx).await
            }
        });

        IpcHandles {
            termination_rx,
            termination_connected_rx,
        }
    }
}

/// Runs a respondent in its own task and restarts it if it panics.
fn supervise<F, Fut>(name: &'static str, mut factory: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let task = tokio::spawn(factory());
            match task.await {
                Ok(()) => break,
                Err(error) if error.is_panic() => {
                    error!(respondent = name, %error, "Respondent panicked, restarting");
                }
                Err(_) => break,
            }
        }
    });
}

async fn reply<T: Serialize>(writer: &mut OwnedWriteHalf, body: &T) -> Result<()> {
    let mut line = serde_json::to_vec(body)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

async fn health_respondent(socket: PathBuf, retry_delay: Duration, worker_name: String) {
    loop {
        let conn = match UnixStream::connect(&socket).await {
            Ok(conn) => conn,
            Err(error) => {
                debug!(?socket, %error, "Health socket not reachable yet");
                tokio::time::sleep(retry_delay).await;
                continue;
            }
        };

        let (read_half, mut write_half) = conn.into_split();
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<ParentRequest>(&line) {
                    Ok(ParentRequest::GetWorkerHealthRequest) => {
                        let result = HealthResult {
                            worker_name: &worker_name,
                            mode: WORKER_MODE_LONG_RUNNING,
                            pid: std::process::id(),
                        };
                        if let Err(error) = reply(&mut write_half, &result).await {
                            warn!(%error, "Failed to answer a health request");
                            break;
                        }
                    }
                    Ok(other) => debug!(?other, "Unexpected request on the health channel"),
                    Err(error) => warn!(%error, "Malformed health request"),
                },
                Ok(None) | Err(_) => break,
            }
        }
        tokio::time::sleep(retry_delay).await;
    }
}

async fn termination_respondent(
    socket: PathBuf,
    retry_delay: Duration,
    termination_tx: mpsc::Sender<bool>,
    connected_tx: mpsc::Sender<bool>,
) {
    let mut announced = false;
    loop {
        let conn = match UnixStream::connect(&socket).await {
            Ok(conn) => conn,
            Err(error) => {
                debug!(?socket, %error, "Termination socket not reachable yet");
                tokio::time::sleep(retry_delay).await;
                continue;
            }
        };
        if !announced {
            let _ = connected_tx.try_send(true);
            announced = true;
        }

        let (read_half, mut write_half) = conn.into_split();
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<ParentRequest>(&line) {
                    Ok(ParentRequest::TerminateWorkerRequest) => {
                        info!("Termination requested by the parent");
                        if let Err(error) =
                            reply(&mut write_half, &TerminateResult { success: true }).await
                        {
                            warn!(%error, "Failed to acknowledge termination");
                        }
                        let _ = termination_tx.try_send(true);
                        return;
                    }
                    Ok(other) => debug!(?other, "Unexpected request on the termination channel"),
                    Err(error) => warn!(%error, "Malformed termination request"),
                },
                Ok(None) | Err(_) => break,
            }
        }
        tokio::time::sleep(retry_delay).await;
    }
}
