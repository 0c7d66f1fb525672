use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use bytes::Bytes;
use opsgate_core::wire::{AgentMessage, PayloadType, PortFlag};
use opsgate_core::{CancelFlag, CancelState, DataStream, HandlerStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::*;

use crate::error::PortError;

/// One TCP connection forwarded over the session. When the local read
/// side fails, the connection is torn down and the pump parks until the
/// next inbound payload triggers a re-dial.
pub struct BasicPortSession {
    host: String,
    port: String,
    payload_size: usize,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reconnect_to_port: AtomicBool,
    reconnect_tx: Mutex<Option<mpsc::Sender<Result<OwnedReadHalf, PortError>>>>,
    disconnect: Notify,
    cancel: OnceLock<CancelFlag>,
}

impl BasicPortSession {
    pub fn new(host: impl Into<String>, port: impl Into<String>, payload_size: usize) -> Arc<Self> {
        Arc::new(BasicPortSession {
            host: host.into(),
            port: port.into(),
            payload_size,
            writer: Mutex::new(None),
            reconnect_to_port: AtomicBool::new(false),
            reconnect_tx: Mutex::new(None),
            disconnect: Notify::new(),
            cancel: OnceLock::new(),
        })
    }

    async fn dial(&self) -> Result<(OwnedReadHalf, OwnedWriteHalf), PortError> {
        let target = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&target)
            .await
            .map_err(|source| PortError::DialFailed { target, source })?;
        Ok(stream.into_split())
    }

    pub fn is_connection_available(&self) -> bool {
        !self.reconnect_to_port.load(Ordering::SeqCst)
    }

    /// Dials the destination and pumps local reads onto the stream
    /// until EOF, cancellation, or an unrecoverable reconnect failure.
    pub async fn run(
        self: &Arc<Self>,
        stream: Arc<DataStream>,
        cancel: CancelFlag,
    ) -> Result<(), PortError> {
        let _ = self.cancel.set(cancel.clone());

        let (mut reader, writer) = self.dial().await?;
        *self.writer.lock().await = Some(writer);

        let (reconnect_tx, mut reconnect_rx) = mpsc::channel(1);
        *self.reconnect_tx.lock().await = Some(reconnect_tx);

        let mut buf = vec![0u8; self.payload_size];
        loop {
            tokio::select! {
                _ = cancel.wait() => {
                    debug!("Cancelled, closing the local connection");
                    *self.writer.lock().await = None;
                    return Ok(());
                }
                _ = self.disconnect.notified() => {
                    debug!("Client asked to disconnect from the local port");
                    *self.writer.lock().await = None;
                    self.reconnect_to_port.store(true, Ordering::SeqCst);
                    match self.await_reconnect(&mut reconnect_rx, &cancel).await? {
                        Some(new_reader) => reader = new_reader,
                        None => return Ok(()),
                    }
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("Local connection closed");
                        return Ok(());
                    }
                    Ok(n) => {
                        if let Err(error) = stream
                            .send_stream_data(PayloadType::Output, &buf[..n])
                            .await
                        {
                            warn!(%error, "Failed to forward local data");
                        }
                    }
                    Err(error) => {
                        warn!(%error, "Local read failed, awaiting client-driven reconnect");
                        *self.writer.lock().await = None;
                        self.reconnect_to_port.store(true, Ordering::SeqCst);
                        match self.await_reconnect(&mut reconnect_rx, &cancel).await? {
                            Some(new_reader) => reader = new_reader,
                            None => return Ok(()),
                        }
                    }
                }
            }
        }
    }

    async fn await_reconnect(
        &self,
        reconnect_rx: &mut mpsc::Receiver<Result<OwnedReadHalf, PortError>>,
        cancel: &CancelFlag,
    ) -> Result<Option<OwnedReadHalf>, PortError> {
        tokio::select! {
            _ = cancel.wait() => Ok(None),
            outcome = reconnect_rx.recv() => match outcome {
                Some(Ok(reader)) => Ok(Some(reader)),
                Some(Err(error)) => Err(error),
                None => Ok(None),
            }
        }
    }

    /// Inbound payload dispatch, called with strictly ordered frames.
    pub async fn handle(&self, message: &AgentMessage) -> Result<HandlerStatus> {
        match message.payload_kind() {
            Some(PayloadType::Output) => {
                if self.reconnect_to_port.load(Ordering::SeqCst) {
                    info!(host = %self.host, port = %self.port, "Reconnecting to the local port");
                    match self.dial().await {
                        Ok((reader, writer)) => {
                            *self.writer.lock().await = Some(writer);
                            self.reconnect_to_port.store(false, Ordering::SeqCst);
                            if let Some(tx) = self.reconnect_tx.lock().await.as_ref() {
                                let _ = tx.send(Ok(reader)).await;
                            }
                        }
                        Err(error) => {
                            if let Some(tx) = self.reconnect_tx.lock().await.as_ref() {
                                let _ = tx
                                    .send(Err(PortError::DialFailed {
                                        target: format!("{}:{}", self.host, self.port),
                                        source: std::io::Error::other(error.to_string()),
                                    }))
                                    .await;
                            }
                            return Err(error.into());
                        }
                    }
                }

                let mut guard = self.writer.lock().await;
                match guard.as_mut() {
                    Some(writer) => {
                        writer.write_all(&message.payload).await?;
                        Ok(HandlerStatus::Handled)
                    }
                    None => Ok(HandlerStatus::NotReady),
                }
            }
            Some(PayloadType::Flag) => {
                match PortFlag::from_wire(&message.payload) {
                    Some(PortFlag::DisconnectToPort) => {
                        debug!("DisconnectToPort received");
                        self.disconnect.notify_one();
                    }
                    Some(PortFlag::TerminateSession) => {
                        debug!("TerminateSession received");
                        if let Some(cancel) = self.cancel.get() {
                            cancel.set(CancelState::Cancelled);
                        }
                    }
                    other => warn!(?other, "Ignoring unexpected flag"),
                }
                Ok(HandlerStatus::Handled)
            }
            other => {
                debug!(payload_type = ?other, "Ignoring payload");
                Ok(HandlerStatus::Handled)
            }
        }
    }
}
