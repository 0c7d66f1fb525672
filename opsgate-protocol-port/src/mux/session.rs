use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::*;

use super::frame::{Frame, MuxCommand, MAX_FRAME_PAYLOAD};
use super::MuxError;

const STREAM_BUFFER_FRAMES: usize = 256;
const WRITE_QUEUE_FRAMES: usize = 256;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Interval for server-driven keep-alives; None when the client
    /// owns the keep-alive.
    pub keep_alive: Option<Duration>,
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            keep_alive: Some(Duration::from_secs(5)),
            accept_backlog: 128,
        }
    }
}

/// Server end of a multiplexed tunnel: accepts streams the client
/// opens, routes data frames to them, and serializes all outbound
/// frames onto the carrier connection.
pub struct MuxSession {
    write_tx: mpsc::Sender<Frame>,
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MuxSession {
    pub fn server<S>(io: S, config: MuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(io);
        let (write_tx, mut write_rx) = mpsc::channel::<Frame>(WRITE_QUEUE_FRAMES);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if let Err(error) = write_half.write_all(&frame.encode()).await {
                    debug!(%error, "Carrier write failed");
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
        }));

        let stream_write_tx = write_tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut registry: HashMap<u32, mpsc::Sender<Bytes>> = HashMap::new();
            let mut buf = BytesMut::with_capacity(16 * 1024);
            'read: loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => (),
                    Err(error) => {
                        debug!(%error, "Carrier read failed");
                        break;
                    }
                }
                loop {
                    let frame = match Frame::decode(&mut buf) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(error) => {
                            warn!(%error, "Dropping corrupt carrier stream");
                            break 'read;
                        }
                    };
                    match frame.command {
                        MuxCommand::Syn => {
                            if registry.contains_key(&frame.stream_id) {
                                continue;
                            }
                            let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER_FRAMES);
                            registry.insert(frame.stream_id, data_tx);
                            let stream = MuxStream {
                                id: frame.stream_id,
                                data_rx,
                                write_tx: stream_write_tx.clone(),
                            };
                            if accept_tx.send(stream).await.is_err() {
                                break 'read;
                            }
                        }
                        MuxCommand::Psh => match registry.get(&frame.stream_id) {
                            Some(tx) => {
                                if tx.send(frame.data).await.is_err() {
                                    registry.remove(&frame.stream_id);
                                }
                            }
                            None => {
                                debug!(stream_id = frame.stream_id, "Data for unknown stream")
                            }
                        },
                        MuxCommand::Fin => {
                            registry.remove(&frame.stream_id);
                        }
                        MuxCommand::Nop => (),
                    }
                }
            }
            // Dropping the registry ends every open stream.
        }));

        if let Some(interval) = config.keep_alive {
            let keepalive_tx = write_tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if keepalive_tx
                        .send(Frame::new(MuxCommand::Nop, 0))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        MuxSession {
            write_tx,
            accept_rx: Mutex::new(accept_rx),
            tasks,
        }
    }

    /// Next client-opened stream, or None once the carrier is gone.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.write_tx.is_closed()
    }

    pub async fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct MuxStream {
    id: u32,
    data_rx: mpsc::Receiver<Bytes>,
    write_tx: mpsc::Sender<Frame>,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), MuxError> {
        send_chunks(&self.write_tx, self.id, data).await
    }

    pub async fn close(&self) -> Result<(), MuxError> {
        self.write_tx
            .send(Frame::new(MuxCommand::Fin, self.id))
            .await
            .map_err(|_| MuxError::Closed)
    }

    pub fn split(self) -> (MuxStreamReader, MuxStreamWriter) {
        (
            MuxStreamReader {
                data_rx: self.data_rx,
            },
            MuxStreamWriter {
                id: self.id,
                write_tx: self.write_tx,
            },
        )
    }
}

pub struct MuxStreamReader {
    data_rx: mpsc::Receiver<Bytes>,
}

impl MuxStreamReader {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }
}

#[derive(Clone)]
pub struct MuxStreamWriter {
    id: u32,
    write_tx: mpsc::Sender<Frame>,
}

impl MuxStreamWriter {
    pub async fn send(&self, data: &[u8]) -> Result<(), MuxError> {
        send_chunks(&self.write_tx, self.id, data).await
    }

    pub async fn close(&self) -> Result<(), MuxError> {
        self.write_tx
            .send(Frame::new(MuxCommand::Fin, self.id))
            .await
            .map_err(|_| MuxError::Closed)
    }
}

async fn send_chunks(
    write_tx: &mpsc::Sender<Frame>,
    stream_id: u32,
    data: &[u8],
) -> Result<(), MuxError> {
    for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
        write_tx
            .send(Frame::with_data(
                MuxCommand::Psh,
                stream_id,
                Bytes::copy_from_slice(chunk),
            ))
            .await
            .map_err(|_| MuxError::Closed)?;
    }
    Ok(())
}
