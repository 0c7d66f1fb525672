use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use opsgate_common::tls::RustlsSetupError;
use opsgate_common::Secret;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::*;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] Box<tungstenite::Error>),
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(#[source] Box<tungstenite::Error>),
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    SendFailed(#[source] Box<tungstenite::Error>),
    #[error("receive failed: {0}")]
    RecvFailed(#[source] Box<tungstenite::Error>),
    #[error("TLS setup: {0}")]
    Tls(#[from] RustlsSetupError),
    #[error("invalid channel URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("control plane: {0}")]
    ControlPlane(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Inbound notifications from a message channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Message(Bytes),
    Error(TransportError),
    Closed,
}

/// A single message-oriented connection to the control plane. The
/// transport never retries; connection errors surface as
/// [`ChannelEvent::Error`] and the owner decides what to do.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn open(&self, events: UnboundedSender<ChannelEvent>) -> Result<(), TransportError>;
    async fn send(&self, data: Bytes, kind: FrameKind) -> Result<(), TransportError>;
    async fn close(&self);
    fn is_connected(&self) -> bool;
    fn set_token(&self, token: Secret<String>);
    fn get_token(&self) -> Secret<String>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WebSocketChannel {
    url: Url,
    token: StdMutex<Secret<String>>,
    tls: Option<Arc<rustls::ClientConfig>>,
    connected: Arc<AtomicBool>,
    sink: Mutex<Option<WsSink>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl WebSocketChannel {
    pub fn new(url: Url, token: Secret<String>, tls: Option<Arc<rustls::ClientConfig>>) -> Self {
        WebSocketChannel {
            url,
            token: StdMutex::new(token),
            tls,
            connected: Arc::new(AtomicBool::new(false)),
            sink: Mutex::new(None),
            reader: StdMutex::new(None),
        }
    }
}

#[async_trait]
impl MessageChannel for WebSocketChannel {
    async fn open(&self, events: UnboundedSender<ChannelEvent>) -> Result<(), TransportError> {
        self.close().await;

        let connector = self.tls.clone().map(Connector::Rustls);
        let (ws, _) = connect_async_tls_with_config(self.url.as_str(), None, true, connector)
            .await
            .map_err(|error| match error {
                tungstenite::Error::Tls(_) => TransportError::TlsHandshakeFailed(Box::new(error)),
                error => TransportError::ConnectFailed(Box::new(error)),
            })?;

        let (sink, mut stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        let connected = self.connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Binary(data)) => {
                        if events.send(ChannelEvent::Message(data)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        if events.send(ChannelEvent::Message(Bytes::from(text))).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Connection closed by peer");
                        let _ = events.send(ChannelEvent::Closed);
                        break;
                    }
                    Ok(_) => (),
                    Err(error) => {
                        let _ = events
                            .send(ChannelEvent::Error(TransportError::RecvFailed(Box::new(error))));
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);

        Ok(())
    }

    async fn send(&self, data: Bytes, kind: FrameKind) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let message = match kind {
            FrameKind::Binary => Message::Binary(data),
            FrameKind::Text => Message::Text(String::from_utf8_lossy(&data).into_owned().into()),
        };

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(message).await.map_err(|error| {
            self.connected.store(false, Ordering::SeqCst);
            TransportError::SendFailed(Box::new(error))
        })
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            reader.abort();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_token(&self, token: Secret<String>) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    fn get_token(&self) -> Secret<String> {
        self.token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
