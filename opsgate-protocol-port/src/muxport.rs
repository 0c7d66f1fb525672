use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use opsgate_core::wire::{AgentMessage, PayloadType, PortFlag};
use opsgate_core::{CancelFlag, CancelState, DataStream, HandlerStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::*;

use crate::error::PortError;
use crate::mux::{MuxConfig, MuxSession, MuxStream};

/// Multiplexed port forwarding: one tunnel carries many client-side
/// streams. The carrier is bridged through a local socket pair; the
/// multiplexer accepts streams the client opens and dials the local
/// destination once per stream.
pub struct MuxPortSession {
    port: String,
    payload_size: usize,
    socket_path: PathBuf,
    bridge_writer: Mutex<Option<OwnedWriteHalf>>,
    cancel: OnceLock<CancelFlag>,
}

impl MuxPortSession {
    pub fn new(port: impl Into<String>, payload_size: usize, socket_path: PathBuf) -> Arc<Self> {
        Arc::new(MuxPortSession {
            port: port.into(),
            payload_size,
            socket_path,
            bridge_writer: Mutex::new(None),
            cancel: OnceLock::new(),
        })
    }

    pub async fn run(
        self: &Arc<Self>,
        stream: Arc<DataStream>,
        cancel: CancelFlag,
        keep_alive: Option<Duration>,
    ) -> Result<(), PortError> {
        let _ = self.cancel.set(cancel.clone());

        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        let listener = UnixListener::bind(&self.socket_path)?;

        let (accepted, connected) =
            tokio::join!(listener.accept(), UnixStream::connect(&self.socket_path));
        let (mux_side, _) = accepted?;
        let bridge_side = connected?;

        let mux = Arc::new(MuxSession::server(
            mux_side,
            MuxConfig {
                keep_alive,
                ..Default::default()
            },
        ));

        let (mut bridge_reader, bridge_writer) = bridge_side.into_split();
        *self.bridge_writer.lock().await = Some(bridge_writer);

        // Tunnel bytes leaving the multiplexer go out as stream data.
        let outbound = {
            let stream = stream.clone();
            let payload_size = self.payload_size;
            tokio::spawn(async move {
                let mut buf = vec![0u8; payload_size];
                loop {
                    match bridge_reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Err(error) = stream
                                .send_stream_data(PayloadType::Output, &buf[..n])
                                .await
                            {
                                warn!(%error, "Failed to forward tunnel data");
                            }
                        }
                    }
                }
            })
        };

        // Each client-opened stream gets its own local connection.
        let acceptor = {
            let mux = mux.clone();
            let stream = stream.clone();
            let port = self.port.clone();
            tokio::spawn(async move {
                while let Some(mux_stream) = mux.accept().await {
                    debug!(stream_id = mux_stream.id(), "Accepted tunnel stream");
                    tokio::spawn(serve_stream(stream.clone(), mux_stream, port.clone()));
                }
            })
        };

        cancel.wait().await;

        outbound.abort();
        acceptor.abort();
        mux.close().await;
        *self.bridge_writer.lock().await = None;
        if let Err(error) = tokio::fs::remove_file(&self.socket_path).await {
            debug!(%error, "Could not remove the multiplexer socket");
        }
        Ok(())
    }

    pub async fn handle(&self, message: &AgentMessage) -> Result<HandlerStatus> {
        match message.payload_kind() {
            Some(PayloadType::Output) => {
                let mut guard = self.bridge_writer.lock().await;
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
                    Some(PortFlag::TerminateSession) => {
                        debug!("TerminateSession received");
                        if let Some(cancel) = self.cancel.get() {
                            cancel.set(CancelState::Cancelled);
                        }
                    }
                    other => debug!(?other, "Ignoring flag"),
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

/// Full-duplex copy between one tunnel stream and a fresh local
/// connection. A failed dial reports back over the session as a flag
/// frame and closes just this stream.
async fn serve_stream(stream: Arc<DataStream>, mux_stream: MuxStream, port: String) {
    let stream_id = mux_stream.id();
    let target = format!("localhost:{port}");

    let tcp = match TcpStream::connect(&target).await {
        Ok(tcp) => tcp,
        Err(error) => {
            warn!(stream_id, %target, %error, "Local dial failed");
            if let Err(error) = stream
                .send_stream_data(PayloadType::Flag, &PortFlag::ConnectToPortError.to_wire())
                .await
            {
                warn!(%error, "Failed to report the dial failure");
            }
            let (_, writer) = mux_stream.split();
            let _ = writer.close().await;
            return;
        }
    };

    let (mut tcp_reader, mut tcp_writer) = tcp.into_split();
    let (mut mux_reader, mux_writer) = mux_stream.split();

    let to_tcp = tokio::spawn(async move {
        while let Some(data) = mux_reader.recv().await {
            if tcp_writer.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = tcp_writer.shutdown().await;
    });

    let to_mux = {
        let mux_writer = mux_writer.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match tcp_reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if mux_writer.send(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = mux_writer.close().await;
        })
    };

    let _ = to_tcp.await;
    let _ = to_mux.await;
    debug!(stream_id, "Tunnel stream finished");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::{Bytes, BytesMut};
    use opsgate_common::{ChannelRole, Secret};
    use opsgate_core::wire::MessageType;
    use opsgate_core::{
        ChannelEvent, ControlPlaneFacade, DataStreamParams, FrameKind, MessageChannel,
        TransportError,
    };
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;
    use crate::mux::{Frame, MuxCommand};

    struct FakeChannel {
        connected: AtomicBool,
        sent: std::sync::Mutex<Vec<(Bytes, FrameKind)>>,
        token: std::sync::Mutex<Secret<String>>,
    }

    impl FakeChannel {
        fn new() -> Arc<Self> {
            Arc::new(FakeChannel {
                connected: AtomicBool::new(false),
                sent: std::sync::Mutex::new(vec![]),
                token: std::sync::Mutex::new(Secret::new("t".to_owned())),
            })
        }

        /// All Output payloads concatenated: the tunnel byte stream as
        /// the client would observe it.
        fn tunnel_bytes(&self) -> BytesMut {
            let mut out = BytesMut::new();
            for (data, kind) in self.sent.lock().unwrap().iter() {
                if *kind != FrameKind::Binary {
                    continue;
                }
                if let Ok(message) = AgentMessage::deserialize(data) {
                    if message.message_type == MessageType::InputStreamData
                        && message.payload_kind() == Some(PayloadType::Output)
                    {
                        out.extend_from_slice(&message.payload);
                    }
                }
            }
            out
        }

        fn flag_payloads(&self) -> Vec<PortFlag> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(data, _)| AgentMessage::deserialize(data).ok())
                .filter(|m| m.payload_kind() == Some(PayloadType::Flag))
                .filter_map(|m| PortFlag::from_wire(&m.payload))
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl MessageChannel for FakeChannel {
        async fn open(&self, _events: UnboundedSender<ChannelEvent>) -> Result<(), TransportError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, data: Bytes, kind: FrameKind) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((data, kind));
            Ok(())
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn set_token(&self, token: Secret<String>) {
            *self.token.lock().unwrap() = token;
        }

        fn get_token(&self) -> Secret<String> {
            self.token.lock().unwrap().clone()
        }
    }

    struct FakeControlPlane;

    #[async_trait::async_trait]
    impl ControlPlaneFacade for FakeControlPlane {
        async fn create_data_channel(
            &self,
            _session_id: &str,
            _request_id: &str,
            _client_id: &str,
        ) -> Result<Secret<String>, TransportError> {
            Ok(Secret::new("t".to_owned()))
        }
    }

    fn make_stream(channel: Arc<FakeChannel>) -> Arc<DataStream> {
        let stream = DataStream::new(DataStreamParams {
            channel_id: "mux-session".to_owned(),
            client_id: "client".to_owned(),
            instance_id: "i-1".to_owned(),
            role: ChannelRole::Publish,
            transport: channel,
            control_plane: Arc::new(FakeControlPlane),
            kms: None,
            stream_config: Default::default(),
            retry_config: Default::default(),
            handshake_config: Default::default(),
            cancel: CancelFlag::new(),
        });
        stream.skip_handshake();
        stream
    }

    fn output_message(payload: Bytes) -> AgentMessage {
        AgentMessage::new(
            MessageType::InputStreamData,
            PayloadType::Output as u32,
            0,
            0,
            payload,
        )
    }

    fn socket_in_temp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("opsgate-mux-test-{}-{name}.sock", std::process::id()))
    }

    async fn inject_frames(session: &Arc<MuxPortSession>, frames: &[Frame]) {
        let mut wire = BytesMut::new();
        for frame in frames {
            wire.extend_from_slice(&frame.encode());
        }
        session
            .handle(&output_message(wire.freeze()))
            .await
            .unwrap();
    }

    async fn extract_frames(channel: &FakeChannel) -> Vec<Frame> {
        let mut buf = channel.tunnel_bytes();
        let mut frames = vec![];
        while let Ok(Some(frame)) = Frame::decode(&mut buf) {
            if frame.command != MuxCommand::Nop {
                frames.push(frame);
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_multiplexed_streams_reach_local_port_independently() {
        // Local echo server.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                let echoed = buf[..n].to_vec();
                                if conn.write_all(&echoed).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        let channel = FakeChannel::new();
        let stream = make_stream(channel.clone());
        let session = MuxPortSession::new(port, 1024, socket_in_temp("independent"));
        let cancel = stream.cancel_flag();
        let run = tokio::spawn({
            let session = session.clone();
            let stream = stream.clone();
            let cancel = cancel.clone();
            async move { session.run(stream, cancel, None).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Three client streams over one tunnel.
        inject_frames(
            &session,
            &[
                Frame::new(MuxCommand::Syn, 1),
                Frame::new(MuxCommand::Syn, 2),
                Frame::new(MuxCommand::Syn, 3),
                Frame::with_data(MuxCommand::Psh, 1, Bytes::from_static(b"one")),
                Frame::with_data(MuxCommand::Psh, 3, Bytes::from_static(b"three")),
            ],
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let frames = extract_frames(&channel).await;
        let data_for = |id: u32| -> Vec<u8> {
            frames
                .iter()
                .filter(|f| f.command == MuxCommand::Psh && f.stream_id == id)
                .flat_map(|f| f.data.to_vec())
                .collect()
        };
        assert_eq!(data_for(1), b"one");
        assert_eq!(data_for(3), b"three");

        // Closing stream 1 leaves stream 3 usable.
        inject_frames(&session, &[Frame::new(MuxCommand::Fin, 1)]).await;
        inject_frames(
            &session,
            &[Frame::with_data(MuxCommand::Psh, 3, Bytes::from_static(b"-more"))],
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(extract_frames(&channel).await.len() > frames.len());

        cancel.set(CancelState::Cancelled);
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_reports_flag_and_keeps_session() {
        // A port with nothing listening.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port().to_string();
        drop(probe);

        let channel = FakeChannel::new();
        let stream = make_stream(channel.clone());
        let session = MuxPortSession::new(port, 1024, socket_in_temp("dialfail"));
        let cancel = stream.cancel_flag();
        let run = tokio::spawn({
            let session = session.clone();
            let stream = stream.clone();
            let cancel = cancel.clone();
            async move { session.run(stream, cancel, None).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        inject_frames(&session, &[Frame::new(MuxCommand::Syn, 5)]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(channel
            .flag_payloads()
            .contains(&PortFlag::ConnectToPortError));
        assert!(!cancel.is_canceled());

        cancel.set(CancelState::Cancelled);
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_socket_file_is_removed_on_teardown() {
        let path = socket_in_temp("teardown");
        let channel = FakeChannel::new();
        let stream = make_stream(channel);
        let session = MuxPortSession::new("1", 1024, path.clone());
        let cancel = stream.cancel_flag();
        let run = tokio::spawn({
            let session = session.clone();
            let stream = stream.clone();
            let cancel = cancel.clone();
            async move { session.run(stream, cancel, None).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(path.exists());

        cancel.set(CancelState::Cancelled);
        run.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
