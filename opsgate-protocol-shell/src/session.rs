use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use opsgate_common::helpers::fs::{secure_directory, secure_file};
use opsgate_common::EXIT_CODE_FAILURE;
use opsgate_core::wire::{AgentMessage, PayloadType, SessionState, SizeContent};
use opsgate_core::{
    CancelFlag, DataStream, HandlerStatus, InboundMessageHandler, IoHandler, SessionEnv,
    SessionPlugin, SessionStatus,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::*;

use crate::chunker::Utf8Chunker;
use crate::error::ShellError;
use crate::properties::ShellProperties;
use crate::pty::{PtyControl, PtyFactory, PtyRequest};

const DEFAULT_COLS: u32 = 80;
const DEFAULT_ROWS: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellMode {
    /// A live terminal: the default shell, or a long-running command.
    Interactive,
    /// A single fixed command with its exit code reported back.
    NonInteractive,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputSource {
    Stdout,
    Stderr,
}

/// Terminal-backed session plugin: pumps terminal output onto the
/// stream in payload-sized, rune-aligned chunks and writes inbound
/// payloads to the terminal's stdin. Also serves the command session
/// types.
pub struct ShellSession {
    env: SessionEnv,
    mode: ShellMode,
    factory: Arc<dyn PtyFactory>,
    session_data_dir: PathBuf,
    stdin: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    control: Mutex<Option<Arc<dyn PtyControl>>>,
}

impl ShellSession {
    pub fn new(
        env: SessionEnv,
        mode: ShellMode,
        factory: Arc<dyn PtyFactory>,
        session_data_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(ShellSession {
            env,
            mode,
            factory,
            session_data_dir,
            stdin: Mutex::new(None),
            control: Mutex::new(None),
        })
    }

    /// Shadow copy of the terminal output, picked up later by the log
    /// uploader. Failure to create it degrades to logging only.
    async fn open_shadow_log(&self) -> Result<tokio::fs::File, ShellError> {
        let dir = self.session_data_dir.join(&self.env.session_id);
        tokio::fs::create_dir_all(&dir).await?;
        secure_directory(&dir)?;
        let path = dir.join("ipc.log");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        secure_file(&path)?;
        Ok(file)
    }
}

struct OutputPump {
    stream: Arc<DataStream>,
    shadow: Arc<Mutex<Option<tokio::fs::File>>>,
    last_source: Mutex<Option<OutputSource>>,
    payload_size: usize,
}

impl OutputPump {
    async fn run(
        self: Arc<Self>,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        source: OutputSource,
        prefix: Option<Bytes>,
    ) -> Result<(), ShellError> {
        let mut chunker = Utf8Chunker::new();
        let mut buf = vec![0u8; self.payload_size];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                let tail = chunker.flush();
                if !tail.is_empty() {
                    self.emit(source, &prefix, tail).await;
                }
                return Ok(());
            }
            let chunk = chunker.push(&buf[..n]);
            if !chunk.is_empty() {
                self.emit(source, &prefix, chunk).await;
            }
        }
    }

    async fn emit(&self, source: OutputSource, prefix: &Option<Bytes>, chunk: Bytes) {
        let mut data = BytesMut::new();
        if let Some(prefix) = prefix {
            let mut last = self.last_source.lock().await;
            if *last != Some(source) {
                data.extend_from_slice(prefix);
            }
            *last = Some(source);
        }
        data.extend_from_slice(&chunk);

        if let Err(error) = self
            .stream
            .send_stream_data(PayloadType::Output, &data)
            .await
        {
            warn!(%error, "Failed to send terminal output");
        }

        let mut shadow = self.shadow.lock().await;
        if let Some(file) = shadow.as_mut() {
            if let Err(error) = file.write_all(&chunk).await {
                warn!(%error, "Shadow log write failed, disabling it");
                *shadow = None;
            }
        }
    }
}

#[async_trait]
impl InboundMessageHandler for ShellSession {
    async fn handle(&self, message: &AgentMessage) -> Result<HandlerStatus> {
        match message.payload_kind() {
            Some(PayloadType::Output) => {
                let mut guard = self.stdin.lock().await;
                match guard.as_mut() {
                    Some(writer) => {
                        writer.write_all(&message.payload).await?;
                        writer.flush().await?;
                        Ok(HandlerStatus::Handled)
                    }
                    None => Ok(HandlerStatus::NotReady),
                }
            }
            Some(PayloadType::Size) => {
                let size: SizeContent = serde_json::from_slice(&message.payload)?;
                let control = self.control.lock().await.clone();
                match control {
                    Some(control) => {
                        control
                            .resize(size.cols, size.rows)
                            .await
                            .map_err(anyhow::Error::from)?;
                        Ok(HandlerStatus::Handled)
                    }
                    None => Ok(HandlerStatus::NotReady),
                }
            }
            other => {
                debug!(payload_type = ?other, "Ignoring payload");
                Ok(HandlerStatus::Handled)
            }
        }
    }
}

#[async_trait]
impl SessionPlugin for ShellSession {
    fn requires_handshake(&self) -> bool {
        false
    }

    async fn execute(
        self: Arc<Self>,
        stream: Arc<DataStream>,
        cancel: CancelFlag,
        io: Arc<dyn IoHandler>,
    ) -> Result<()> {
        let properties = ShellProperties::parse(&self.env.properties)?;
        let spec = properties.for_current_platform().cloned().unwrap_or_default();

        let command = match self.mode {
            ShellMode::NonInteractive => {
                if spec.commands.is_empty() {
                    io.set_status(SessionStatus::Failed);
                    io.set_exit_code(EXIT_CODE_FAILURE);
                    return Err(ShellError::NoCommandForPlatform.into());
                }
                Some(spec.commands.clone())
            }
            ShellMode::Interactive => (!spec.commands.is_empty()).then(|| spec.commands.clone()),
        };

        let pair = match self
            .factory
            .spawn(&PtyRequest {
                command,
                run_as_elevated: spec.run_as_elevated,
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
            })
            .await
        {
            Ok(pair) => pair,
            Err(error) => {
                io.set_status(SessionStatus::Failed);
                io.set_exit_code(EXIT_CODE_FAILURE);
                return Err(error.into());
            }
        };

        let control: Arc<dyn PtyControl> = Arc::from(pair.control);
        *self.control.lock().await = Some(control.clone());
        *self.stdin.lock().await = Some(pair.writer);

        let shadow = match self.open_shadow_log().await {
            Ok(file) => Some(file),
            Err(error) => {
                warn!(%error, "Cannot create the shadow log");
                None
            }
        };

        let pump = Arc::new(OutputPump {
            stream: stream.clone(),
            shadow: Arc::new(Mutex::new(shadow)),
            last_source: Mutex::new(None),
            payload_size: stream.stream_data_payload_size(),
        });

        let separate = spec.separate_output_stream;
        let stdout_prefix = (separate && !spec.stdout_separator_prefix.is_empty())
            .then(|| Bytes::from(spec.stdout_separator_prefix.clone().into_bytes()));
        let stderr_prefix = (separate && !spec.stderr_separator_prefix.is_empty())
            .then(|| Bytes::from(spec.stderr_separator_prefix.clone().into_bytes()));

        let mut stdout_task = tokio::spawn(
            pump.clone()
                .run(pair.reader, OutputSource::Stdout, stdout_prefix),
        );
        let stderr_task = pair.stderr.map(|reader| {
            tokio::spawn(pump.clone().run(reader, OutputSource::Stderr, stderr_prefix))
        });

        tokio::select! {
            _ = cancel.wait() => {
                debug!(session = %self.env.session_id, "Cancelled, stopping the terminal");
                if let Err(error) = control.stop().await {
                    warn!(%error, "Failed to stop the terminal");
                }
                stdout_task.abort();
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Ok(());
            }
            result = &mut stdout_task => {
                match result {
                    Ok(Ok(())) => (),
                    Ok(Err(error)) => warn!(%error, "Output pump failed"),
                    Err(error) => warn!(%error, "Output pump panicked"),
                }
            }
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        // Terminal EOF: announce termination and pass the exit code on.
        if let Err(error) = stream.send_agent_session_state(SessionState::Terminating).await {
            warn!(%error, "Failed to announce termination");
        }
        let code = control.wait().await.unwrap_or(EXIT_CODE_FAILURE);
        io.set_exit_code(code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use opsgate_common::{ChannelRole, Secret};
    use opsgate_core::wire::MessageType;
    use opsgate_core::{
        ChannelEvent, ControlPlaneFacade, DataStreamParams, FrameKind, MessageChannel,
        SessionResult, TransportError,
    };
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;
    use crate::pty::PtyPair;

    struct FakeChannel {
        connected: AtomicBool,
        sent: StdMutex<Vec<(Bytes, FrameKind)>>,
        token: StdMutex<Secret<String>>,
    }

    impl FakeChannel {
        fn new() -> Arc<Self> {
            Arc::new(FakeChannel {
                connected: AtomicBool::new(false),
                sent: StdMutex::new(vec![]),
                token: StdMutex::new(Secret::new("t".to_owned())),
            })
        }

        fn sent_messages(&self) -> Vec<AgentMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, kind)| *kind == FrameKind::Binary)
                .filter_map(|(data, _)| AgentMessage::deserialize(data).ok())
                .collect()
        }
    }

    #[async_trait]
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

    #[async_trait]
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

    struct FakeControl {
        resizes: StdMutex<Vec<(u32, u32)>>,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl PtyControl for FakeControl {
        async fn resize(&self, cols: u32, rows: u32) -> Result<(), ShellError> {
            self.resizes.lock().unwrap().push((cols, rows));
            Ok(())
        }

        async fn wait(&self) -> Result<i32, ShellError> {
            Ok(0)
        }

        async fn stop(&self) -> Result<(), ShellError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakePtyFactory {
        // Ends held by the test: write to feed terminal output, read to
        // observe stdin.
        output_feed: StdMutex<Option<DuplexStream>>,
        stdin_sink: StdMutex<Option<DuplexStream>>,
        control: Arc<FakeControl>,
    }

    impl FakePtyFactory {
        fn new() -> (Arc<Self>, DuplexStream, DuplexStream) {
            let (output_local, output_remote) = duplex(4096);
            let (stdin_local, stdin_remote) = duplex(4096);
            let factory = Arc::new(FakePtyFactory {
                output_feed: StdMutex::new(Some(output_remote)),
                stdin_sink: StdMutex::new(Some(stdin_remote)),
                control: Arc::new(FakeControl {
                    resizes: StdMutex::new(vec![]),
                    stopped: AtomicBool::new(false),
                }),
            });
            (factory, output_local, stdin_local)
        }
    }

    #[async_trait]
    impl PtyFactory for FakePtyFactory {
        async fn spawn(&self, _request: &PtyRequest) -> Result<PtyPair, ShellError> {
            struct NopControl(Arc<FakeControl>);

            #[async_trait]
            impl PtyControl for NopControl {
                async fn resize(&self, cols: u32, rows: u32) -> Result<(), ShellError> {
                    self.0.resize(cols, rows).await
                }
                async fn wait(&self) -> Result<i32, ShellError> {
                    self.0.wait().await
                }
                async fn stop(&self) -> Result<(), ShellError> {
                    self.0.stop().await
                }
            }

            Ok(PtyPair {
                reader: Box::new(self.output_feed.lock().unwrap().take().unwrap()),
                stderr: None,
                writer: Box::new(self.stdin_sink.lock().unwrap().take().unwrap()),
                control: Box::new(NopControl(self.control.clone())),
            })
        }
    }

    fn make_stream(channel: Arc<FakeChannel>) -> Arc<DataStream> {
        let stream = DataStream::new(DataStreamParams {
            channel_id: "shell-session".to_owned(),
            client_id: "client".to_owned(),
            instance_id: "i-1".to_owned(),
            role: ChannelRole::Publish,
            transport: channel,
            control_plane: Arc::new(FakeControlPlane),
            kms: None,
            stream_config: Default::default(),
            retry_config: Default::default(),
            handshake_config: Default::default(),
            cancel: opsgate_core::CancelFlag::new(),
        });
        stream.skip_handshake();
        stream
    }

    fn make_session(factory: Arc<FakePtyFactory>) -> Arc<ShellSession> {
        let dir = std::env::temp_dir().join(format!("opsgate-shell-test-{}", std::process::id()));
        ShellSession::new(
            SessionEnv {
                session_id: "shell-session".to_owned(),
                client_id: "client".to_owned(),
                instance_id: "i-1".to_owned(),
                session_type: "Standard_Stream".to_owned(),
                kms_key_id: None,
                properties: serde_json::Value::Null,
            },
            ShellMode::Interactive,
            factory,
            dir,
        )
    }

    fn output_message(payload: &[u8]) -> AgentMessage {
        AgentMessage::new(
            MessageType::InputStreamData,
            PayloadType::Output as u32,
            0,
            0,
            Bytes::copy_from_slice(payload),
        )
    }

    #[tokio::test]
    async fn test_terminal_output_flows_to_stream_and_eof_terminates() {
        let channel = FakeChannel::new();
        let stream = make_stream(channel.clone());
        let (factory, mut output_feed, _stdin_sink) = FakePtyFactory::new();
        let session = make_session(factory);

        let io = Arc::new(SessionResult::default());
        let run = tokio::spawn(session.clone().execute(
            stream.clone(),
            stream.cancel_flag(),
            io.clone(),
        ));

        output_feed.write_all(b"login banner").await.unwrap();
        output_feed.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(channel
            .sent_messages()
            .iter()
            .any(|m| m.message_type == MessageType::InputStreamData
                && m.payload.as_ref() == b"login banner"));

        drop(output_feed);
        run.await.unwrap().unwrap();

        assert!(channel
            .sent_messages()
            .iter()
            .any(|m| m.message_type == MessageType::AgentSessionState));
        assert_eq!(io.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_inbound_payload_reaches_stdin() {
        let channel = FakeChannel::new();
        let stream = make_stream(channel);
        let (factory, _output_feed, mut stdin_sink) = FakePtyFactory::new();
        let session = make_session(factory);

        // Before the terminal exists the handler defers.
        assert!(matches!(
            session.handle(&output_message(b"early")).await.unwrap(),
            HandlerStatus::NotReady
        ));

        let io = Arc::new(SessionResult::default());
        let _run = tokio::spawn(session.clone().execute(
            stream.clone(),
            stream.cancel_flag(),
            io,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            session.handle(&output_message(b"whoami\n")).await.unwrap(),
            HandlerStatus::Handled
        ));
        let mut buf = vec![0u8; 7];
        stdin_sink.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"whoami\n");
    }

    #[tokio::test]
    async fn test_resize_payload_reaches_terminal_control() {
        let channel = FakeChannel::new();
        let stream = make_stream(channel);
        let (factory, _output_feed, _stdin_sink) = FakePtyFactory::new();
        let control = factory.control.clone();
        let session = make_session(factory);

        let io = Arc::new(SessionResult::default());
        let _run = tokio::spawn(session.clone().execute(
            stream.clone(),
            stream.cancel_flag(),
            io,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resize = AgentMessage::new(
            MessageType::InputStreamData,
            PayloadType::Size as u32,
            1,
            0,
            Bytes::from(serde_json::to_vec(&SizeContent { cols: 120, rows: 40 }).unwrap()),
        );
        session.handle(&resize).await.unwrap();
        assert_eq!(*control.resizes.lock().unwrap(), vec![(120, 40)]);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_terminal() {
        let channel = FakeChannel::new();
        let stream = make_stream(channel);
        let (factory, _output_feed, _stdin_sink) = FakePtyFactory::new();
        let control = factory.control.clone();
        let session = make_session(factory);

        let cancel = stream.cancel_flag();
        let io = Arc::new(SessionResult::default());
        let run = tokio::spawn(session.clone().execute(stream.clone(), cancel.clone(), io));
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.set(opsgate_core::CancelState::Cancelled);
        run.await.unwrap().unwrap();
        assert!(control.stopped.load(Ordering::SeqCst));
    }
}
