//! Reliable, ordered delivery over the message channel: sequence
//! numbering, acknowledgements, adaptive retransmission, reorder
//! buffering, pause/resume and reconnection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use opsgate_common::{ChannelRole, ClientVersion, HandshakeConfig, RetryConfig, StreamConfig};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tracing::*;
use uuid::Uuid;

use crate::buffer::{IncomingBuffer, OutgoingBuffer, StreamingMessage};
use crate::cancel::{CancelFlag, CancelState};
use crate::crypto::{BlockCipher, CryptoError, KmsFacade};
use crate::facade::ControlPlaneFacade;
use crate::handshake::Handshake;
use crate::plugin::{HandlerStatus, InboundMessageHandler};
use crate::retry::ExponentialRetryer;
use crate::transport::{ChannelEvent, FrameKind, MessageChannel, TransportError};
use crate::wire::{
    AcknowledgeContent, AgentMessage, AgentSessionStateContent, MessageType, OpenDataChannelInput,
    PayloadType, SessionState, WireError, FLAG_FINAL, FLAG_FIRST, PAYLOAD_TYPE_NONE,
};

const MESSAGE_SCHEMA_VERSION: &str = "1.0";

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("payload serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("plugin handler: {0}")]
    Handler(String),
}

/// Jacobson/Karels retransmission timeout estimator, millisecond scale.
pub struct RtoEstimator {
    rtt_ms: f64,
    rtt_var_ms: f64,
    rto: Duration,
    alpha: f64,
    beta: f64,
    granularity_ms: f64,
    max: Duration,
}

impl RtoEstimator {
    pub fn new(config: &StreamConfig) -> Self {
        RtoEstimator {
            rtt_ms: config.initial_round_trip_time.as_secs_f64() * 1000.0,
            rtt_var_ms: config.initial_round_trip_time_variation.as_secs_f64() * 1000.0,
            rto: config
                .initial_retransmission_timeout
                .min(config.max_retransmission_timeout),
            alpha: config.round_trip_time_alpha,
            beta: config.round_trip_time_beta,
            granularity_ms: config.clock_granularity.as_secs_f64() * 1000.0,
            max: config.max_retransmission_timeout,
        }
    }

    pub fn observe(&mut self, sample_ms: f64) {
        self.rtt_var_ms =
            (1.0 - self.beta) * self.rtt_var_ms + self.beta * (self.rtt_ms - sample_ms).abs();
        self.rtt_ms = (1.0 - self.alpha) * self.rtt_ms + self.alpha * sample_ms;
        let rto_ms = self.rtt_ms + (4.0 * self.rtt_var_ms).max(self.granularity_ms);
        self.rto = Duration::from_secs_f64(rto_ms / 1000.0).min(self.max);
    }

    pub fn current(&self) -> Duration {
        self.rto
    }

    pub fn round_trip_time_ms(&self) -> f64 {
        self.rtt_ms
    }
}

struct SendState {
    buffer: OutgoingBuffer,
    send_sequence: i64,
}

struct RecvState {
    buffer: IncomingBuffer,
    expected_sequence: i64,
}

pub struct DataStreamParams {
    pub channel_id: String,
    pub client_id: String,
    pub instance_id: String,
    pub role: ChannelRole,
    pub transport: Arc<dyn MessageChannel>,
    pub control_plane: Arc<dyn ControlPlaneFacade>,
    pub kms: Option<Arc<dyn KmsFacade>>,
    pub stream_config: StreamConfig,
    pub retry_config: RetryConfig,
    pub handshake_config: HandshakeConfig,
    pub cancel: CancelFlag,
}

pub struct DataStream {
    channel_id: String,
    client_id: String,
    instance_id: String,
    #[allow(unused)]
    role: ChannelRole,
    request_id: Uuid,

    transport: Arc<dyn MessageChannel>,
    control_plane: Arc<dyn ControlPlaneFacade>,
    pub(crate) kms: Option<Arc<dyn KmsFacade>>,

    config: StreamConfig,
    retry_config: RetryConfig,

    send_state: Mutex<SendState>,
    recv_state: Mutex<RecvState>,
    rto: Mutex<RtoEstimator>,

    paused: AtomicBool,
    pub(crate) encryption_enabled: AtomicBool,
    pub(crate) cipher: RwLock<Option<BlockCipher>>,
    pub(crate) handshake: Handshake,

    handler: RwLock<Option<Arc<dyn InboundMessageHandler>>>,
    cancel: CancelFlag,

    events_tx: Mutex<Option<UnboundedSender<ChannelEvent>>>,
}

impl DataStream {
    pub fn new(params: DataStreamParams) -> Arc<Self> {
        Arc::new(DataStream {
            channel_id: params.channel_id,
            client_id: params.client_id,
            instance_id: params.instance_id,
            role: params.role,
            request_id: Uuid::new_v4(),
            transport: params.transport,
            control_plane: params.control_plane,
            kms: params.kms,
            send_state: Mutex::new(SendState {
                buffer: OutgoingBuffer::new(params.stream_config.outgoing_buffer_capacity),
                send_sequence: 0,
            }),
            recv_state: Mutex::new(RecvState {
                buffer: IncomingBuffer::new(params.stream_config.incoming_buffer_capacity),
                expected_sequence: 0,
            }),
            rto: Mutex::new(RtoEstimator::new(&params.stream_config)),
            paused: AtomicBool::new(false),
            encryption_enabled: AtomicBool::new(false),
            cipher: RwLock::new(None),
            handshake: Handshake::new(params.handshake_config.timeout),
            handler: RwLock::new(None),
            cancel: params.cancel,
            config: params.stream_config,
            retry_config: params.retry_config,
            events_tx: Mutex::new(None),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn stream_data_payload_size(&self) -> usize {
        self.config.stream_data_payload_size
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.encryption_enabled.load(Ordering::SeqCst)
    }

    pub async fn client_version(&self) -> Option<ClientVersion> {
        self.handshake.client_version().await
    }

    pub async fn set_handler(&self, handler: Arc<dyn InboundMessageHandler>) {
        *self.handler.write().await = Some(handler);
    }

    pub async fn clear_handler(&self) {
        *self.handler.write().await = None;
    }

    /// Connects the transport, sends the registration frame and starts
    /// the inbound pump and retransmission tasks.
    pub async fn open(self: &Arc<Self>) -> Result<(), StreamError> {
        let (tx, rx) = unbounded_channel();
        *self.events_tx.lock().await = Some(tx.clone());

        self.transport.open(tx).await?;
        self.send_registration().await?;

        let this = self.clone();
        tokio::spawn(async move { this.listen(rx).await });
        let this = self.clone();
        tokio::spawn(async move { this.resend_loop().await });

        Ok(())
    }

    async fn send_registration(&self) -> Result<(), StreamError> {
        let input = OpenDataChannelInput {
            message_schema_version: MESSAGE_SCHEMA_VERSION.to_owned(),
            request_id: self.request_id.to_string(),
            token_value: self.transport.get_token().expose_secret().clone(),
            client_instance_id: self.instance_id.clone(),
            client_id: self.client_id.clone(),
        };
        let body = serde_json::to_vec(&input)?;
        self.transport
            .send(Bytes::from(body), FrameKind::Text)
            .await?;
        Ok(())
    }

    /// Sends one stream-data frame. The sequence number is allocated and
    /// the frame is retained for retransmission atomically; the wire
    /// send happens outside the lock and is skipped while paused.
    pub async fn send_stream_data(
        &self,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<(), StreamError> {
        if payload.is_empty() {
            return Ok(());
        }

        let payload = if payload_type == PayloadType::Output && self.is_encryption_enabled() {
            let guard = self.cipher.read().await;
            guard
                .as_ref()
                .ok_or(CryptoError::KeyNotReady)?
                .encrypt(payload)?
        } else {
            payload.to_vec()
        };

        let serialized;
        {
            let mut state = self.send_state.lock().await;
            let sequence = state.send_sequence;
            let flags = if sequence == 0 { FLAG_FIRST } else { 0 };
            let message = AgentMessage::new(
                MessageType::InputStreamData,
                payload_type as u32,
                sequence,
                flags,
                Bytes::from(payload),
            );
            serialized = message.serialize()?;
            if !state.buffer.push(StreamingMessage {
                content: serialized.clone(),
                sequence_number: sequence,
                last_sent_time: Instant::now(),
            }) {
                warn!(
                    sequence,
                    "Outgoing buffer full, frame will not be retransmittable"
                );
            }
            state.send_sequence += 1;
        }

        if !self.paused.load(Ordering::SeqCst) {
            if let Err(error) = self.transport.send(serialized, FrameKind::Binary).await {
                warn!(%error, "Wire send failed, leaving frame to retransmission");
            }
        }
        Ok(())
    }

    pub async fn send_agent_session_state(
        &self,
        session_state: SessionState,
    ) -> Result<(), StreamError> {
        let body = serde_json::to_vec(&AgentSessionStateContent { session_state })?;
        let message = AgentMessage::new(
            MessageType::AgentSessionState,
            PAYLOAD_TYPE_NONE,
            0,
            FLAG_FIRST | FLAG_FINAL,
            Bytes::from(body),
        );
        let serialized = message.serialize()?;
        self.transport.send(serialized, FrameKind::Binary).await?;
        Ok(())
    }

    async fn listen(self: Arc<Self>, mut events: UnboundedReceiver<ChannelEvent>) {
        loop {
            tokio::select! {
                state = self.cancel.wait() => {
                    debug!(?state, "Inbound pump stopping");
                    break;
                }
                event = events.recv() => match event {
                    Some(ChannelEvent::Message(raw)) => self.on_incoming(raw).await,
                    Some(ChannelEvent::Error(error)) => {
                        warn!(%error, "Transport error");
                        if !self.recover_connection().await {
                            break;
                        }
                    }
                    Some(ChannelEvent::Closed) => {
                        if self.cancel.is_canceled() {
                            break;
                        }
                        warn!("Connection dropped");
                        if !self.recover_connection().await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    async fn recover_connection(&self) -> bool {
        match self.reconnect().await {
            Ok(()) => true,
            Err(error) => {
                error!(%error, "Failed to re-establish the connection");
                self.cancel.set(CancelState::Cancelled);
                false
            }
        }
    }

    /// Re-derives the channel token and reopens the transport. Sequence
    /// counters and both buffers carry over untouched.
    async fn reconnect(&self) -> Result<(), TransportError> {
        let events_tx = self
            .events_tx
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let retryer = ExponentialRetryer::new(self.retry_config.clone());
        retryer
            .call(|| {
                let events_tx = events_tx.clone();
                async move {
                    let token = self
                        .control_plane
                        .create_data_channel(
                            &self.channel_id,
                            &self.request_id.to_string(),
                            &self.client_id,
                        )
                        .await?;
                    self.transport.set_token(token);
                    self.transport.open(events_tx).await?;
                    self.send_registration().await.map_err(|error| match error {
                        StreamError::Transport(t) => t,
                        other => TransportError::ControlPlane(other.to_string()),
                    })?;
                    Ok::<_, TransportError>(())
                }
            })
            .await?;

        info!(channel = %self.channel_id, "Reconnected");
        Ok(())
    }

    async fn on_incoming(&self, raw: Bytes) {
        let message = match AgentMessage::deserialize(&raw) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "Dropping malformed frame");
                return;
            }
        };
        if let Err(reason) = message.validate() {
            warn!(%reason, "Dropping invalid frame");
            return;
        }

        if matches!(
            message.message_type,
            MessageType::InputStreamData
                | MessageType::Acknowledge
                | MessageType::PausePublication
                | MessageType::StartPublication
        ) {
            self.paused.store(false, Ordering::SeqCst);
        }

        match &message.message_type {
            MessageType::InputStreamData => self.handle_stream_data(raw, message).await,
            MessageType::Acknowledge => self.handle_acknowledge(&message).await,
            MessageType::ChannelClosed => {
                info!(channel = %self.channel_id, "Channel closed by the control plane");
                self.cancel.set(CancelState::Cancelled);
            }
            MessageType::PausePublication => {
                debug!("Publication paused");
                self.paused.store(true, Ordering::SeqCst);
            }
            MessageType::StartPublication => {
                debug!("Publication resumed");
            }
            MessageType::OutputStreamData | MessageType::AgentSessionState => {
                debug!(message_type = %message.message_type.as_str(), "Dropping unexpected frame");
            }
            MessageType::Other(name) => {
                warn!(message_type = %name, "Dropping frame of unknown type");
            }
        }
    }

    async fn handle_stream_data(&self, raw: Bytes, message: AgentMessage) {
        let sequence = message.sequence_number;
        let expected = self.recv_state.lock().await.expected_sequence;

        if sequence == expected {
            match self.process_payload(&message).await {
                Ok(HandlerStatus::NotReady) => {
                    debug!(sequence, "Handler not ready, relying on client resend");
                    return;
                }
                Ok(HandlerStatus::Handled) => (),
                Err(error) => {
                    self.report_processing_error(sequence, error);
                    return;
                }
            }
            self.send_acknowledge(&message).await;
            self.recv_state.lock().await.expected_sequence = sequence + 1;
            self.drain_incoming_buffer().await;
        } else if sequence > expected {
            let has_space = self.recv_state.lock().await.buffer.has_space();
            if has_space {
                self.send_acknowledge(&message).await;
                self.recv_state.lock().await.buffer.insert(sequence, raw);
            } else {
                debug!(sequence, "Reorder buffer full, dropping frame");
            }
        } else {
            debug!(sequence, expected, "Dropping duplicate frame");
        }
    }

    fn report_processing_error(&self, sequence: i64, error: StreamError) {
        if matches!(error, StreamError::Crypto(_)) {
            error!(sequence, %error, "Cannot decrypt incoming frame");
            self.cancel.set(CancelState::Cancelled);
        } else {
            warn!(sequence, %error, "Failed to process frame");
        }
    }

    /// Delivers buffered out-of-order frames that have become due. These
    /// frames were acknowledged when buffered, so they are only decoded
    /// and handed to the plugin here.
    async fn drain_incoming_buffer(&self) {
        loop {
            let (expected, frame) = {
                let mut state = self.recv_state.lock().await;
                let expected = state.expected_sequence;
                match state.buffer.remove(expected) {
                    Some(frame) => (expected, frame),
                    None => return,
                }
            };

            let message = match AgentMessage::deserialize(&frame) {
                Ok(message) => message,
                Err(error) => {
                    warn!(sequence = expected, %error, "Buffered frame no longer decodes");
                    return;
                }
            };

            match self.process_payload(&message).await {
                Ok(HandlerStatus::NotReady) => {
                    let mut state = self.recv_state.lock().await;
                    state.buffer.insert(expected, frame);
                    return;
                }
                Ok(HandlerStatus::Handled) => {
                    self.recv_state.lock().await.expected_sequence = expected + 1;
                }
                Err(error) => {
                    self.report_processing_error(expected, error);
                    return;
                }
            }
        }
    }

    /// Decrypts (for `Output` payloads) and routes one in-order frame:
    /// handshake payloads to the negotiation engine, everything else to
    /// the plugin once the handshake has completed or been skipped.
    async fn process_payload(&self, message: &AgentMessage) -> Result<HandlerStatus, StreamError> {
        let mut message = message.clone();
        if message.payload_kind() == Some(PayloadType::Output) && self.is_encryption_enabled() {
            let plaintext = {
                let guard = self.cipher.read().await;
                guard
                    .as_ref()
                    .ok_or(CryptoError::KeyNotReady)?
                    .decrypt(&message.payload)?
            };
            message.payload = plaintext.into();
        }

        match message.payload_kind() {
            Some(PayloadType::HandshakeResponse) => {
                self.handshake.on_response(self, &message.payload).await;
                Ok(HandlerStatus::Handled)
            }
            Some(PayloadType::EncChallengeResponse) => {
                self.handshake
                    .on_challenge_response(self, &message.payload)
                    .await;
                Ok(HandlerStatus::Handled)
            }
            _ => {
                if !self.handshake.is_complete() && !self.handshake.is_skipped() {
                    debug!("Ignoring stream data received during handshake");
                    return Ok(HandlerStatus::Handled);
                }
                let handler = self.handler.read().await.clone();
                match handler {
                    Some(handler) => handler
                        .handle(&message)
                        .await
                        .map_err(|error| StreamError::Handler(error.to_string())),
                    None => Ok(HandlerStatus::NotReady),
                }
            }
        }
    }

    async fn handle_acknowledge(&self, message: &AgentMessage) {
        let content: AcknowledgeContent = match serde_json::from_slice(&message.payload) {
            Ok(content) => content,
            Err(error) => {
                warn!(%error, "Dropping malformed acknowledgement");
                return;
            }
        };

        let removed = {
            let mut state = self.send_state.lock().await;
            state.buffer.remove(content.sequence_number)
        };
        match removed {
            Some(entry) => {
                let sample_ms = entry.last_sent_time.elapsed().as_secs_f64() * 1000.0;
                self.rto.lock().await.observe(sample_ms);
                trace!(sequence = content.sequence_number, sample_ms, "Acknowledged");
            }
            None => {
                debug!(
                    sequence = content.sequence_number,
                    "Acknowledgement for a frame no longer buffered"
                );
            }
        }
    }

    async fn send_acknowledge(&self, of: &AgentMessage) {
        let content = AcknowledgeContent {
            message_type: of.message_type.as_str().to_owned(),
            message_id: of.message_id,
            sequence_number: of.sequence_number,
            is_sequential_message: true,
        };
        let body = match serde_json::to_vec(&content) {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, "Failed to serialize acknowledgement");
                return;
            }
        };
        let message = AgentMessage::new(
            MessageType::Acknowledge,
            PAYLOAD_TYPE_NONE,
            0,
            FLAG_FIRST | FLAG_FINAL,
            Bytes::from(body),
        );
        match message.serialize() {
            Ok(serialized) => {
                if let Err(error) = self.transport.send(serialized, FrameKind::Binary).await {
                    warn!(%error, "Failed to send acknowledgement");
                }
            }
            Err(error) => warn!(%error, "Failed to frame acknowledgement"),
        }
    }

    /// Retransmits the oldest unacknowledged frame once its age exceeds
    /// the current adaptive timeout.
    async fn resend_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.resend_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.wait() => break,
                _ = ticker.tick() => {
                    if self.paused.load(Ordering::SeqCst) {
                        continue;
                    }
                    let rto = self.rto.lock().await.current();
                    let due = {
                        let state = self.send_state.lock().await;
                        state.buffer.front().and_then(|front| {
                            (front.last_sent_time.elapsed() >= rto)
                                .then(|| (front.sequence_number, front.content.clone()))
                        })
                    };
                    if let Some((sequence, content)) = due {
                        debug!(sequence, "Retransmitting frame");
                        if self.transport.send(content, FrameKind::Binary).await.is_ok() {
                            let mut state = self.send_state.lock().await;
                            if let Some(front) = state.buffer.front_mut() {
                                if front.sequence_number == sequence {
                                    front.last_sent_time = Instant::now();
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Waits for outstanding frames to be acknowledged, up to `timeout`.
    /// Returns whether the buffer drained completely.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.send_state.lock().await.buffer.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub async fn outgoing_len(&self) -> usize {
        self.send_state.lock().await.buffer.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use opsgate_common::Secret;

    use super::*;
    use crate::wire::CURRENT_SCHEMA_VERSION;

    /// In-memory channel: records outbound frames and lets tests inject
    /// inbound ones.
    pub(crate) struct FakeChannel {
        connected: AtomicBool,
        events: StdMutex<Option<UnboundedSender<ChannelEvent>>>,
        sent: StdMutex<Vec<(Bytes, FrameKind)>>,
        token: StdMutex<Secret<String>>,
        pub fail_sends: AtomicBool,
        pub open_count: StdMutex<u32>,
    }

    impl FakeChannel {
        pub fn new() -> Arc<Self> {
            Arc::new(FakeChannel {
                connected: AtomicBool::new(false),
                events: StdMutex::new(None),
                sent: StdMutex::new(vec![]),
                token: StdMutex::new(Secret::new("token-0".to_owned())),
                fail_sends: AtomicBool::new(false),
                open_count: StdMutex::new(0),
            })
        }

        pub fn inject(&self, frame: Bytes) {
            let guard = self.events.lock().unwrap();
            guard
                .as_ref()
                .expect("channel not open")
                .send(ChannelEvent::Message(frame))
                .unwrap();
        }

        pub fn inject_error(&self) {
            let guard = self.events.lock().unwrap();
            guard
                .as_ref()
                .expect("channel not open")
                .send(ChannelEvent::Error(TransportError::NotConnected))
                .unwrap();
        }

        pub fn sent_messages(&self) -> Vec<AgentMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, kind)| *kind == FrameKind::Binary)
                .filter_map(|(data, _)| AgentMessage::deserialize(data).ok())
                .collect()
        }

        pub fn sent_text_frames(&self) -> Vec<Bytes> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, kind)| *kind == FrameKind::Text)
                .map(|(data, _)| data.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MessageChannel for FakeChannel {
        async fn open(&self, events: UnboundedSender<ChannelEvent>) -> Result<(), TransportError> {
            *self.events.lock().unwrap() = Some(events);
            self.connected.store(true, Ordering::SeqCst);
            *self.open_count.lock().unwrap() += 1;
            Ok(())
        }

        async fn send(&self, data: Bytes, kind: FrameKind) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
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

    pub(crate) struct FakeControlPlane;

    #[async_trait]
    impl ControlPlaneFacade for FakeControlPlane {
        async fn create_data_channel(
            &self,
            _session_id: &str,
            _request_id: &str,
            _client_id: &str,
        ) -> Result<Secret<String>, TransportError> {
            Ok(Secret::new("token-fresh".to_owned()))
        }
    }

    pub(crate) struct RecordingHandler {
        pub sequences: StdMutex<Vec<i64>>,
        pub payloads: StdMutex<Vec<Bytes>>,
        pub ready: AtomicBool,
    }

    impl RecordingHandler {
        pub fn new() -> Arc<Self> {
            Arc::new(RecordingHandler {
                sequences: StdMutex::new(vec![]),
                payloads: StdMutex::new(vec![]),
                ready: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl InboundMessageHandler for RecordingHandler {
        async fn handle(&self, message: &AgentMessage) -> anyhow::Result<HandlerStatus> {
            if !self.ready.load(Ordering::SeqCst) {
                return Ok(HandlerStatus::NotReady);
            }
            self.sequences.lock().unwrap().push(message.sequence_number);
            self.payloads.lock().unwrap().push(message.payload.clone());
            Ok(HandlerStatus::Handled)
        }
    }

    pub(crate) fn test_params(
        transport: Arc<dyn MessageChannel>,
        kms: Option<Arc<dyn KmsFacade>>,
    ) -> DataStreamParams {
        DataStreamParams {
            channel_id: "session-1".to_owned(),
            client_id: "client-1".to_owned(),
            instance_id: "i-0123456789".to_owned(),
            role: ChannelRole::Publish,
            transport,
            control_plane: Arc::new(FakeControlPlane),
            kms,
            stream_config: StreamConfig {
                resend_interval: Duration::from_millis(10),
                ..Default::default()
            },
            retry_config: RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                jitter_ratio: 0.0,
                ..Default::default()
            },
            handshake_config: Default::default(),
            cancel: CancelFlag::new(),
        }
    }

    pub(crate) fn input_frame(sequence: i64, payload: &[u8]) -> Bytes {
        AgentMessage::new(
            MessageType::InputStreamData,
            PayloadType::Output as u32,
            sequence,
            if sequence == 0 { FLAG_FIRST } else { 0 },
            Bytes::copy_from_slice(payload),
        )
        .serialize()
        .unwrap()
    }

    pub(crate) fn ack_frame(of: &AgentMessage) -> Bytes {
        let content = AcknowledgeContent {
            message_type: of.message_type.as_str().to_owned(),
            message_id: of.message_id,
            sequence_number: of.sequence_number,
            is_sequential_message: true,
        };
        AgentMessage::new(
            MessageType::Acknowledge,
            PAYLOAD_TYPE_NONE,
            0,
            FLAG_FIRST | FLAG_FINAL,
            Bytes::from(serde_json::to_vec(&content).unwrap()),
        )
        .serialize()
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_out_of_order_frames_reach_handler_in_sequence_order() {
        let channel = FakeChannel::new();
        let stream = DataStream::new(test_params(channel.clone(), None));
        stream.open().await.unwrap();
        stream.skip_handshake();

        let handler = RecordingHandler::new();
        stream.set_handler(handler.clone()).await;

        channel.inject(input_frame(0, b"h"));
        channel.inject(input_frame(2, b"i\n"));
        channel.inject(input_frame(1, b"!"));
        settle().await;

        assert_eq!(*handler.sequences.lock().unwrap(), vec![0, 1, 2]);
        let payloads = handler.payloads.lock().unwrap();
        assert_eq!(payloads[0].as_ref(), b"h");
        assert_eq!(payloads[1].as_ref(), b"!");
        assert_eq!(payloads[2].as_ref(), b"i\n");

        // Each inbound frame is acknowledged in arrival order.
        let acked: Vec<i64> = channel
            .sent_messages()
            .into_iter()
            .filter(|m| m.message_type == MessageType::Acknowledge)
            .map(|m| {
                serde_json::from_slice::<AcknowledgeContent>(&m.payload)
                    .unwrap()
                    .sequence_number
            })
            .collect();
        assert_eq!(acked, vec![0, 2, 1]);
    }

    #[tokio::test]
    async fn test_duplicate_frames_are_delivered_once() {
        let channel = FakeChannel::new();
        let stream = DataStream::new(test_params(channel.clone(), None));
        stream.open().await.unwrap();
        stream.skip_handshake();

        let handler = RecordingHandler::new();
        stream.set_handler(handler.clone()).await;

        channel.inject(input_frame(0, b"once"));
        settle().await;
        channel.inject(input_frame(0, b"once"));
        settle().await;

        assert_eq!(*handler.sequences.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_outbound_sequence_numbers_are_dense() {
        let channel = FakeChannel::new();
        let stream = DataStream::new(test_params(channel.clone(), None));
        stream.open().await.unwrap();
        stream.skip_handshake();

        for chunk in [b"a".as_slice(), b"b", b"c"] {
            stream
                .send_stream_data(PayloadType::Output, chunk)
                .await
                .unwrap();
        }
        // Empty payloads do not consume a sequence number.
        stream.send_stream_data(PayloadType::Output, b"").await.unwrap();
        stream.send_stream_data(PayloadType::Output, b"d").await.unwrap();

        let sent: Vec<_> = channel
            .sent_messages()
            .into_iter()
            .filter(|m| m.message_type == MessageType::InputStreamData)
            .collect();
        let sequences: Vec<i64> = sent.iter().map(|m| m.sequence_number).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(sent[0].flags, FLAG_FIRST);
        assert_eq!(sent[1].flags, 0);
        assert_eq!(sent[0].schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(stream.outgoing_len().await, 4);
    }

    #[tokio::test]
    async fn test_acknowledgement_releases_buffered_frame() {
        let channel = FakeChannel::new();
        let stream = DataStream::new(test_params(channel.clone(), None));
        stream.open().await.unwrap();
        stream.skip_handshake();

        stream.send_stream_data(PayloadType::Output, b"x").await.unwrap();
        stream.send_stream_data(PayloadType::Output, b"y").await.unwrap();
        assert_eq!(stream.outgoing_len().await, 2);

        let sent = channel.sent_messages();
        let first = sent
            .iter()
            .find(|m| m.message_type == MessageType::InputStreamData)
            .unwrap();
        channel.inject(ack_frame(first));
        settle().await;

        assert_eq!(stream.outgoing_len().await, 1);
        assert!(!stream.drain(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_unacknowledged_frame_is_retransmitted() {
        let channel = FakeChannel::new();
        let mut params = test_params(channel.clone(), None);
        params.stream_config.initial_retransmission_timeout = Duration::from_millis(20);
        params.stream_config.max_retransmission_timeout = Duration::from_millis(20);
        let stream = DataStream::new(params);
        stream.open().await.unwrap();
        stream.skip_handshake();

        stream.send_stream_data(PayloadType::Output, b"z").await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let copies = channel
            .sent_messages()
            .into_iter()
            .filter(|m| m.message_type == MessageType::InputStreamData && m.sequence_number == 0)
            .count();
        assert!(copies >= 2, "expected a retransmission, saw {copies}");
    }

    #[tokio::test]
    async fn test_pause_suppresses_wire_sends_but_keeps_sequencing() {
        let channel = FakeChannel::new();
        let stream = DataStream::new(test_params(channel.clone(), None));
        stream.open().await.unwrap();
        stream.skip_handshake();

        let pause = AgentMessage::new(
            MessageType::PausePublication,
            PAYLOAD_TYPE_NONE,
            0,
            0,
            Bytes::new(),
        )
        .serialize()
        .unwrap();
        channel.inject(pause);
        settle().await;

        stream.send_stream_data(PayloadType::Output, b"held").await.unwrap();
        assert_eq!(
            channel
                .sent_messages()
                .into_iter()
                .filter(|m| m.message_type == MessageType::InputStreamData)
                .count(),
            0
        );
        assert_eq!(stream.outgoing_len().await, 1);

        let resume = AgentMessage::new(
            MessageType::StartPublication,
            PAYLOAD_TYPE_NONE,
            0,
            0,
            Bytes::new(),
        )
        .serialize()
        .unwrap();
        channel.inject(resume);
        // The resend loop now picks the held frame up.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(channel
            .sent_messages()
            .into_iter()
            .any(|m| m.message_type == MessageType::InputStreamData));
    }

    #[tokio::test]
    async fn test_channel_closed_signals_cancellation() {
        let channel = FakeChannel::new();
        let stream = DataStream::new(test_params(channel.clone(), None));
        stream.open().await.unwrap();

        let closed = AgentMessage::new(
            MessageType::ChannelClosed,
            PAYLOAD_TYPE_NONE,
            0,
            0,
            Bytes::new(),
        )
        .serialize()
        .unwrap();
        channel.inject(closed);
        settle().await;

        assert_eq!(stream.cancel_flag().state(), CancelState::Cancelled);
    }

    #[tokio::test]
    async fn test_transport_error_triggers_reconnect_with_fresh_token() {
        let channel = FakeChannel::new();
        let stream = DataStream::new(test_params(channel.clone(), None));
        stream.open().await.unwrap();
        stream.skip_handshake();
        stream.send_stream_data(PayloadType::Output, b"pre").await.unwrap();

        channel.inject_error();
        settle().await;

        assert_eq!(*channel.open_count.lock().unwrap(), 2);
        assert_eq!(
            channel.get_token().expose_secret(),
            &"token-fresh".to_owned()
        );
        // Registration was sent again and the buffers survived.
        assert_eq!(channel.sent_text_frames().len(), 2);
        assert_eq!(stream.outgoing_len().await, 1);
    }

    #[tokio::test]
    async fn test_handler_not_ready_defers_ack_and_delivery() {
        let channel = FakeChannel::new();
        let stream = DataStream::new(test_params(channel.clone(), None));
        stream.open().await.unwrap();
        stream.skip_handshake();

        let handler = RecordingHandler::new();
        handler.ready.store(false, Ordering::SeqCst);
        stream.set_handler(handler.clone()).await;

        channel.inject(input_frame(0, b"early"));
        settle().await;
        assert!(handler.sequences.lock().unwrap().is_empty());
        assert!(channel
            .sent_messages()
            .into_iter()
            .all(|m| m.message_type != MessageType::Acknowledge));

        handler.ready.store(true, Ordering::SeqCst);
        channel.inject(input_frame(0, b"early"));
        settle().await;
        assert_eq!(*handler.sequences.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_rto_estimator_tracks_samples_and_respects_maximum() {
        let config = StreamConfig::default();
        let mut rto = RtoEstimator::new(&config);

        rto.observe(50.0);
        assert!(rto.current() >= Duration::from_millis(50));
        assert!(rto.current() <= config.max_retransmission_timeout);

        for _ in 0..100 {
            rto.observe(10_000.0);
        }
        assert_eq!(rto.current(), config.max_retransmission_timeout);

        let mut calm = RtoEstimator::new(&config);
        for _ in 0..100 {
            calm.observe(20.0);
        }
        // Converged: RTO ≈ RTT + granularity, and never below the RTT.
        assert!(calm.current().as_secs_f64() * 1000.0 >= calm.round_trip_time_ms());
    }
}
