use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::Result;
use async_trait::async_trait;
use opsgate_common::OpsgateError;

use crate::cancel::CancelFlag;
use crate::stream::DataStream;
use crate::wire::AgentMessage;

pub const SESSION_TYPE_STANDARD_STREAM: &str = "Standard_Stream";
pub const SESSION_TYPE_INTERACTIVE_COMMANDS: &str = "InteractiveCommands";
pub const SESSION_TYPE_NON_INTERACTIVE_COMMANDS: &str = "NonInteractiveCommands";
pub const SESSION_TYPE_PORT: &str = "Port";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Handled,
    /// The plugin surface is not up yet (e.g. a port session before its
    /// first dial). The frame is neither acknowledged nor counted as
    /// delivered; the client will resend it.
    NotReady,
}

/// Upward callback: the stream hands in-order decrypted frames to the
/// session plugin through this interface.
#[async_trait]
pub trait InboundMessageHandler: Send + Sync {
    async fn handle(&self, message: &AgentMessage) -> Result<HandlerStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Success,
    Failed,
}

/// Session outcome sink. Exit codes are passed through unmapped; the
/// reboot and preemptive-stop codes keep their platform values.
pub trait IoHandler: Send + Sync {
    fn set_status(&self, status: SessionStatus);
    fn set_exit_code(&self, code: i32);
    fn set_output(&self, output: String);
}

/// Simple in-memory [`IoHandler`].
#[derive(Default)]
pub struct SessionResult {
    status: StdMutex<Option<SessionStatus>>,
    exit_code: StdMutex<Option<i32>>,
    output: StdMutex<Option<String>>,
}

impl SessionResult {
    pub fn status(&self) -> Option<SessionStatus> {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn output(&self) -> Option<String> {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl IoHandler for SessionResult {
    fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
    }

    fn set_exit_code(&self, code: i32) {
        *self.exit_code.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
    }

    fn set_output(&self, output: String) {
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = Some(output);
    }
}

/// Everything a plugin learns about its session before execution.
#[derive(Debug, Clone)]
pub struct SessionEnv {
    pub session_id: String,
    pub client_id: String,
    pub instance_id: String,
    pub session_type: String,
    pub kms_key_id: Option<String>,
    pub properties: serde_json::Value,
}

#[async_trait]
pub trait SessionPlugin: InboundMessageHandler {
    /// Whether this session type needs the negotiation exchange even
    /// without encryption.
    fn requires_handshake(&self) -> bool;

    async fn execute(
        self: Arc<Self>,
        stream: Arc<DataStream>,
        cancel: CancelFlag,
        io: Arc<dyn IoHandler>,
    ) -> Result<()>;
}

pub type PluginFactory =
    Box<dyn Fn(SessionEnv) -> Result<Arc<dyn SessionPlugin>> + Send + Sync>;

/// Session-type name to plugin constructor map, populated by the worker
/// at startup.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session_type: &str, factory: PluginFactory) {
        self.factories.insert(session_type.to_owned(), factory);
    }

    pub fn resolve(&self, env: SessionEnv) -> Result<Arc<dyn SessionPlugin>, OpsgateError> {
        let factory = self
            .factories
            .get(&env.session_type)
            .ok_or_else(|| OpsgateError::UnknownSessionType(env.session_type.clone()))?;
        factory(env).map_err(OpsgateError::Anyhow)
    }
}
