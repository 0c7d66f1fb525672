use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use opsgate_common::{ChannelRole, OpsgateConfig, OpsgateError};
use tracing::*;

use crate::cancel::CancelFlag;
use crate::crypto::KmsFacade;
use crate::facade::ControlPlaneFacade;
use crate::plugin::{
    HandlerStatus, InboundMessageHandler, IoHandler, PluginRegistry, SessionEnv, SessionPlugin,
    SessionStatus, SESSION_TYPE_PORT,
};
use crate::retry::ExponentialRetryer;
use crate::stream::{DataStream, DataStreamParams};
use crate::transport::MessageChannel;
use crate::wire::{AgentMessage, SessionState};

pub struct SessionRequest {
    pub env: SessionEnv,
    pub transport: Arc<dyn MessageChannel>,
    pub control_plane: Arc<dyn ControlPlaneFacade>,
    pub kms: Option<Arc<dyn KmsFacade>>,
    pub io: Arc<dyn IoHandler>,
    /// Shared with the worker so external termination reaches the
    /// plugin and the stream.
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub status: SessionStatus,
}

/// Bridges the plugin's upward callback onto the stream without tying
/// the stream to the plugin trait.
struct PluginHandler(Arc<dyn SessionPlugin>);

#[async_trait]
impl InboundMessageHandler for PluginHandler {
    async fn handle(&self, message: &AgentMessage) -> Result<HandlerStatus> {
        self.0.handle(message).await
    }
}

/// Resolves the session plugin, brings up the reliable stream, runs the
/// negotiation (or skips it), executes the plugin and tears everything
/// down.
pub struct SessionHost {
    registry: PluginRegistry,
    config: OpsgateConfig,
}

impl SessionHost {
    pub fn new(registry: PluginRegistry, config: OpsgateConfig) -> Self {
        SessionHost { registry, config }
    }

    pub async fn run_session(&self, request: SessionRequest) -> Result<SessionOutcome, OpsgateError> {
        let env = request.env;
        info!(session = %env.session_id, session_type = %env.session_type, "Starting session");

        let plugin = self.registry.resolve(env.clone())?;

        let cancel = request.cancel.clone();
        let stream = DataStream::new(DataStreamParams {
            channel_id: env.session_id.clone(),
            client_id: env.client_id.clone(),
            instance_id: env.instance_id.clone(),
            role: ChannelRole::Publish,
            transport: request.transport,
            control_plane: request.control_plane,
            kms: request.kms,
            stream_config: self.config.stream.clone(),
            retry_config: self.config.retry.clone(),
            handshake_config: self.config.handshake.clone(),
            cancel: cancel.clone(),
        });

        let retryer = ExponentialRetryer::new(self.config.retry.clone());
        retryer
            .call(|| {
                let stream = stream.clone();
                async move { stream.open().await }
            })
            .await
            .map_err(|error| OpsgateError::Anyhow(anyhow::anyhow!(error)))?;

        if let Err(error) = stream.send_agent_session_state(SessionState::Connected).await {
            warn!(%error, "Failed to announce the connected state");
        }

        let needs_handshake = plugin.requires_handshake()
            || (env.kms_key_id.is_some() && env.session_type != SESSION_TYPE_PORT);
        if needs_handshake {
            // Port sessions negotiate the session type but never the
            // data key.
            let kms_key_id = if env.session_type == SESSION_TYPE_PORT {
                None
            } else {
                env.kms_key_id.clone()
            };
            if let Err(error) = stream
                .perform_handshake(&env.session_type, env.properties.clone(), kms_key_id)
                .await
            {
                request.io.set_status(SessionStatus::Failed);
                request.io.set_exit_code(opsgate_common::EXIT_CODE_FAILURE);
                request.io.set_output(error.to_string());
                self.teardown(&stream).await;
                return Ok(SessionOutcome {
                    status: SessionStatus::Failed,
                });
            }
        } else {
            stream.skip_handshake();
        }

        stream
            .set_handler(Arc::new(PluginHandler(plugin.clone())))
            .await;

        let result = plugin
            .clone()
            .execute(stream.clone(), cancel.clone(), request.io.clone())
            .await;

        stream.clear_handler().await;
        self.teardown(&stream).await;

        let status = match result {
            Ok(()) => {
                request.io.set_status(SessionStatus::Success);
                SessionStatus::Success
            }
            Err(error) => {
                error!(%error, "Session plugin failed");
                request.io.set_status(SessionStatus::Failed);
                request.io.set_output(error.to_string());
                SessionStatus::Failed
            }
        };
        Ok(SessionOutcome { status })
    }

    async fn teardown(&self, stream: &Arc<DataStream>) {
        if !stream.drain(self.config.stream.drain_timeout).await {
            warn!("Closing with unacknowledged frames still buffered");
        }
        stream.close().await;
    }
}
