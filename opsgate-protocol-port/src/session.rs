use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use opsgate_common::{
    EXIT_CODE_FAILURE, CLIENT_OWNS_KEEPALIVE_AFTER, MUX_SUPPORTED_SINCE,
};
use opsgate_core::wire::AgentMessage;
use opsgate_core::{
    CancelFlag, DataStream, HandlerStatus, InboundMessageHandler, IoHandler, SessionEnv,
    SessionPlugin, SessionStatus,
};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::*;

use crate::basic::BasicPortSession;
use crate::error::PortError;
use crate::mux::socket_path;
use crate::muxport::MuxPortSession;
use crate::validation::validate_destination;

pub const PORT_TYPE_LOCAL_FORWARDING: &str = "LocalPortForwarding";

const DEFAULT_HOST: &str = "localhost";
const MUX_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PortProperties {
    #[serde(rename = "portNumber", default)]
    pub port_number: String,
    #[serde(default)]
    pub host: String,
    #[serde(rename = "type", default)]
    pub port_type: String,
}

impl PortProperties {
    pub fn parse(properties: &serde_json::Value) -> Result<Self, PortError> {
        Ok(serde_json::from_value(properties.clone())?)
    }
}

enum PortVariant {
    Basic(Arc<BasicPortSession>),
    Mux(Arc<MuxPortSession>),
}

/// Port-forwarding session plugin. Picks the single-connection or
/// multiplexed flavor once the client version is known from the
/// handshake; inbound frames arriving before that are deferred.
pub struct PortSession {
    env: SessionEnv,
    denied_networks: Vec<IpNet>,
    denied_addresses: Vec<IpAddr>,
    mux_socket_dir: PathBuf,
    inner: RwLock<Option<PortVariant>>,
}

impl PortSession {
    pub fn new(
        env: SessionEnv,
        denied_networks: Vec<IpNet>,
        denied_addresses: Vec<IpAddr>,
        mux_socket_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(PortSession {
            env,
            denied_networks,
            denied_addresses,
            mux_socket_dir,
            inner: RwLock::new(None),
        })
    }
}

#[async_trait]
impl InboundMessageHandler for PortSession {
    async fn handle(&self, message: &AgentMessage) -> Result<HandlerStatus> {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(PortVariant::Basic(session)) => session.handle(message).await,
            Some(PortVariant::Mux(session)) => session.handle(message).await,
            None => Ok(HandlerStatus::NotReady),
        }
    }
}

#[async_trait]
impl SessionPlugin for PortSession {
    fn requires_handshake(&self) -> bool {
        // The session type (and the client version that gates the
        // multiplexer) must be negotiated before data can flow.
        true
    }

    async fn execute(
        self: Arc<Self>,
        stream: Arc<DataStream>,
        cancel: CancelFlag,
        io: Arc<dyn IoHandler>,
    ) -> Result<()> {
        let fail = |io: &Arc<dyn IoHandler>, error: &dyn std::fmt::Display| {
            io.set_status(SessionStatus::Failed);
            io.set_exit_code(EXIT_CODE_FAILURE);
            io.set_output(error.to_string());
        };

        let properties = match PortProperties::parse(&self.env.properties) {
            Ok(properties) => properties,
            Err(error) => {
                fail(&io, &error);
                return Err(error.into());
            }
        };

        if let Err(error) = validate_destination(
            &properties.host,
            &properties.port_number,
            &self.denied_networks,
            &self.denied_addresses,
        )
        .await
        {
            fail(&io, &error);
            return Err(error.into());
        }

        let client_version = stream.client_version().await;
        let use_mux = properties.port_type == PORT_TYPE_LOCAL_FORWARDING
            && client_version
                .map(|version| version >= MUX_SUPPORTED_SINCE)
                .unwrap_or(false);

        let result: Result<(), PortError> = if use_mux {
            // Newer clients drive the keep-alive themselves.
            let keep_alive = match client_version {
                Some(version) if version > CLIENT_OWNS_KEEPALIVE_AFTER => None,
                _ => Some(MUX_KEEP_ALIVE),
            };
            info!(port = %properties.port_number, ?client_version, "Starting multiplexed port session");
            let session = MuxPortSession::new(
                properties.port_number.clone(),
                stream.stream_data_payload_size(),
                socket_path(&self.mux_socket_dir, &self.env.session_id),
            );
            *self.inner.write().await = Some(PortVariant::Mux(session.clone()));
            session.run(stream.clone(), cancel, keep_alive).await
        } else {
            let host = if properties.host.is_empty() {
                DEFAULT_HOST.to_owned()
            } else {
                properties.host.clone()
            };
            info!(%host, port = %properties.port_number, "Starting port session");
            let session = BasicPortSession::new(
                host,
                properties.port_number.clone(),
                stream.stream_data_payload_size(),
            );
            *self.inner.write().await = Some(PortVariant::Basic(session.clone()));
            session.run(stream.clone(), cancel).await
        };

        if let Err(error) = result {
            fail(&io, &error);
            return Err(error.into());
        }
        Ok(())
    }
}
