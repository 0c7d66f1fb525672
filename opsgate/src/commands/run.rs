use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use opsgate_common::tls::configure_tls_connector;
use opsgate_common::{OpsgateConfig, EXIT_CODE_FAILURE, EXIT_CODE_SUCCESS};
use opsgate_core::{
    CancelFlag, CancelState, IdentityFacade, PluginRegistry, SessionEnv, SessionHost,
    SessionPlugin, SessionRequest, SessionResult, SessionStatus, WebSocketChannel,
    SESSION_TYPE_INTERACTIVE_COMMANDS, SESSION_TYPE_NON_INTERACTIVE_COMMANDS, SESSION_TYPE_PORT,
    SESSION_TYPE_STANDARD_STREAM,
};
use opsgate_protocol_port::PortSession;
use opsgate_protocol_shell::{PipePtyFactory, PtyFactory, ShellMode, ShellSession};
use tokio::signal::unix::{signal, SignalKind};
use tracing::*;
use url::Url;

use crate::config::load_config;
use crate::descriptor::SessionDescriptor;
use crate::facades::{StaticControlPlane, StaticIdentity};
use crate::ipc::WorkerIpcBus;
use crate::Cli;

fn build_registry(config: &OpsgateConfig, identity: &StaticIdentity) -> PluginRegistry {
    let mut registry = PluginRegistry::new();

    let pty_factory: Arc<dyn PtyFactory> = Arc::new(PipePtyFactory::default());
    let session_data_dir = config.shell.session_data_dir.clone();
    let shell_types = [
        (SESSION_TYPE_STANDARD_STREAM, ShellMode::Interactive),
        (SESSION_TYPE_INTERACTIVE_COMMANDS, ShellMode::Interactive),
        (SESSION_TYPE_NON_INTERACTIVE_COMMANDS, ShellMode::NonInteractive),
    ];
    for (session_type, mode) in shell_types {
        let factory = pty_factory.clone();
        let dir = session_data_dir.clone();
        registry.register(
            session_type,
            Box::new(move |env| {
                let plugin: Arc<dyn SessionPlugin> =
                    ShellSession::new(env, mode, factory.clone(), dir.clone());
                Ok(plugin)
            }),
        );
    }

    let denied_networks = config.port.denied_destinations.clone();
    let denied_addresses = identity.denied_resolver_addresses();
    let mux_socket_dir = session_data_dir;
    registry.register(
        SESSION_TYPE_PORT,
        Box::new(move |env| {
            let plugin: Arc<dyn SessionPlugin> = PortSession::new(
                env,
                denied_networks.clone(),
                denied_addresses.clone(),
                mux_socket_dir.clone(),
            );
            Ok(plugin)
        }),
    );

    registry
}

pub(crate) async fn command(cli: &Cli, session_path: &Path) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!(%version, "Opsgate session worker");

    let config = load_config(&cli.config)?;
    let descriptor = SessionDescriptor::load(session_path)?;

    let identity = StaticIdentity {
        instance_id: config.agent.instance_id.clone(),
        region: config.agent.region.clone(),
    };
    let registry = build_registry(&config, &identity);

    let tls = configure_tls_connector(config.tls.custom_ca_path.as_deref())
        .context("setting up TLS")?;
    let url = Url::parse(&descriptor.stream_url).context("parsing the stream URL")?;
    let transport = Arc::new(WebSocketChannel::new(
        url,
        descriptor.token_value.clone(),
        Some(tls),
    ));
    let control_plane = Arc::new(StaticControlPlane::new(descriptor.token_value.clone()));

    let cancel = CancelFlag::new();
    let io = Arc::new(SessionResult::default());
    let host = SessionHost::new(registry, config.clone());

    let bus = WorkerIpcBus::new(
        config.worker.clone(),
        format!("opsgate-worker-{}", descriptor.session_id),
    );
    let mut ipc = bus.start();

    let env = SessionEnv {
        session_id: descriptor.session_id.clone(),
        client_id: descriptor.client_id.clone(),
        instance_id: identity.instance_id(),
        session_type: descriptor.session_type.clone(),
        kms_key_id: descriptor.kms_key_id.clone(),
        properties: descriptor.properties.clone(),
    };

    let session_future = host.run_session(SessionRequest {
        env,
        transport,
        control_plane,
        kms: None,
        io: io.clone(),
        cancel: cancel.clone(),
    });
    tokio::pin!(session_future);

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let outcome = tokio::select! {
        outcome = &mut session_future => outcome?,
        _ = ipc.termination_rx.recv() => {
            info!("Shutting down on termination request");
            cancel.set(CancelState::ShutDown);
            (&mut session_future).await?
        }
        _ = sigterm.recv() => {
            info!("Shutting down on SIGTERM");
            cancel.set(CancelState::ShutDown);
            (&mut session_future).await?
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down on interrupt");
            cancel.set(CancelState::ShutDown);
            (&mut session_future).await?
        }
    };

    let exit_code = io.exit_code().unwrap_or(match outcome.status {
        SessionStatus::Success => EXIT_CODE_SUCCESS,
        SessionStatus::Failed => EXIT_CODE_FAILURE,
    });
    info!(?outcome, exit_code, "Session finished");
    std::process::exit(exit_code);
}
