mod buffer;
mod cancel;
mod crypto;
mod facade;
mod handshake;
mod host;
mod plugin;
mod retry;
mod stream;
mod transport;

pub mod wire;

pub use buffer::{IncomingBuffer, OutgoingBuffer, StreamingMessage};
pub use cancel::{CancelFlag, CancelState};
pub use crypto::{BlockCipher, CryptoError, KmsFacade};
pub use facade::{ControlPlaneFacade, IdentityFacade};
pub use handshake::{Handshake, HandshakeError, HandshakePhase};
pub use host::{SessionHost, SessionOutcome, SessionRequest};
pub use plugin::{
    HandlerStatus, InboundMessageHandler, IoHandler, PluginRegistry, SessionEnv, SessionPlugin,
    SessionResult, SessionStatus, SESSION_TYPE_INTERACTIVE_COMMANDS,
    SESSION_TYPE_NON_INTERACTIVE_COMMANDS, SESSION_TYPE_PORT, SESSION_TYPE_STANDARD_STREAM,
};
pub use retry::ExponentialRetryer;
pub use stream::{DataStream, DataStreamParams, RtoEstimator, StreamError};
pub use transport::{ChannelEvent, FrameKind, MessageChannel, TransportError, WebSocketChannel};
