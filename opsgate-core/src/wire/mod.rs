mod message;
mod payload;

pub use message::{
    AgentMessage, MessageType, PayloadType, WireError, CURRENT_SCHEMA_VERSION, FLAG_FINAL,
    FLAG_FIRST, PAYLOAD_TYPE_NONE,
};
pub use payload::{
    AcknowledgeContent, AgentSessionStateContent, OpenDataChannelInput, PortFlag, SessionState,
    SizeContent,
};
