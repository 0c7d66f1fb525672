//! JSON and flag payload bodies carried inside framed messages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of an `acknowledge` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcknowledgeContent {
    #[serde(rename = "AcknowledgedMessageType")]
    pub message_type: String,
    #[serde(rename = "AcknowledgedMessageId")]
    pub message_id: Uuid,
    #[serde(rename = "AcknowledgedMessageSequenceNumber")]
    pub sequence_number: i64,
    #[serde(rename = "IsSequentialMessage")]
    pub is_sequential_message: bool,
}

/// Registration blob sent as the first (text) frame after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OpenDataChannelInput {
    pub message_schema_version: String,
    pub request_id: String,
    pub token_value: String,
    pub client_instance_id: String,
    pub client_id: String,
}

/// Terminal geometry update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SizeContent {
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connected,
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentSessionStateContent {
    pub session_state: SessionState,
}

/// Control flag carried by a `Flag` payload as a 4-byte big-endian value.
/// The numeric values are fixed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortFlag {
    DisconnectToPort = 1,
    TerminateSession = 2,
    ConnectToPortError = 3,
}

impl PortFlag {
    pub fn to_wire(self) -> [u8; 4] {
        (self as u32).to_be_bytes()
    }

    pub fn from_wire(data: &[u8]) -> Option<Self> {
        if data.len() != 4 {
            return None;
        }
        match u32::from_be_bytes([data[0], data[1], data[2], data[3]]) {
            1 => Some(PortFlag::DisconnectToPort),
            2 => Some(PortFlag::TerminateSession),
            3 => Some(PortFlag::ConnectToPortError),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_json_field_names() {
        let ack = AcknowledgeContent {
            message_type: "input_stream_data".to_owned(),
            message_id: Uuid::new_v4(),
            sequence_number: 4,
            is_sequential_message: true,
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["AcknowledgedMessageSequenceNumber"], 4);
        assert_eq!(json["IsSequentialMessage"], true);
        assert_eq!(json["AcknowledgedMessageType"], "input_stream_data");
    }

    #[test]
    fn test_size_content_parses_protocol_shape() {
        let size: SizeContent = serde_json::from_str(r#"{"Cols": 120, "Rows": 40}"#).unwrap();
        assert_eq!(size, SizeContent { cols: 120, rows: 40 });
    }

    #[test]
    fn test_port_flag_wire_values() {
        assert_eq!(PortFlag::DisconnectToPort.to_wire(), [0, 0, 0, 1]);
        assert_eq!(PortFlag::from_wire(&[0, 0, 0, 2]), Some(PortFlag::TerminateSession));
        assert_eq!(PortFlag::from_wire(&[0, 0, 0, 3]), Some(PortFlag::ConnectToPortError));
        assert_eq!(PortFlag::from_wire(&[0, 0, 0, 9]), None);
        assert_eq!(PortFlag::from_wire(&[1]), None);
    }
}
