//! Binary framing for control-plane messages.
//!
//! Fixed big-endian layout:
//!
//! ```text
//! offset  size  field
//! 0       4     header length (always 88)
//! 4       32    message type, ASCII, right-padded with spaces
//! 36      4     schema version
//! 40      8     created date, epoch milliseconds
//! 48      8     sequence number (i64)
//! 56      8     flags
//! 64      16    message id (UUID)
//! 80      4     payload type
//! 84      4     payload length
//! 88      32    SHA-256 over bytes [0..88) followed by the payload
//! 120     ...   payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Set on the first stream-data frame of a session.
pub const FLAG_FIRST: u64 = 1;
/// Set on the final frame of a logical message.
pub const FLAG_FINAL: u64 = 2;

/// Payload type of frames that carry no stream payload (acks, state).
pub const PAYLOAD_TYPE_NONE: u32 = 0;

const HEADER_LEN: usize = 88;
const DIGEST_LEN: usize = 32;
const MESSAGE_TYPE_LEN: usize = 32;
const MIN_FRAME_LEN: usize = HEADER_LEN + DIGEST_LEN;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed field: {0}")]
    MalformedField(&'static str),
    #[error("frame truncated")]
    Truncated,
    #[error("unsupported schema or layout version {0}")]
    BadVersion(u32),
    #[error("payload digest mismatch")]
    DigestMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    InputStreamData,
    OutputStreamData,
    Acknowledge,
    ChannelClosed,
    PausePublication,
    StartPublication,
    AgentSessionState,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::InputStreamData => "input_stream_data",
            MessageType::OutputStreamData => "output_stream_data",
            MessageType::Acknowledge => "acknowledge",
            MessageType::ChannelClosed => "channel_closed",
            MessageType::PausePublication => "pause_publication",
            MessageType::StartPublication => "start_publication",
            MessageType::AgentSessionState => "agent_session_state",
            MessageType::Other(s) => s,
        }
    }

    fn from_wire(s: &str) -> Self {
        match s {
            "input_stream_data" => MessageType::InputStreamData,
            "output_stream_data" => MessageType::OutputStreamData,
            "acknowledge" => MessageType::Acknowledge,
            "channel_closed" => MessageType::ChannelClosed,
            "pause_publication" => MessageType::PausePublication,
            "start_publication" => MessageType::StartPublication,
            "agent_session_state" => MessageType::AgentSessionState,
            other => MessageType::Other(other.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadType {
    Output = 1,
    Size = 3,
    HandshakeRequest = 5,
    HandshakeResponse = 6,
    HandshakeComplete = 7,
    EncChallengeRequest = 8,
    EncChallengeResponse = 9,
    Flag = 10,
}

impl PayloadType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(PayloadType::Output),
            3 => Some(PayloadType::Size),
            5 => Some(PayloadType::HandshakeRequest),
            6 => Some(PayloadType::HandshakeResponse),
            7 => Some(PayloadType::HandshakeComplete),
            8 => Some(PayloadType::EncChallengeRequest),
            9 => Some(PayloadType::EncChallengeResponse),
            10 => Some(PayloadType::Flag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentMessage {
    pub message_type: MessageType,
    pub schema_version: u32,
    pub created_date: u64,
    pub sequence_number: i64,
    pub flags: u64,
    pub message_id: Uuid,
    pub payload_type: u32,
    pub payload: Bytes,
}

impl AgentMessage {
    pub fn new(
        message_type: MessageType,
        payload_type: u32,
        sequence_number: i64,
        flags: u64,
        payload: Bytes,
    ) -> Self {
        AgentMessage {
            message_type,
            schema_version: CURRENT_SCHEMA_VERSION,
            created_date: chrono::Utc::now().timestamp_millis() as u64,
            sequence_number,
            flags,
            message_id: Uuid::new_v4(),
            payload_type,
            payload,
        }
    }

    pub fn payload_kind(&self) -> Option<PayloadType> {
        PayloadType::from_u32(self.payload_type)
    }

    pub fn serialize(&self) -> Result<Bytes, WireError> {
        let name = self.message_type.as_str();
        if name.trim().is_empty() {
            return Err(WireError::MalformedField("message_type"));
        }
        if name.len() > MESSAGE_TYPE_LEN {
            return Err(WireError::MalformedField("message_type"));
        }
        if self.message_id.is_nil() {
            return Err(WireError::MalformedField("message_id"));
        }
        if self.payload.len() > u32::MAX as usize {
            return Err(WireError::MalformedField("payload"));
        }

        let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN + self.payload.len());
        buf.put_u32(HEADER_LEN as u32);
        buf.put_slice(name.as_bytes());
        buf.put_bytes(b' ', MESSAGE_TYPE_LEN - name.len());
        buf.put_u32(self.schema_version);
        buf.put_u64(self.created_date);
        buf.put_i64(self.sequence_number);
        buf.put_u64(self.flags);
        buf.put_slice(self.message_id.as_bytes());
        buf.put_u32(self.payload_type);
        buf.put_u32(self.payload.len() as u32);

        let mut hasher = Sha256::new();
        hasher.update(&buf[..HEADER_LEN]);
        hasher.update(&self.payload);
        buf.put_slice(&hasher.finalize());

        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < MIN_FRAME_LEN {
            return Err(WireError::Truncated);
        }

        let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if header_len as usize != HEADER_LEN {
            return Err(WireError::BadVersion(header_len));
        }

        let name_raw = &data[4..4 + MESSAGE_TYPE_LEN];
        let name = std::str::from_utf8(name_raw)
            .map_err(|_| WireError::MalformedField("message_type"))?
            .trim_end_matches([' ', '\0'])
            .to_owned();

        let read_u32 =
            |at: usize| u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let read_u64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[at..at + 8]);
            u64::from_be_bytes(raw)
        };

        let schema_version = read_u32(36);
        if schema_version != CURRENT_SCHEMA_VERSION {
            return Err(WireError::BadVersion(schema_version));
        }

        let created_date = read_u64(40);
        let sequence_number = read_u64(48) as i64;
        let flags = read_u64(56);
        let message_id = Uuid::from_slice(&data[64..80])
            .map_err(|_| WireError::MalformedField("message_id"))?;
        let payload_type = read_u32(80);
        let payload_len = read_u32(84) as usize;

        if data.len() != MIN_FRAME_LEN + payload_len {
            return Err(WireError::Truncated);
        }
        let payload = &data[MIN_FRAME_LEN..];

        let mut hasher = Sha256::new();
        hasher.update(&data[..HEADER_LEN]);
        hasher.update(payload);
        if hasher.finalize().as_slice() != &data[HEADER_LEN..HEADER_LEN + DIGEST_LEN] {
            return Err(WireError::DigestMismatch);
        }

        Ok(AgentMessage {
            message_type: MessageType::from_wire(&name),
            schema_version,
            created_date,
            sequence_number,
            flags,
            message_id,
            payload_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Structural checks applied before dispatch. Unknown types are
    /// reported here so the caller can log and drop the frame.
    pub fn validate(&self) -> Result<(), String> {
        if self.message_type.as_str().trim().is_empty() {
            return Err("empty message type".to_owned());
        }
        if self.sequence_number < 0 {
            return Err(format!("negative sequence {}", self.sequence_number));
        }
        if matches!(
            self.message_type,
            MessageType::InputStreamData | MessageType::OutputStreamData
        ) && self.payload_kind().is_none()
        {
            return Err(format!("unknown payload type {}", self.payload_type));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentMessage {
        AgentMessage::new(
            MessageType::InputStreamData,
            PayloadType::Output as u32,
            7,
            0,
            Bytes::from_static(b"hello from the other side"),
        )
    }

    #[test]
    fn test_round_trip() {
        let msg = sample();
        let wire = msg.serialize().unwrap();
        let decoded = AgentMessage::deserialize(&wire).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let msg = AgentMessage::new(MessageType::Acknowledge, PAYLOAD_TYPE_NONE, 0, 3, Bytes::new());
        let decoded = AgentMessage::deserialize(&msg.serialize().unwrap()).unwrap();
        assert_eq!(decoded.payload.len(), 0);
        assert_eq!(decoded.flags, 3);
    }

    #[test]
    fn test_digest_mismatch_detected() {
        let wire = sample().serialize().unwrap();
        let mut tampered = wire.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert_eq!(
            AgentMessage::deserialize(&tampered),
            Err(WireError::DigestMismatch)
        );
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let wire = sample().serialize().unwrap();
        assert_eq!(
            AgentMessage::deserialize(&wire[..wire.len() - 1]),
            Err(WireError::Truncated)
        );
        assert_eq!(AgentMessage::deserialize(&wire[..40]), Err(WireError::Truncated));
    }

    #[test]
    fn test_bad_schema_version_rejected() {
        let mut msg = sample();
        msg.schema_version = 9;
        let wire = msg.serialize().unwrap();
        assert_eq!(AgentMessage::deserialize(&wire), Err(WireError::BadVersion(9)));
    }

    #[test]
    fn test_unknown_message_type_survives_decode_and_validate() {
        let msg = AgentMessage::new(
            MessageType::Other("brand_new_type".to_owned()),
            PAYLOAD_TYPE_NONE,
            0,
            0,
            Bytes::new(),
        );
        let decoded = AgentMessage::deserialize(&msg.serialize().unwrap()).unwrap();
        assert_eq!(
            decoded.message_type,
            MessageType::Other("brand_new_type".to_owned())
        );
        // Forward compatibility: the dispatcher logs and drops these.
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_serialize_rejects_nil_message_id() {
        let mut msg = sample();
        msg.message_id = Uuid::nil();
        assert_eq!(msg.serialize(), Err(WireError::MalformedField("message_id")));
    }

    #[test]
    fn test_validate_rejects_unknown_payload_type_on_stream_data() {
        let mut msg = sample();
        msg.payload_type = 42;
        assert!(msg.validate().is_err());
    }
}
