use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::MuxError;

pub const MUX_VERSION: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 8;
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxCommand {
    /// Open a stream.
    Syn = 0,
    /// Close a stream.
    Fin = 1,
    /// Stream data.
    Psh = 2,
    /// Keep-alive.
    Nop = 3,
}

impl MuxCommand {
    fn from_u8(value: u8) -> Result<Self, MuxError> {
        match value {
            0 => Ok(MuxCommand::Syn),
            1 => Ok(MuxCommand::Fin),
            2 => Ok(MuxCommand::Psh),
            3 => Ok(MuxCommand::Nop),
            other => Err(MuxError::UnknownCommand(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: MuxCommand,
    pub stream_id: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(command: MuxCommand, stream_id: u32) -> Self {
        Frame {
            command,
            stream_id,
            data: Bytes::new(),
        }
    }

    pub fn with_data(command: MuxCommand, stream_id: u32, data: Bytes) -> Self {
        debug_assert!(data.len() <= MAX_FRAME_PAYLOAD);
        Frame {
            command,
            stream_id,
            data,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.data.len());
        buf.put_u8(MUX_VERSION);
        buf.put_u8(self.command as u8);
        buf.put_u16_le(self.data.len() as u16);
        buf.put_u32_le(self.stream_id);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Takes one complete frame off the front of `buf`, or returns None
    /// if more bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let version = buf[0];
        if version != MUX_VERSION {
            return Err(MuxError::BadVersion(version));
        }
        let command = MuxCommand::from_u8(buf[1])?;
        let length = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }
        let stream_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        buf.advance(FRAME_HEADER_LEN);
        let data = buf.split_to(length).freeze();
        Ok(Some(Frame {
            command,
            stream_id,
            data,
        }))
    }
}
