use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;

/// A sent frame retained for retransmission until acknowledged.
#[derive(Debug, Clone)]
pub struct StreamingMessage {
    pub content: Bytes,
    pub sequence_number: i64,
    pub last_sent_time: Instant,
}

/// Ordered retransmission buffer. When full, new frames are not retained
/// (they still go out on the wire once); retransmission only covers what
/// fits.
pub struct OutgoingBuffer {
    messages: VecDeque<StreamingMessage>,
    capacity: usize,
}

impl OutgoingBuffer {
    pub fn new(capacity: usize) -> Self {
        OutgoingBuffer {
            messages: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Returns false if the frame was dropped because the buffer is full.
    pub fn push(&mut self, message: StreamingMessage) -> bool {
        if self.messages.len() >= self.capacity {
            return false;
        }
        self.messages.push_back(message);
        true
    }

    pub fn remove(&mut self, sequence_number: i64) -> Option<StreamingMessage> {
        let index = self
            .messages
            .iter()
            .position(|m| m.sequence_number == sequence_number)?;
        self.messages.remove(index)
    }

    pub fn front(&self) -> Option<&StreamingMessage> {
        self.messages.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut StreamingMessage> {
        self.messages.front_mut()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Reorder buffer for frames received ahead of the expected sequence.
/// Stores the serialized frame so a buffered message is re-decoded (and
/// re-decrypted) only when it is actually delivered.
pub struct IncomingBuffer {
    frames: HashMap<i64, Bytes>,
    capacity: usize,
}

impl IncomingBuffer {
    pub fn new(capacity: usize) -> Self {
        IncomingBuffer {
            frames: HashMap::new(),
            capacity,
        }
    }

    pub fn has_space(&self) -> bool {
        self.frames.len() < self.capacity
    }

    /// Returns false if the frame was dropped because the buffer is full.
    pub fn insert(&mut self, sequence_number: i64, frame: Bytes) -> bool {
        if !self.has_space() && !self.frames.contains_key(&sequence_number) {
            return false;
        }
        self.frames.insert(sequence_number, frame);
        true
    }

    pub fn remove(&mut self, sequence_number: i64) -> Option<Bytes> {
        self.frames.remove(&sequence_number)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
