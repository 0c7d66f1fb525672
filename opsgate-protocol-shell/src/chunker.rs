use bytes::{Bytes, BytesMut};

/// Splits a byte stream into chunks that never end mid-rune. An
/// incomplete trailing UTF-8 sequence is carried over into the next
/// chunk; byte sequences that are not valid UTF-8 at all are passed
/// through untouched.
#[derive(Default)]
pub struct Utf8Chunker {
    carry: BytesMut,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, incoming: &[u8]) -> Bytes {
        self.carry.extend_from_slice(incoming);
        let boundary = complete_prefix_len(&self.carry);
        self.carry.split_to(boundary).freeze()
    }

    /// Whatever is still buffered, emitted as-is (stream end).
    pub fn flush(&mut self) -> Bytes {
        self.carry.split().freeze()
    }
}

/// Length of the longest prefix that does not end in a truncated UTF-8
/// sequence. Invalid bytes count as complete; only a genuinely
/// incomplete trailing rune is held back.
fn complete_prefix_len(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(error) => {
            if error.error_len().is_none() {
                error.valid_up_to()
            } else {
                buf.len()
            }
        }
    }
}
