//! Minimal stream multiplexer, wire-compatible with smux v1: many
//! logical byte streams over one connection, 8-byte frame headers
//! (version, command, length, stream id).

mod frame;
mod session;

use std::path::{Path, PathBuf};

pub use frame::{Frame, MuxCommand, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD, MUX_VERSION};
pub use session::{MuxConfig, MuxSession, MuxStream, MuxStreamReader, MuxStreamWriter};

#[derive(thiserror::Error, Debug)]
pub enum MuxError {
    #[error("unsupported multiplexer frame version {0}")]
    BadVersion(u8),
    #[error("unknown multiplexer command {0}")]
    UnknownCommand(u8),
    #[error("multiplexer session closed")]
    Closed,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Local socket path for a session's multiplexer, derived from the
/// session id by FNV-32a so it stays short and filesystem-safe.
pub fn socket_path(base: &Path, session_id: &str) -> PathBuf {
    base.join(format!("mux-{:08x}.sock", fnv32a(session_id)))
}

fn fnv32a(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
