//! Framed wire protocol for the accelerator tunnel.
//!
//! Every frame starts with a fixed 17-byte header: the 4-byte magic `MOTO`,
//! one flag byte, and three big-endian u32 fields (stream id, sequence,
//! payload length), followed by the payload.

mod codec;
mod frame;

pub use codec::{read_frame, write_frame};
pub use frame::{Frame, FrameKind};

/// Frame magic, first four bytes on the wire.
pub const MAGIC: [u8; 4] = *b"MOTO";

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 17;

/// Conservative lower bound for the receive-side payload limit. The
/// effective limit is the maximum of this and the largest frame size any
/// adaptation rule may propose, so the receiver tolerates every size the
/// sender can choose.
pub const MIN_MAX_PAYLOAD: usize = 32 * 1024;

use std::sync::OnceLock;
use std::time::Instant;

static MONOTONIC_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the process's monotonic epoch. Used as the PING
/// payload; the peer echoes it verbatim so epochs never mix.
pub fn monotonic_nanos() -> u64 {
    MONOTONIC_EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
