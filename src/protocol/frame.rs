//! Frame structure and flag handling.

use bytes::Bytes;

/// Frame type, a bit-enumerated flag byte. Exactly one flag is set per
/// frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Open a stream; payload is the UTF-8 target address `host:port`.
    Syn = 1,
    /// Close a stream; seq is the sender's final write sequence.
    Fin = 2,
    /// Abort a stream (server-side dial failure).
    Rst = 4,
    /// Application bytes.
    Data = 8,
    /// Acknowledge one DATA seq on the link it arrived on.
    Ack = 16,
    /// Latency probe; payload is an 8-byte big-endian nanosecond timestamp.
    Ping = 32,
    /// Probe echo, payload copied verbatim from the PING.
    Pong = 64,
    /// Request retransmission of a missing seq.
    Nack = 128,
}

impl FrameKind {
    /// Parse the flag byte. Rejects zero, multi-bit, and unknown values.
    pub fn from_bits(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Syn),
            2 => Some(Self::Fin),
            4 => Some(Self::Rst),
            8 => Some(Self::Data),
            16 => Some(Self::Ack),
            32 => Some(Self::Ping),
            64 => Some(Self::Pong),
            128 => Some(Self::Nack),
            _ => None,
        }
    }

    /// Raw flag byte.
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Frames counted in a link's windowed sent counter for loss estimation.
    pub fn counts_as_sent(self) -> bool {
        matches!(self, Self::Data | Self::Fin)
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Syn => "SYN",
            Self::Fin => "FIN",
            Self::Rst => "RST",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Nack => "NACK",
        };
        f.write_str(s)
    }
}

/// One tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: u32,
    pub seq: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, stream_id: u32, seq: u32, payload: Bytes) -> Self {
        Self {
            kind,
            stream_id,
            seq,
            payload,
        }
    }

    /// SYN carrying the target address.
    pub fn syn(stream_id: u32, target: &str) -> Self {
        Self::new(
            FrameKind::Syn,
            stream_id,
            0,
            Bytes::copy_from_slice(target.as_bytes()),
        )
    }

    pub fn data(stream_id: u32, seq: u32, payload: Bytes) -> Self {
        Self::new(FrameKind::Data, stream_id, seq, payload)
    }

    pub fn ack(stream_id: u32, seq: u32) -> Self {
        Self::new(FrameKind::Ack, stream_id, seq, Bytes::new())
    }

    pub fn nack(stream_id: u32, seq: u32) -> Self {
        Self::new(FrameKind::Nack, stream_id, seq, Bytes::new())
    }

    pub fn fin(stream_id: u32, seq: u32) -> Self {
        Self::new(FrameKind::Fin, stream_id, seq, Bytes::new())
    }

    pub fn rst(stream_id: u32) -> Self {
        Self::new(FrameKind::Rst, stream_id, 0, Bytes::new())
    }

    /// PING with a nanosecond timestamp payload; stream id and seq are zero.
    pub fn ping(timestamp_nanos: u64) -> Self {
        Self::new(
            FrameKind::Ping,
            0,
            0,
            Bytes::copy_from_slice(&timestamp_nanos.to_be_bytes()),
        )
    }

    /// PONG echoing a PING payload verbatim.
    pub fn pong(echo: Bytes) -> Self {
        Self::new(FrameKind::Pong, 0, 0, echo)
    }
}
