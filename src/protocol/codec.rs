//! Frame encoding and decoding over async byte streams.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Frame, FrameKind, HEADER_SIZE, MAGIC};
use crate::error::{ProtocolError, Result};

/// Write one frame: the 17-byte header, then the payload. The caller holds
/// the link's write lock, so two sequential writes cannot interleave with
/// another frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = frame.kind.bits();
    BigEndian::write_u32(&mut header[5..9], frame.stream_id);
    BigEndian::write_u32(&mut header[9..13], frame.seq);
    BigEndian::write_u32(&mut header[13..17], frame.payload.len() as u32);

    writer.write_all(&header).await?;
    if !frame.payload.is_empty() {
        writer.write_all(&frame.payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Fails with `InvalidMagic` on a bad magic, `InvalidFlags`
/// on an unknown flag byte, `OversizedFrame` when the length field exceeds
/// `max_payload`, or the underlying I/O error unchanged.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    if header[..4] != MAGIC {
        return Err(ProtocolError::InvalidMagic.into());
    }
    let kind =
        FrameKind::from_bits(header[4]).ok_or(ProtocolError::InvalidFlags(header[4]))?;
    let stream_id = BigEndian::read_u32(&header[5..9]);
    let seq = BigEndian::read_u32(&header[9..13]);
    let len = BigEndian::read_u32(&header[13..17]) as usize;

    if len > max_payload {
        return Err(ProtocolError::OversizedFrame {
            size: len,
            max: max_payload,
        }
        .into());
    }

    let payload = if len == 0 {
        Bytes::new()
    } else {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Bytes::from(buf)
    };

    Ok(Frame {
        kind,
        stream_id,
        seq,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    async fn round_trip(frame: &Frame, max_payload: usize) -> Result<Frame> {
        let mut buf = Vec::new();
        write_frame(&mut buf, frame).await?;
        read_frame(&mut buf.as_slice(), max_payload).await
    }

    #[tokio::test]
    async fn test_round_trip_all_kinds() {
        let frames = [
            Frame::syn(7, "example.com:443"),
            Frame::data(7, 1, Bytes::from_static(b"hello world")),
            Frame::ack(7, 1),
            Frame::nack(7, 4),
            Frame::fin(7, 9),
            Frame::rst(7),
            Frame::ping(123_456_789),
            Frame::pong(Bytes::copy_from_slice(&123_456_789u64.to_be_bytes())),
        ];
        for frame in frames {
            let decoded = round_trip(&frame, 32 * 1024).await.unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[tokio::test]
    async fn test_zero_length_data_decodes() {
        let frame = Frame::data(1, 1, Bytes::new());
        let decoded = round_trip(&frame, 32 * 1024).await.unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.kind, FrameKind::Data);
    }

    #[tokio::test]
    async fn test_payload_at_limit_decodes() {
        let max = 4096;
        let frame = Frame::data(1, 1, Bytes::from(vec![0xAB; max]));
        let decoded = round_trip(&frame, max).await.unwrap();
        assert_eq!(decoded.payload.len(), max);
    }

    #[tokio::test]
    async fn test_payload_over_limit_errors() {
        let max = 4096;
        let frame = Frame::data(1, 1, Bytes::from(vec![0xAB; max + 1]));
        let err = round_trip(&frame, max).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::OversizedFrame { size, max: m })
                if size == max + 1 && m == max
        ));
    }

    #[tokio::test]
    async fn test_bad_magic_errors() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::ack(1, 1)).await.unwrap();
        buf[0] = b'X';
        let err = read_frame(&mut buf.as_slice(), 32 * 1024).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidMagic)));
    }

    #[tokio::test]
    async fn test_bad_flags_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::ack(1, 1)).await.unwrap();
        buf[4] = 8 | 16; // two flags at once
        let err = read_frame(&mut buf.as_slice(), 32 * 1024).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidFlags(0x18))
        ));
    }

    #[tokio::test]
    async fn test_truncated_header_is_io_error() {
        let buf = [b'M', b'O', b'T'];
        let err = read_frame(&mut buf.as_slice(), 32 * 1024).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
