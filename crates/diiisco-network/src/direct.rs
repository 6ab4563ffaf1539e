//! One-shot direct messaging protocol.
//!
//! A single named protocol (default `/diiisco/direct/1.0.0`) carries
//! exactly one envelope per stream: one unsigned-varint length prefix
//! followed by the binary-packed envelope, answered by a one-byte
//! acknowledgement so the sender learns the frame was read. The size
//! cap is enforced on the declared length, before any allocation;
//! exceeding it aborts the stream.
//!
//! Because every message rides a fresh stream, direct messages carry
//! no cross-message ordering guarantee — session state is keyed by
//! session id, not by transport order.

use std::io;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::StreamProtocol;

use diiisco_protocol::Envelope;

// ---------------------------------------------------------------------------
// Ack
// ---------------------------------------------------------------------------

/// Single-byte acknowledgement closing the response half.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirectAck;

const ACK_BYTE: u8 = 0x01;

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Varint-framed single-envelope codec.
#[derive(Clone)]
pub struct DirectCodec {
    /// Frame cap in bytes, checked before allocation.
    pub max_message_size: usize,
}

#[async_trait]
impl request_response::Codec for DirectCodec {
    type Protocol = StreamProtocol;
    type Request = Envelope;
    type Response = DirectAck;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Envelope>
    where
        T: AsyncRead + Unpin + Send,
    {
        let bytes = read_framed(io, self.max_message_size).await?;
        Envelope::from_wire(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<DirectAck>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await?;
        if byte[0] != ACK_BYTE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected ack byte",
            ));
        }
        Ok(DirectAck)
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        envelope: Envelope,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes = envelope
            .to_wire()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if bytes.len() > self.max_message_size {
            return Err(oversize(bytes.len(), self.max_message_size));
        }
        write_framed(io, &bytes).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        _: DirectAck,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&[ACK_BYTE]).await?;
        io.flush().await
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

fn oversize(size: usize, limit: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("oversize frame: {size} bytes exceeds limit {limit}"),
    )
}

/// Reads one varint-prefixed frame, capping the declared length at
/// `max` before the payload buffer is allocated.
pub(crate) async fn read_framed<T: AsyncRead + Unpin>(
    io: &mut T,
    max: usize,
) -> io::Result<Vec<u8>> {
    let len = read_varint(io).await?;
    let len = usize::try_from(len).map_err(|_| oversize(usize::MAX, max))?;
    if len > max {
        return Err(oversize(len, max));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one varint-prefixed frame and flushes.
pub(crate) async fn write_framed<T: AsyncWrite + Unpin>(
    io: &mut T,
    data: &[u8],
) -> io::Result<()> {
    let mut prefix = [0u8; 10];
    let n = encode_varint(data.len() as u64, &mut prefix);
    io.write_all(&prefix[..n]).await?;
    io.write_all(data).await?;
    io.flush().await
}

/// Maximum bytes of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

fn encode_varint(mut value: u64, out: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out[i] = byte;
            return i + 1;
        }
        out[i] = byte | 0x80;
        i += 1;
    }
}

async fn read_varint<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for _ in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await?;
        value |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "varint prefix too long",
    ))
}

// ---------------------------------------------------------------------------
// Behaviour construction
// ---------------------------------------------------------------------------

/// Builds the direct-messaging `request_response` behaviour.
pub fn build_direct_behaviour(
    protocol: StreamProtocol,
    max_message_size: usize,
    timeout: std::time::Duration,
) -> request_response::Behaviour<DirectCodec> {
    request_response::Behaviour::with_codec(
        DirectCodec { max_message_size },
        [(protocol, ProtocolSupport::Full)],
        request_response::Config::default().with_request_timeout(timeout),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use diiisco_protocol::Role;
    use diiisco_types::SessionId;
    use futures::io::Cursor;
    use libp2p::request_response::Codec;

    fn envelope() -> Envelope {
        Envelope::new(
            Role::QuoteAccepted,
            SessionId::new("abc").unwrap(),
            1_720_000_000_000,
            "SENDER",
            Some("12D3KooWPeer".into()),
            Some(serde_json::json!({ "quote": { "totalPrice": 0.017 } })),
        )
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = Cursor::new(Vec::new());
        write_framed(&mut buf, b"hello frame").await.unwrap();

        let mut read = Cursor::new(buf.into_inner());
        let frame = read_framed(&mut read, 1024).await.unwrap();
        assert_eq!(frame, b"hello frame");
    }

    #[tokio::test]
    async fn frame_at_exact_limit_accepted() {
        let data = vec![0xAB; 64];
        let mut buf = Cursor::new(Vec::new());
        write_framed(&mut buf, &data).await.unwrap();

        let mut read = Cursor::new(buf.into_inner());
        let frame = read_framed(&mut read, 64).await.unwrap();
        assert_eq!(frame.len(), 64);
    }

    #[tokio::test]
    async fn frame_over_limit_rejected_before_read() {
        let data = vec![0xAB; 65];
        let mut buf = Cursor::new(Vec::new());
        write_framed(&mut buf, &data).await.unwrap();

        let mut read = Cursor::new(buf.into_inner());
        let err = read_framed(&mut read, 64).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("oversize frame"));
    }

    #[tokio::test]
    async fn codec_request_roundtrip() {
        let protocol = StreamProtocol::new("/diiisco/direct/1.0.0");
        let mut codec = DirectCodec {
            max_message_size: 1024 * 1024,
        };
        let env = envelope();

        let mut buf = Cursor::new(Vec::new());
        codec
            .write_request(&protocol, &mut buf, env.clone())
            .await
            .unwrap();

        let mut read = Cursor::new(buf.into_inner());
        let decoded = codec.read_request(&protocol, &mut read).await.unwrap();
        assert_eq!(decoded, env);
    }

    #[tokio::test]
    async fn codec_rejects_garbage_payload() {
        let protocol = StreamProtocol::new("/diiisco/direct/1.0.0");
        let mut codec = DirectCodec {
            max_message_size: 1024,
        };

        let mut buf = Cursor::new(Vec::new());
        write_framed(&mut buf, b"not an envelope").await.unwrap();

        let mut read = Cursor::new(buf.into_inner());
        assert!(codec.read_request(&protocol, &mut read).await.is_err());
    }

    #[tokio::test]
    async fn ack_roundtrip() {
        let protocol = StreamProtocol::new("/diiisco/direct/1.0.0");
        let mut codec = DirectCodec {
            max_message_size: 1024,
        };

        let mut buf = Cursor::new(Vec::new());
        codec
            .write_response(&protocol, &mut buf, DirectAck)
            .await
            .unwrap();

        let mut read = Cursor::new(buf.into_inner());
        assert_eq!(
            codec.read_response(&protocol, &mut read).await.unwrap(),
            DirectAck
        );
    }

    #[test]
    fn varint_encoding_lengths() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        assert_eq!(encode_varint(0, &mut buf), 1);
        assert_eq!(encode_varint(127, &mut buf), 1);
        assert_eq!(encode_varint(128, &mut buf), 2);
        assert_eq!(encode_varint(16_383, &mut buf), 2);
        assert_eq!(encode_varint(16_384, &mut buf), 3);
    }

    #[tokio::test]
    async fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 10 * 1024 * 1024] {
            let mut buf = [0u8; MAX_VARINT_LEN];
            let n = encode_varint(value, &mut buf);
            let mut read = Cursor::new(buf[..n].to_vec());
            assert_eq!(read_varint(&mut read).await.unwrap(), value);
        }
    }
}
