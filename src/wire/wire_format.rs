use std::fmt::{Debug, Display, Formatter};

use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Control packets are the only structured data exchanged over a channel before it is claimed
///  by a connection. Each packet has a fixed size:
///
/// ```ascii
/// 0: operation (u8)
/// 1: connection id (16 bytes), all zero if the operation does not refer to a connection
/// ```
///
/// The numeric values are consistent within a deployment only - this is not a protocol that
///  is compatible across versions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Op {
    Connect = 1,
    /// a Connect that also tells the receiver that this was the sender's last pooled channel,
    ///  so the receiver should broadcast to replenish the sender's pool
    ConnectAndSolicit = 2,
    Accept = 3,
    AcceptAndSolicit = 4,
    ConnectionClosed = 5,
    ChannelClosed = 6,
    /// not sent explicitly: this is what [receive] returns when the stream ended
    Closed = 7,
}

pub const PACKET_SIZE: usize = 17;

/// Marker error for a read that was aborted through the shutdown token. Callers can
///  distinguish it via `downcast_ref::<Cancelled>()`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Cancelled;
impl Display for Cancelled {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cancelled")
    }
}
impl std::error::Error for Cancelled {}

pub fn encode(op: Op, connection_id: Uuid) -> [u8; PACKET_SIZE] {
    let mut buf = [0u8; PACKET_SIZE];
    buf[0] = op.into();
    buf[1..].copy_from_slice(connection_id.as_bytes());
    buf
}

pub fn decode(buf: &[u8; PACKET_SIZE]) -> anyhow::Result<(Op, Uuid)> {
    let op = Op::try_from(buf[0])
        .map_err(|_| anyhow!("invalid control packet op code {}", buf[0]))?;

    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&buf[1..]);
    Ok((op, Uuid::from_bytes(id_bytes)))
}

/// Write a single control packet and flush the stream
pub async fn send<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W, op: Op, connection_id: Uuid) -> anyhow::Result<()> {
    let buf = encode(op, connection_id);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a single control packet. End of stream is a regular outcome rather than an error: it
///  is reported as [Op::Closed] with a nil connection id.
pub async fn receive<R: AsyncRead + Unpin + ?Sized>(stream: &mut R, cancel: &CancellationToken) -> anyhow::Result<(Op, Uuid)> {
    let mut buf = [0u8; PACKET_SIZE];
    let mut pos = 0;

    while pos < PACKET_SIZE {
        let num_read = select! {
            _ = cancel.cancelled() => {
                return Err(Cancelled.into());
            }
            r = stream.read(&mut buf[pos..]) => r?
        };

        if num_read == 0 {
            if pos > 0 {
                debug!("stream ended after {} bytes of a control packet", pos);
            }
            return Ok((Op::Closed, Uuid::nil()));
        }
        pos += num_read;
    }

    decode(&buf)
}

/// convenience for logging: op plus connection id in simple (unhyphenated) form
pub struct PacketDisplay(pub Op, pub Uuid);
impl Debug for PacketDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.0, self.1.simple())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tokio::io::duplex;

    use super::*;

    #[rstest]
    #[case::connect(Op::Connect, 1)]
    #[case::connect_and_solicit(Op::ConnectAndSolicit, 2)]
    #[case::accept(Op::Accept, 3)]
    #[case::accept_and_solicit(Op::AcceptAndSolicit, 4)]
    #[case::connection_closed(Op::ConnectionClosed, 5)]
    #[case::channel_closed(Op::ChannelClosed, 6)]
    #[case::closed(Op::Closed, 7)]
    fn test_op_code(#[case] op: Op, #[case] expected: u8) {
        let raw: u8 = op.into();
        assert_eq!(raw, expected);
        assert_eq!(Op::try_from(expected).unwrap(), op);
    }

    #[test]
    fn test_encode_layout() {
        let id = Uuid::from_bytes([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let buf = encode(Op::Accept, id);
        assert_eq!(buf, [3, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::too_big(8)]
    #[case::max(255)]
    fn test_decode_invalid_op(#[case] op: u8) {
        let mut buf = [0u8; PACKET_SIZE];
        buf[0] = op;
        assert!(decode(&buf).is_err());
    }

    #[tokio::test]
    async fn test_send_writes_exactly_one_packet() {
        let id = Uuid::new_v4();
        let mut buf = Vec::new();
        send(&mut buf, Op::ConnectionClosed, id).await.unwrap();
        assert_eq!(buf.len(), PACKET_SIZE);
        assert_eq!(buf[0], 5);
        assert_eq!(&buf[1..], id.as_bytes());
    }

    #[tokio::test]
    async fn test_receive_eof_is_closed() {
        let mut stream: &[u8] = &[];
        let result = receive(&mut stream, &CancellationToken::new()).await.unwrap();
        assert_eq!(result, (Op::Closed, Uuid::nil()));
    }

    #[tokio::test]
    async fn test_receive_truncated_packet_is_closed() {
        let mut stream: &[u8] = &[1, 2, 3];
        let result = receive(&mut stream, &CancellationToken::new()).await.unwrap();
        assert_eq!(result, (Op::Closed, Uuid::nil()));
    }

    #[tokio::test]
    async fn test_receive_reassembles_partial_reads() {
        let id = Uuid::new_v4();
        let packet = encode(Op::ConnectAndSolicit, id);

        let (mut client, mut server) = duplex(64);
        let writer = tokio::spawn(async move {
            for chunk in packet.chunks(5) {
                client.write_all(chunk).await.unwrap();
                client.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            client
        });

        let result = receive(&mut server, &CancellationToken::new()).await.unwrap();
        assert_eq!(result, (Op::ConnectAndSolicit, id));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_receive_consecutive_packets() {
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let mut buf = Vec::new();
        send(&mut buf, Op::ChannelClosed, id1).await.unwrap();
        send(&mut buf, Op::Connect, id2).await.unwrap();

        let mut stream: &[u8] = &buf;
        let cancel = CancellationToken::new();
        assert_eq!(receive(&mut stream, &cancel).await.unwrap(), (Op::ChannelClosed, id1));
        assert_eq!(receive(&mut stream, &cancel).await.unwrap(), (Op::Connect, id2));
        assert_eq!(receive(&mut stream, &cancel).await.unwrap(), (Op::Closed, Uuid::nil()));
    }

    #[tokio::test]
    async fn test_receive_cancelled() {
        let (_client, mut server) = duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = receive(&mut server, &cancel).await.unwrap_err();
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }
}
