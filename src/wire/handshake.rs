use anyhow::{anyhow, bail};
use bytes::BytesMut;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// upper bound for the encoded dispatcher id; anything longer means we are not talking to a
///  dispatcher
const MAX_ID_LEN: u32 = 1024;

/// The first thing on every channel stream is the sending dispatcher's id: a UTF-8 string with
///  its byte length as a prefix, encoded as an unsigned 7-bit varint.
pub fn encode_dispatcher_id(id: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(id.len() + 2);
    buf.put_u32_varint(id.len() as u32);
    buf.extend_from_slice(id.as_bytes());
    buf
}

/// Read the dispatcher id at the start of a channel stream. A stream that ends before the first
///  byte is a regular 'empty' response (e.g. from a peer that filters our probes), so this is
///  reported as `None` rather than an error.
pub async fn read_dispatcher_id<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> anyhow::Result<Option<String>> {
    let mut len_buf = BytesMut::with_capacity(5);

    loop {
        let mut b = [0u8; 1];
        if stream.read(&mut b).await? == 0 {
            if len_buf.is_empty() {
                return Ok(None);
            }
            bail!("stream ended inside the dispatcher id length prefix");
        }
        len_buf.extend_from_slice(&b);

        if b[0] & 0x80 == 0 {
            break;
        }
        if len_buf.len() == 5 {
            bail!("dispatcher id length prefix is longer than 5 bytes");
        }
    }

    let len = (&len_buf[..]).try_get_u32_varint()
        .map_err(|e| anyhow!("VarInt error: {:?}", e))?;
    if len > MAX_ID_LEN {
        bail!("dispatcher id length {} exceeds the maximum of {}", len, MAX_ID_LEN);
    }

    let mut id_buf = vec![0u8; len as usize];
    stream.read_exact(&mut id_buf).await?;
    Ok(Some(String::from_utf8(id_buf)?))
}
