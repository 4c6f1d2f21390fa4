//! Length-prefixed framing of the daemon stream protocol.
//!
//! Wire format: `Uvarint(length)` followed by `length` bytes of marshalled
//! protobuf. The receive path reuses one 1 MiB scratch buffer for the first
//! read; whatever follows the varint in that read already belongs to the
//! payload and is copied out before the remainder is read directly into the
//! preallocated destination.

use std::io;

use prost::encoding::encode_varint;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Scratch buffer used for the first read of every response.
pub const RECV_SCRATCH_SIZE: usize = 1024 * 1024;

/// Upper bound on a single frame payload: 16 MiB.
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Write one frame: varint length, then the payload.
pub async fn send_data<W>(w: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut hdr = Vec::with_capacity(10);
    encode_varint(data.len() as u64, &mut hdr);
    w.write_all(&hdr).await?;
    w.write_all(data).await?;
    w.flush().await
}

/// Read one frame payload.
///
/// Returns `UnexpectedEof` if the peer closes mid-frame and `InvalidData`
/// for a malformed or oversized length prefix.
pub async fn recv_data<R>(r: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = vec![0u8; RECV_SCRATCH_SIZE];
    let mut filled = 0usize;

    // First read; keep reading only if the varint itself is split.
    let (payload_len, hdr_len) = loop {
        let n = r.read(&mut scratch[filled..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
        match try_decode_varint(&scratch[..filled])? {
            Some(decoded) => break decoded,
            None => continue,
        }
    };

    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", payload_len),
        ));
    }

    let mut payload = vec![0u8; payload_len as usize];
    let have = (filled - hdr_len).min(payload.len());
    payload[..have].copy_from_slice(&scratch[hdr_len..hdr_len + have]);

    let mut pos = have;
    while pos < payload.len() {
        let n = r.read(&mut payload[pos..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        pos += n;
    }

    Ok(payload)
}

/// Decode a varint from the front of `buf`.
///
/// `Ok(None)` means the prefix is incomplete and more bytes are needed.
fn try_decode_varint(buf: &[u8]) -> io::Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().enumerate() {
        if i >= 10 {
            break;
        }
        value |= u64::from(byte & 0x7f) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 10 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed varint length prefix",
        ));
    }
    Ok(None)
}
