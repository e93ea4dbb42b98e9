//! Length-prefix framing shared by TCP, DoT and DoQ transports. DNS
//! messages on stream transports carry a two-byte big-endian length header.

use std::io::Result;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dns::protocol::MAX_MSG_SIZE;

/// Read one length-prefixed DNS message from the stream.
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut len_buffer = [0u8; 2];
    stream.read_exact(&mut len_buffer).await?;
    let len = u16::from_be_bytes(len_buffer) as usize;

    let mut msg = vec![0u8; len];
    stream.read_exact(&mut msg).await?;
    Ok(msg)
}

/// Write one DNS message with its two-byte length prefix.
pub async fn write_message<W: AsyncWrite + Unpin>(stream: &mut W, msg: &[u8]) -> Result<()> {
    if msg.len() > MAX_MSG_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "message exceeds maximum DNS message size",
        ));
    }
    let mut out = Vec::with_capacity(2 + msg.len());
    out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    out.extend_from_slice(msg);
    stream.write_all(&out).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {

    use super::*;

    #[tokio::test]
    async fn test_framing_roundtrip() {
        let msg = vec![0xAB; 300];

        let mut wire = std::io::Cursor::new(Vec::new());
        write_message(&mut wire, &msg).await.unwrap();
        let wire = wire.into_inner();
        assert_eq!(wire.len(), 302);
        assert_eq!(&wire[..2], &[0x01, 0x2C]);

        let mut reader = std::io::Cursor::new(wire);
        let read = read_message(&mut reader).await.unwrap();
        assert_eq!(msg, read);
    }
}
