use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{CodecError, WireMessage};

/// Per-connection frame cap. A length prefix above this is rejected before
/// any allocation happens, so a malicious peer cannot force a multi-gigabyte
/// buffer with a four-byte header.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Reads one length-prefixed frame and decodes it. Returns `Ok(None)` on a
/// clean EOF with zero bytes read (the connection was closed between
/// frames); any other truncation is `Err(ConnectionClosed)`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireMessage>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(CodecError::Io),
    }
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(CodecError::MalformedFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge);
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| CodecError::ConnectionClosed)?;
    WireMessage::decode(&body).map(Some)
}

/// Encodes and writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let body = message.encode()?;
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(CodecError::FrameTooLarge);
    }
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await.map_err(|_| CodecError::Io)?;
    writer.write_all(&body).await.map_err(|_| CodecError::Io)?;
    writer.flush().await.map_err(|_| CodecError::Io)?;
    Ok(())
}
