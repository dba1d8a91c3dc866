//! Wire framing for operational messages.
//!
//! Every message travels as a 4-byte big-endian length followed by the
//! bincode encoding of an [`OperationalMessage`].

use crate::error::{NetworkError, Result};
use crate::types::OperationalMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a message to bytes.
pub fn encode_message(msg: &OperationalMessage) -> std::result::Result<Vec<u8>, bincode::Error> {
    msg.to_bytes()
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> std::result::Result<OperationalMessage, bincode::Error> {
    OperationalMessage::from_bytes(data)
}

/// Frame a message with its length prefix.
pub fn frame_message(msg: &OperationalMessage) -> std::result::Result<Vec<u8>, bincode::Error> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Read one message. `None` when the peer closed the stream between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<OperationalMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::ReceiveFailed(format!("frame of {} bytes too large", len)).into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    Ok(Some(decode_message(&data)?))
}

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, msg: &OperationalMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg)?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    Ok(())
}
