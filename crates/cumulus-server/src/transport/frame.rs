// Length-prefixed message framing
// Each frame is a big-endian u32 byte count followed by one JSON-encoded message

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cumulus_api::Message;
use cumulus_common::{CumulusError, Result};

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = message.to_bytes()?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CumulusError::IllegalArgument(format!(
            "frame of {} bytes exceeds {} bytes",
            body.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame; `None` on a clean end of stream between frames
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(CumulusError::Transport(format!(
            "peer announced a frame of {} bytes",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Message::from_slice(&body).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
