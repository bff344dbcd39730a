//! Line framing: every frame is one JSON object followed by `\n`.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::ProtoError;

/// Upper bound on a single frame; longer lines are treated as malformed
pub const MAX_FRAME_LEN: usize = 16 * 1024;

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtoError> {
    let mut frame = serde_json::to_vec(msg)?;
    frame.push(b'\n');
    Ok(frame)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtoError> {
    Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
