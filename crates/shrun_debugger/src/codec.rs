//! `Content-Length` framing used by the Debug Adapter Protocol.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DapError;

const CONTENT_LENGTH: &str = "content-length:";

fn content_length(line: &str) -> Option<&str> {
    let name = line.get(..CONTENT_LENGTH.len())?;
    name.eq_ignore_ascii_case(CONTENT_LENGTH)
        .then(|| line[CONTENT_LENGTH.len()..].trim())
}

/// Read one frame body.
///
/// Returns `Ok(None)` at end of input and an empty body when the headers
/// carried no (or a zero) length. Unknown headers are ignored.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, DapError>
where
    R: AsyncBufRead + Unpin,
{
    let mut length = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let header = line.trim();
        if header.is_empty() {
            break;
        }
        if let Some(value) = content_length(header) {
            length = value
                .parse()
                .map_err(|_| DapError::Header(header.to_string()))?;
        }
    }

    if length == 0 {
        return Ok(Some(Vec::new()));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Serialize `message` and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), DapError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
