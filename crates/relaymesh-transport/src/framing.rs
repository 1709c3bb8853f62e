//! u32 big-endian length-prefixed framing over byte streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Default cap on a single incoming frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write a length-prefixed frame.
pub async fn write_framed<W>(writer: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| TransportError::MessageTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame. Returns `None` on a clean end of stream.
pub async fn read_framed<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_framed(&mut a, b"first").await.unwrap();
        write_framed(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(read_framed(&mut b, 1024).await.unwrap().unwrap(), b"first");
        assert_eq!(read_framed(&mut b, 1024).await.unwrap().unwrap(), b"");
        assert!(read_framed(&mut b, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_framed(&mut a, &[0u8; 32]).await.unwrap();
        let err = read_framed(&mut b, 8).await.unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { size: 32, max: 8 }));
    }
}
