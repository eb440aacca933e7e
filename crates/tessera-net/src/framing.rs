//! Length-prefixed framing for the replication byte stream.
//!
//! Every message travels as one frame:
//!
//! ```text
//! +-------------------+-----------+--------------------+
//! | length (4 bytes)  | tag (1)   |   body             |
//! | u32 big-endian    |           | (length - 1 bytes) |
//! +-------------------+-----------+--------------------+
//! ```
//!
//! The length counts the tag and body but not the prefix itself. A length of
//! 0 is a valid empty frame; readers skip it (keepalive padding).

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed frame size (tag + body) in bytes. Default: 1 MiB.
    pub max_frame_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame size exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// The actual frame size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream, cleanly or mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether this error is a plain end of stream rather than a failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, FrameError::ConnectionClosed)
    }
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read one frame and return its contents (tag + body).
///
/// Blocks until the whole frame is available. An empty vector means the peer
/// sent an empty frame.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;
    let frame_len = u32::from_be_bytes(len_buf);

    if frame_len > config.max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: frame_len as usize,
            max: config.max_frame_size,
        });
    }

    let mut frame = vec![0u8; frame_len as usize];
    if frame_len > 0 {
        reader.read_exact(&mut frame).await.map_err(map_eof)?;
    }
    Ok(frame)
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(frame.len())
        .ok()
        .filter(|len| *len <= config.max_frame_size)
        .ok_or(FrameError::FrameTooLarge {
            size: frame.len(),
            max: config.max_frame_size,
        })?;

    writer.write_all(&len.to_be_bytes()).await?;
    if !frame.is_empty() {
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}
