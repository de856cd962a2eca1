//! Bounded output capture.
//!
//! Stdout and stderr are drained on their own tasks so the child never
//! blocks on a full pipe. Every byte is counted against the configured
//! limit; crossing it stops the capture, terminates the child and surfaces
//! `output_overflow` with the partial output intact. Disk problems while
//! streaming to an output file surface as `output_io_error`.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

const CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("output exceeded the limit of {limit} bytes")]
    Overflow { limit: u64 },

    #[error("output I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a finished capture task hands back: the bytes collected before any
/// failure, plus the failure itself if one occurred.
#[derive(Debug)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub error: Option<CaptureError>,
}

impl Captured {
    pub fn into_lossy_string(self) -> (String, Option<CaptureError>) {
        (
            String::from_utf8_lossy(&self.bytes).into_owned(),
            self.error,
        )
    }
}

/// Drain `reader` into memory, stopping at `limit` bytes.
pub async fn drain_limited<R>(mut reader: R, limit: u64) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let mut buf = [0u8; CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return Captured { bytes, error: None },
            Ok(n) => {
                let remaining = limit.saturating_sub(bytes.len() as u64) as usize;
                if n > remaining {
                    bytes.extend_from_slice(&buf[..remaining]);
                    return Captured {
                        bytes,
                        error: Some(CaptureError::Overflow { limit }),
                    };
                }
                bytes.extend_from_slice(&buf[..n]);
            }
            Err(e) => {
                return Captured {
                    bytes,
                    error: Some(CaptureError::Io(e)),
                }
            }
        }
    }
}

/// Drain `reader` to `file`, mirroring up to `limit` bytes in memory for the
/// summary. The limit applies to the stream, not just the mirror.
pub async fn drain_to_file<R>(mut reader: R, mut file: tokio::fs::File, limit: u64) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let mut written: u64 = 0;
    let mut buf = [0u8; CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                if let Err(e) = file.flush().await {
                    return Captured {
                        bytes,
                        error: Some(CaptureError::Io(e)),
                    };
                }
                return Captured { bytes, error: None };
            }
            Ok(n) => {
                let remaining = limit.saturating_sub(written) as usize;
                let take = n.min(remaining);
                if let Err(e) = file.write_all(&buf[..take]).await {
                    return Captured {
                        bytes,
                        error: Some(CaptureError::Io(e)),
                    };
                }
                bytes.extend_from_slice(&buf[..take]);
                written += take as u64;
                if n > remaining {
                    let _ = file.flush().await;
                    return Captured {
                        bytes,
                        error: Some(CaptureError::Overflow { limit }),
                    };
                }
            }
            Err(e) => {
                return Captured {
                    bytes,
                    error: Some(CaptureError::Io(e)),
                }
            }
        }
    }
}
