//! Streaming of recordings over HTTP, including files that are still
//! being written. Follow mode tails the file: everything on disk is sent
//! immediately, then the file is polled for growth until the client
//! disconnects or no new bytes arrive within the idle timeout.

use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::FollowConfig;
use crate::error::{Error, Result};
use crate::recorder::files::content_type_for;

const CHUNK_SIZE: usize = 64 * 1024;

fn http_error(err: axum::http::Error) -> Error {
    Error::Internal(err.to_string())
}

#[derive(Debug, Clone, Copy)]
pub struct FollowStreamer {
    idle_timeout: Duration,
    poll_interval: Duration,
}

impl FollowStreamer {
    #[must_use]
    pub fn new(config: &FollowConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Stream a file that may still be growing, starting at `offset`.
    /// The response body stays open while the file grows; it ends when
    /// the file disappears, the client goes away, or the file has been
    /// quiet for the idle timeout.
    pub fn follow(&self, path: PathBuf, offset: u64) -> Result<Response> {
        let (tx, rx) = mpsc::unbounded_channel::<std::result::Result<Bytes, io::Error>>();
        let content_type = content_type_for(&path);
        tokio::spawn(pump(
            path,
            offset,
            tx,
            self.idle_timeout,
            self.poll_interval,
        ));

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from_stream(UnboundedReceiverStream::new(rx)))
            .map_err(http_error)
    }
}

async fn pump(
    path: PathBuf,
    mut offset: u64,
    tx: mpsc::UnboundedSender<std::result::Result<Bytes, io::Error>>,
    idle_timeout: Duration,
    poll_interval: Duration,
) {
    let mut idle_deadline = Instant::now() + idle_timeout;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "followed file disappeared");
                return;
            }
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };

        if len < offset {
            // Truncated underneath us; continue from the new end.
            offset = len;
        }

        if len > offset {
            match send_available(&path, &mut offset, len, &mut buf, &tx).await {
                Ok(true) => {
                    idle_deadline = Instant::now() + idle_timeout;
                    continue;
                }
                Ok(false) => return,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return;
                }
            }
        }

        if Instant::now() >= idle_deadline {
            debug!(path = %path.display(), "follow idle timeout");
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(poll_interval) => {}
            () = tx.closed() => return,
        }
    }
}

/// Send bytes between `offset` and `len`. Returns false once the receiver
/// is gone.
async fn send_available(
    path: &Path,
    offset: &mut u64,
    len: u64,
    buf: &mut [u8],
    tx: &mpsc::UnboundedSender<std::result::Result<Bytes, io::Error>>,
) -> io::Result<bool> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(*offset)).await?;
    let mut remaining = len - *offset;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        *offset += read as u64;
        remaining -= read as u64;
        if tx.send(Ok(Bytes::copy_from_slice(&buf[..read]))).is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Serve a completed file, honoring a single `bytes=start-end` range.
pub async fn serve_file_range(path: &Path, range: Option<&str>) -> Result<Response> {
    let meta = tokio::fs::metadata(path).await?;
    let len = meta.len();
    let content_type = content_type_for(path);

    let Some(range) = range else {
        let file = File::open(path).await?;
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, len)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from_stream(ReaderStream::new(file)))
            .map_err(http_error);
    };

    let Some((start, end)) = parse_byte_range(range, len) else {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{len}"))
            .body(Body::empty())
            .map_err(http_error);
    };

    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let span = end - start + 1;

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, span)
        .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::from_stream(ReaderStream::new(file.take(span))))
        .map_err(http_error)
}

/// Parse `bytes=start-end`, clamping the end to the file and rejecting
/// anything unsatisfiable. The suffix form `bytes=-n` means the last `n`
/// bytes.
fn parse_byte_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = spec.split_once('-')?;
    let start_raw = start_raw.trim();
    let end_raw = end_raw.trim();

    if start_raw.is_empty() {
        let suffix: u64 = end_raw.parse().ok()?;
        if suffix == 0 || len == 0 {
            return None;
        }
        return Some((len.saturating_sub(suffix), len - 1));
    }

    let start: u64 = start_raw.parse().ok()?;
    if start >= len {
        return None;
    }
    let end = if end_raw.is_empty() {
        len - 1
    } else {
        end_raw.parse::<u64>().ok()?.min(len - 1)
    };
    (start <= end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_range() {
        assert_eq!(parse_byte_range("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(parse_byte_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_byte_range("bytes=-200", 1000), Some((800, 999)));
        assert_eq!(parse_byte_range("bytes=0-9999", 1000), Some((0, 999)));
        assert_eq!(parse_byte_range("bytes=1000-", 1000), None);
        assert_eq!(parse_byte_range("bytes=5-2", 1000), None);
        assert_eq!(parse_byte_range("bytes=-0", 1000), None);
        assert_eq!(parse_byte_range("items=0-5", 1000), None);
    }
}
