// src/process/stderr.rs — Bounded stderr capture

use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Appended when output past the cap was discarded.
pub const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Keeps the first `cap` bytes of a stream and counts the rest.
#[derive(Debug, Clone)]
pub struct StderrBuffer {
    cap: usize,
    buf: Vec<u8>,
    dropped: usize,
}

impl StderrBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        let take = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }

    pub fn render(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated() {
            out.push_str(TRUNCATION_MARKER);
        }
        out
    }
}

/// Drain `reader` to EOF into a buffer capped at `cap` bytes. Read errors
/// end collection early and keep what was captured.
pub async fn collect<R: AsyncRead + Unpin>(reader: R, cap: usize) -> StderrBuffer {
    collect_until(reader, cap, std::future::pending()).await
}

/// Like `collect`, but gives up on a pipe still open when `stop` resolves.
pub async fn collect_until<R, F>(mut reader: R, cap: usize, stop: F) -> StderrBuffer
where
    R: AsyncRead + Unpin,
    F: Future<Output = ()>,
{
    let mut buffer = StderrBuffer::new(cap);
    let mut chunk = [0u8; 4096];
    tokio::pin!(stop);
    loop {
        let read = tokio::select! {
            biased;
            _ = &mut stop => {
                tracing::debug!("stderr still open after exit, keeping what was read");
                break;
            }
            read = reader.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => buffer.push(&chunk[..n]),
            Err(e) => {
                tracing::debug!("stderr read ended: {}", e);
                break;
            }
        }
    }
    buffer
}
