// src/stream/lines.rs — Buffered line splitter over any async reader

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Longest line kept in memory. Bytes past it are dropped up to the next
/// newline.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Yields complete `\n`-terminated lines, then a final unterminated line
/// if the stream ends mid-line. Invalid UTF-8 is replaced rather than
/// treated as a read failure.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_line(reader, DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line(reader: R, max_line: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(8 * 1024),
            max_line: max_line.max(1),
        }
    }

    /// Next line without its terminator, or `None` at end of stream. A line
    /// longer than the cap comes back cut to the cap.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let limit = self.max_line as u64;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if n == self.max_line && self.buf.last() != Some(&b'\n') {
            let dropped = self.discard_rest_of_line().await?;
            if dropped > 0 {
                tracing::warn!(
                    "Agent output line over {} bytes, dropped {} bytes",
                    self.max_line,
                    dropped
                );
            }
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }

    /// Skip to just past the next newline. Returns the bytes skipped, not
    /// counting the newline.
    async fn discard_rest_of_line(&mut self) -> std::io::Result<usize> {
        let mut dropped = 0;
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(dropped);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    self.inner.consume(i + 1);
                    return Ok(dropped + i);
                }
                None => {
                    let len = available.len();
                    self.inner.consume(len);
                    dropped += len;
                }
            }
        }
    }
}
