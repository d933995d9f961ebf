//! Bounded per-session output history
//!
//! Late-joining viewers are replayed this buffer so they see the recent
//! screen instead of a blank terminal. The bound is in bytes; when it is
//! exceeded the oldest output is dropped first.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Default cap per session (100 KiB)
pub const DEFAULT_MAX_BYTES: usize = 100 * 1024;

/// Chunk count above which chunks are merged into one string
const MERGE_THRESHOLD: usize = 100;

#[derive(Debug, Default)]
struct Chunks {
    chunks: VecDeque<String>,
    byte_size: usize,
}

/// Byte-bounded FIFO of output chunks, safe to share between threads
#[derive(Debug)]
pub struct ScrollbackBuffer {
    inner: Mutex<Chunks>,
    max_bytes: usize,
}

impl ScrollbackBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Chunks::default()),
            max_bytes: max_bytes.max(1),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Append output, evicting the oldest chunks while over the cap.
    ///
    /// A single chunk larger than the cap replaces everything with its own
    /// tail, cut on a UTF-8 boundary.
    pub fn append(&self, data: &str) {
        if data.is_empty() {
            return;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if data.len() >= self.max_bytes {
            let tail = utf8_tail(data, self.max_bytes);
            inner.chunks.clear();
            inner.byte_size = tail.len();
            inner.chunks.push_back(tail.to_string());
            return;
        }

        inner.chunks.push_back(data.to_string());
        inner.byte_size += data.len();

        while inner.byte_size > self.max_bytes && inner.chunks.len() > 1 {
            if let Some(old) = inner.chunks.pop_front() {
                inner.byte_size -= old.len();
            }
        }

        if inner.chunks.len() > MERGE_THRESHOLD {
            let merged: String = inner.chunks.drain(..).collect();
            inner.chunks.push_back(merged);
        }
    }

    /// Everything currently held, or `None` when empty
    pub fn contents(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.chunks.is_empty() {
            None
        } else {
            Some(inner.chunks.iter().map(String::as_str).collect())
        }
    }

    pub fn byte_size(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.byte_size)
            .unwrap_or_else(|e| e.into_inner().byte_size)
    }

    pub fn is_empty(&self) -> bool {
        self.byte_size() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.chunks.clear();
        inner.byte_size = 0;
    }
}

impl Default for ScrollbackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

/// Last `max_bytes` (or fewer) bytes of `data` starting on a char boundary
fn utf8_tail(data: &str, max_bytes: usize) -> &str {
    let mut start = data.len().saturating_sub(max_bytes);
    while !data.is_char_boundary(start) {
        start += 1;
    }
    &data[start..]
}
