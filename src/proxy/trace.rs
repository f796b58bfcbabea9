//! Per-proxy debug trace

use tracing::debug;

/// Longest body excerpt copied into a trace
const PREVIEW_LIMIT: usize = 200;

/// Text log attached to a single proxy's result.
///
/// Notes are always emitted as `tracing` debug events; they are only kept in the
/// buffer when the checker runs in verbose mode.
#[derive(Debug, Default)]
pub struct DebugTrace {
    enabled: bool,
    buf: String,
}

impl DebugTrace {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            buf: String::new(),
        }
    }

    pub fn note(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!("{}", message);
        if self.enabled {
            self.buf.push_str(message);
            self.buf.push('\n');
        }
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

/// First few characters of a response body, on one line
pub fn preview(body: &str) -> String {
    let mut excerpt: String = body.chars().take(PREVIEW_LIMIT).collect();
    if body.chars().count() > PREVIEW_LIMIT {
        excerpt.push_str("...");
    }
    excerpt.replace(['\r', '\n'], " ")
}
