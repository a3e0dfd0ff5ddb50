//! Capture ring for native-library error lines.
//!
//! The engine's log hook feeds `SD_LOG_ERROR`-level lines in here; when a
//! job fails with an unhelpful native return value, the worker appends the
//! recent ring content to the job's error message. Entries older than 30
//! seconds are considered stale and never surfaced.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RING_CAPACITY: usize = 10;
const MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Entry {
    message: String,
    at: Instant,
}

/// Bounded ring of recent native error lines.
///
/// Constructed once in `main` and passed to the components that need it;
/// there is no ambient instance.
#[derive(Debug, Default)]
pub struct ErrorCapture {
    entries: Mutex<VecDeque<Entry>>,
}

impl ErrorCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error line. Whitespace is trimmed; empty lines are dropped.
    pub fn capture(&self, message: &str) {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(Entry {
            message: trimmed.to_string(),
            at: Instant::now(),
        });
        while entries.len() > RING_CAPACITY {
            entries.pop_front();
        }
    }

    /// Drain the ring, returning fresh entries (younger than 30 s) joined
    /// oldest-first with `"; "`. Empty string when nothing fresh remains.
    pub fn get_and_clear(&self) -> String {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let joined = entries
            .iter()
            .filter(|e| now.duration_since(e.at) < MAX_AGE)
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        entries.clear();
        joined
    }

    /// Most recent entry without draining, for inspection.
    pub fn peek_last(&self) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .map(|e| e.message.clone())
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn joins_oldest_first_and_clears() {
        let cap = ErrorCapture::new();
        cap.capture("first\n");
        cap.capture("  second  ");
        assert_eq!(cap.get_and_clear(), "first; second");
        assert_eq!(cap.get_and_clear(), "");
    }

    #[test]
    fn ring_is_bounded() {
        let cap = ErrorCapture::new();
        for i in 0..20 {
            cap.capture(&format!("e{i}"));
        }
        let joined = cap.get_and_clear();
        assert_eq!(joined.split("; ").count(), RING_CAPACITY);
        assert!(joined.starts_with("e10"));
    }

    #[test]
    fn empty_lines_are_dropped() {
        let cap = ErrorCapture::new();
        cap.capture("   \n\r ");
        assert!(cap.peek_last().is_none());
    }
}
