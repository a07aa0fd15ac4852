use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const DEFAULT_CAPACITY: usize = 64;

/// Bounded in-memory ring of human-readable trace entries, surfaced in the
/// operator debug panel. Diagnostics only; nothing reads it for
/// correctness.
#[derive(Clone)]
pub struct DebugTrace {
    entries: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for DebugTrace {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl DebugTrace {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, message: impl AsRef<str>) {
        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(format!("[{stamp}] {}", message.as_ref()));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_are_evicted_at_capacity() {
        let trace = DebugTrace::with_capacity(3);
        for i in 0..5 {
            trace.push(format!("entry {i}"));
        }
        let entries = trace.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].ends_with("entry 2"));
        assert!(entries[2].ends_with("entry 4"));
    }

    #[test]
    fn clear_empties_the_ring() {
        let trace = DebugTrace::default();
        trace.push("one");
        trace.clear();
        assert!(trace.entries().is_empty());
    }
}
