//! Session cursor: the highest order id the client has incorporated.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic, in-memory only. Lost on restart, which simply means the first
/// poll of a new session asks for everything after id 0.
#[derive(Debug, Default)]
pub struct Cursor {
    last_seen_id: AtomicU64,
}

impl Cursor {
    pub fn new(start: u64) -> Self {
        Self {
            last_seen_id: AtomicU64::new(start),
        }
    }

    pub fn get(&self) -> u64 {
        self.last_seen_id.load(Ordering::SeqCst)
    }

    /// Raise the cursor to `candidate` if it is higher. Returns the value in
    /// effect afterwards.
    pub fn advance(&self, candidate: u64) -> u64 {
        let previous = self.last_seen_id.fetch_max(candidate, Ordering::SeqCst);
        previous.max(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_never_decreases() {
        let cursor = Cursor::new(0);
        assert_eq!(cursor.advance(5), 5);
        assert_eq!(cursor.advance(3), 5);
        assert_eq!(cursor.advance(5), 5);
        assert_eq!(cursor.advance(9), 9);
        assert_eq!(cursor.get(), 9);
    }
}
