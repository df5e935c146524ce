//! Stream id allocation.

use std::collections::{BTreeSet, HashSet};

/// Hands out locally initiated stream ids.
///
/// Released ids are reused lowest first; fresh ids count up from zero.
#[derive(Debug, Default)]
pub struct StreamIdAllocator {
    next: u64,
    free: BTreeSet<u64>,
    in_use: HashSet<u64>,
}

impl StreamIdAllocator {
    /// Create an empty allocator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest available id
    pub fn allocate(&mut self) -> u64 {
        let id = self.free.pop_first().unwrap_or_else(|| {
            let id = self.next;
            self.next += 1;
            id
        });
        self.in_use.insert(id);
        id
    }

    /// Return an id for reuse. Releasing an id that is not in use is a
    /// no-op; returns whether anything was released.
    pub fn release(&mut self, id: u64) -> bool {
        if self.in_use.remove(&id) {
            self.free.insert(id);
            true
        } else {
            false
        }
    }

    /// Number of ids currently handed out
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// True if `id` is currently handed out
    #[must_use]
    pub fn is_allocated(&self, id: u64) -> bool {
        self.in_use.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential() {
        let mut alloc = StreamIdAllocator::new();
        assert_eq!(alloc.allocate(), 0);
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.in_use(), 3);
    }

    #[test]
    fn test_lowest_released_reused_first() {
        let mut alloc = StreamIdAllocator::new();
        for _ in 0..4 {
            alloc.allocate();
        }
        assert!(alloc.release(2));
        assert!(alloc.release(1));
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 4);
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut alloc = StreamIdAllocator::new();
        let id = alloc.allocate();
        assert!(alloc.release(id));
        assert!(!alloc.release(id));
        assert!(!alloc.release(99));

        // The id is handed out once, not twice
        assert_eq!(alloc.allocate(), id);
        assert_eq!(alloc.allocate(), id + 1);
    }
}
