use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type SharedRw<T> = Arc<RwLock<T>>;

pub fn new_rw_state<T>(value: T) -> SharedRw<T> {
    Arc::new(RwLock::new(value))
}

/// Process-wide id sequence shared by the catalog and the sensor registry.
#[derive(Debug)]
pub struct IdGen(AtomicU64);

impl IdGen {
    pub fn new(next: u64) -> Self {
        Self(AtomicU64::new(next.max(1)))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Value the next call to `next()` would return.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Ensures ids handed out later stay above `seen`.
    pub fn observe(&self, seen: u64) {
        self.0.fetch_max(seen.saturating_add(1), Ordering::Relaxed);
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_gen_observe_moves_forward_only() {
        let ids = IdGen::default();
        assert_eq!(ids.next(), 1);
        ids.observe(10);
        assert_eq!(ids.next(), 11);
        ids.observe(3);
        assert_eq!(ids.next(), 12);
    }
}
