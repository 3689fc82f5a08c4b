use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic generation counter for one managed resource.
///
/// `begin` mints a new generation and makes it current; `invalidate`
/// advances the counter without handing out the new value, so nothing
/// started before the call can commit afterwards.
#[derive(Debug, Default)]
pub struct Generation {
    current: AtomicU64,
}

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new generation and make it the active one
    pub fn begin(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Supersede whatever generation is active
    pub fn invalidate(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current.load(Ordering::SeqCst) == generation
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_supersedes_previous() {
        let generation = Generation::new();
        let first = generation.begin();
        assert!(generation.is_current(first));

        let second = generation.begin();
        assert!(second > first);
        assert!(!generation.is_current(first));
        assert!(generation.is_current(second));
    }

    #[test]
    fn test_invalidate_leaves_nothing_current() {
        let generation = Generation::new();
        let started = generation.begin();
        generation.invalidate();
        assert!(!generation.is_current(started));

        let restarted = generation.begin();
        assert!(generation.is_current(restarted));
        assert_ne!(restarted, started);
    }

    #[test]
    fn test_concurrent_begins_are_unique() {
        let generation = std::sync::Arc::new(Generation::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generation = generation.clone();
                std::thread::spawn(move || (0..100).map(|_| generation.begin()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(generation.current(), 800);
    }
}
