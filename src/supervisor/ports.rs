use std::collections::BTreeSet;
use std::net::TcpListener;
use std::ops::RangeInclusive;

use parking_lot::Mutex;

/// Ports handed out to inference servers.
///
/// A port leaves the pool on `acquire` and only returns on `release`, which
/// the supervisor calls after the owning process has exited.
pub struct PortPool {
    range: RangeInclusive<u16>,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reserve `preferred` when it is free, otherwise the lowest free port of
    /// the range. A port counts as free only if no slot holds it and the OS
    /// lets us bind it.
    pub fn acquire(&self, preferred: Option<u16>) -> Option<u16> {
        let mut in_use = self.in_use.lock();

        if let Some(port) = preferred.filter(|p| *p != 0) {
            if !in_use.contains(&port) && is_bindable(port) {
                in_use.insert(port);
                return Some(port);
            }
            tracing::debug!("Preferred port {} is busy, falling back to pool", port);
        }

        let port = self
            .range
            .clone()
            .find(|p| !in_use.contains(p) && is_bindable(*p))?;
        in_use.insert(port);
        Some(port)
    }

    pub fn release(&self, port: u16) {
        self.in_use.lock().remove(&port);
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.in_use.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.in_use.lock().len()
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[test]
    fn test_acquire_is_unique_until_released() {
        let base = free_port();
        let pool = PortPool::new(base..=base.saturating_add(2));

        let a = pool.acquire(None).unwrap();
        let b = pool.acquire(None).unwrap();
        assert_ne!(a, b);
        assert!(pool.is_reserved(a));

        pool.release(a);
        assert!(!pool.is_reserved(a));
        assert_eq!(pool.reserved_count(), 1);
    }

    #[test]
    fn test_preferred_port() {
        let preferred = free_port();
        let pool = PortPool::new(preferred..=preferred);

        assert_eq!(pool.acquire(Some(preferred)), Some(preferred));
        // Already reserved and the range has nothing else
        assert_eq!(pool.acquire(Some(preferred)), None);
    }

    #[test]
    fn test_skips_ports_held_by_other_programs() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let pool = PortPool::new(port..=port);

        assert_eq!(pool.acquire(None), None);
        drop(held);
        assert_eq!(pool.acquire(None), Some(port));
    }
}
