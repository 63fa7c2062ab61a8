//! Cancellation registry shared by the service and every worker

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::request::RequestId;

/// Cancel flag for one request, read lock-free by its worker
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Live request ids and their cancel flags
///
/// An entry exists from submission until the request reaches a terminal
/// state, so the map never grows past the number of in-flight requests.
/// Marking an id that is unknown or already finished does nothing.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    flags: Mutex<HashMap<RequestId, CancelFlag>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly submitted request and hand back its flag
    pub fn register(&self, id: RequestId) -> CancelFlag {
        self.flags.lock().entry(id).or_default().clone()
    }

    /// Request cancellation. Returns whether a live request was flagged.
    pub fn mark(&self, id: RequestId) -> bool {
        match self.flags.lock().get(&id) {
            Some(flag) => {
                flag.set();
                true
            }
            None => false,
        }
    }

    pub fn is_marked(&self, id: RequestId) -> bool {
        self.flags
            .lock()
            .get(&id)
            .map(CancelFlag::is_set)
            .unwrap_or(false)
    }

    /// Forget a request once it is terminal
    pub fn clear(&self, id: RequestId) {
        self.flags.lock().remove(&id);
    }

    /// Number of live requests
    pub fn len(&self) -> usize {
        self.flags.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn id(raw: u64) -> RequestId {
        RequestId::from_raw(raw)
    }

    #[test]
    fn test_mark_sets_registered_flag() {
        let registry = CancellationRegistry::new();
        let flag = registry.register(id(1));
        assert!(!flag.is_set());
        assert!(registry.mark(id(1)));
        assert!(flag.is_set());
        assert!(registry.is_marked(id(1)));
    }

    #[test]
    fn test_mark_is_idempotent() {
        let registry = CancellationRegistry::new();
        let flag = registry.register(id(3));
        assert!(registry.mark(id(3)));
        assert!(registry.mark(id(3)));
        assert!(flag.is_set());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_and_terminal_ids_are_noops() {
        let registry = CancellationRegistry::new();
        assert!(!registry.mark(id(9)));
        assert!(registry.is_empty());

        registry.register(id(2));
        registry.clear(id(2));
        assert!(!registry.mark(id(2)));
        assert!(!registry.is_marked(id(2)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_marks() {
        let registry = Arc::new(CancellationRegistry::new());
        let flags: Vec<_> = (1..=64).map(|raw| registry.register(id(raw))).collect();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for raw in (1..=64).filter(|raw| raw % 4 == t) {
                        registry.mark(id(raw));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(flags.iter().all(CancelFlag::is_set));
    }
}
