//! Process-wide runtime registry, the lifecycle source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::models::Runtime;

/// Concurrent map from runtime id to its record.
///
/// Reads hand out cloned snapshots; writes replace whole records. For
/// read-modify-write sequences use [`RuntimeRegistry::update`], which holds
/// the write lock across the closure so concurrent field updates cannot lose
/// writes.
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    inner: Arc<RwLock<HashMap<String, Runtime>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, runtime: Runtime) {
        self.inner.write().insert(runtime.id.clone(), runtime);
    }

    pub fn load(&self, id: &str) -> Option<Runtime> {
        self.inner.read().get(id).cloned()
    }

    /// Visit every record; stop early when the visitor returns `false`.
    pub fn range(&self, mut visit: impl FnMut(&Runtime) -> bool) {
        for runtime in self.inner.read().values() {
            if !visit(runtime) {
                break;
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<Runtime> {
        self.inner.write().remove(id)
    }

    /// Mutate the record under the write lock; returns the updated snapshot,
    /// or `None` when the id is unknown.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut Runtime)) -> Option<Runtime> {
        let mut map = self.inner.write();
        let runtime = map.get_mut(id)?;
        mutate(runtime);
        Some(runtime.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuntimeState;

    fn runtime(id: &str) -> Runtime {
        Runtime::new(id.into(), "prompt".into(), "code".into())
    }

    #[test]
    fn store_load_remove_roundtrip() {
        let registry = RuntimeRegistry::new();
        registry.store(runtime("r1"));
        assert!(registry.load("r1").is_some());
        assert!(registry.load("r2").is_none());
        assert!(registry.remove("r1").is_some());
        assert!(registry.load("r1").is_none());
    }

    #[test]
    fn update_mutates_under_lock() {
        let registry = RuntimeRegistry::new();
        registry.store(runtime("r1"));
        let updated = registry
            .update("r1", |r| {
                r.state = RuntimeState::Error;
                r.last_error_msg = "boom".into();
            })
            .expect("known id");
        assert_eq!(updated.state, RuntimeState::Error);
        assert_eq!(registry.load("r1").unwrap().last_error_msg, "boom");
        assert!(registry.update("missing", |_| {}).is_none());
    }

    #[test]
    fn range_stops_when_visitor_returns_false() {
        let registry = RuntimeRegistry::new();
        registry.store(runtime("r1"));
        registry.store(runtime("r2"));
        registry.store(runtime("r3"));
        let mut seen = 0;
        registry.range(|_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn concurrent_store_and_load() {
        let registry = RuntimeRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.store(runtime(&format!("r{i}")));
                    registry.load(&format!("r{i}")).is_some()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(registry.len(), 8);
    }
}
