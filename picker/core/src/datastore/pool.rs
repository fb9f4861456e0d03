//! Single live pool configuration

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use super::types::Pool;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("pool has not been synced into the datastore yet")]
    NotInitialized,
}

/// Holds the one live [`Pool`]
///
/// Readers get a shared `Arc`, so a replace never tears a read.
#[derive(Debug, Default)]
pub struct PoolStore {
    current: RwLock<Option<Arc<Pool>>>,
}

impl PoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new pool, returning the previous one
    pub fn replace(&self, pool: Pool) -> Option<Arc<Pool>> {
        let next = Arc::new(pool);
        self.current.write().replace(next)
    }

    pub fn get(&self) -> Result<Arc<Pool>, StoreError> {
        self.current.read().clone().ok_or(StoreError::NotInitialized)
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::types::ResourceId;
    use std::thread;

    fn pool(port: u16) -> Pool {
        Pool::new(ResourceId::new("default", "pool"), port)
    }

    #[test]
    fn test_get_before_replace_is_not_initialized() {
        let store = PoolStore::new();
        assert_eq!(store.get().unwrap_err(), StoreError::NotInitialized);
        assert!(!store.is_ready());
    }

    #[test]
    fn test_replace_returns_previous() {
        let store = PoolStore::new();
        assert!(store.replace(pool(8000)).is_none());
        let previous = store.replace(pool(9000)).unwrap();
        assert_eq!(previous.target_port, 8000);
        assert_eq!(store.get().unwrap().target_port, 9000);
    }

    #[test]
    fn test_concurrent_replace_never_tears() {
        let store = Arc::new(PoolStore::new());
        store.replace(pool(1).with_selector("port", "1"));

        let writers: Vec<_> = (1..=4u16)
            .map(|port| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..500 {
                        store.replace(pool(port).with_selector("port", port.to_string()));
                    }
                })
            })
            .collect();

        for _ in 0..2000 {
            let seen = store.get().unwrap();
            assert_eq!(seen.selector["port"], seen.target_port.to_string());
        }
        for writer in writers {
            writer.join().unwrap();
        }
    }
}
