//! In-memory coordination store.
//!
//! Stores all settings in memory with no persistence.  Several coordinators
//! can share one `Arc<MemorySettingsStore>` to simulate a fleet inside a
//! single process; the write lock plays the role of the row lock.
//! [`MemorySettingsStore::set_failing`] simulates an unreachable store.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use super::store::{ConditionalUpdate, SettingsStore};

#[derive(Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, String>>,
    writes: AtomicU64,
    failing: AtomicBool,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails without touching the stored values.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("settings store unavailable");
        }
        Ok(())
    }

    /// Number of successful writes (seed, set, applied conditional updates).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of every stored setting.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.read().expect("rwlock poisoned").clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.ensure_available()?;
            let values = self.values.read().expect("rwlock poisoned");
            Ok(values.get(&key).cloned())
        })
    }

    fn get_many(
        &self,
        keys: &[&str],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, String>>> + Send + '_>> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        Box::pin(async move {
            self.ensure_available()?;
            let values = self.values.read().expect("rwlock poisoned");
            Ok(keys
                .into_iter()
                .filter_map(|k| values.get(&k).cloned().map(|v| (k, v)))
                .collect())
        })
    }

    fn seed(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            self.ensure_available()?;
            let mut values = self.values.write().expect("rwlock poisoned");
            if values.contains_key(&key) {
                return Ok(false);
            }
            values.insert(key, value);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
    }

    fn set(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            self.ensure_available()?;
            let mut values = self.values.write().expect("rwlock poisoned");
            values.insert(key, value);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn try_conditional_update(
        &self,
        update: ConditionalUpdate,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_available()?;
            let mut values = self.values.write().expect("rwlock poisoned");
            let current = values.get(&update.key).map(String::as_str).unwrap_or("");
            if !update.matches(current) {
                return Ok(false);
            }
            values.insert(update.key.clone(), update.new_value.clone());
            for (key, value) in &update.companions {
                values.insert(key.clone(), value.clone());
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::store::keys;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_seed_and_write_count() {
        let store = MemorySettingsStore::new();
        assert!(store.seed(keys::LEADER_ID, "").await.unwrap());
        assert!(!store.seed(keys::LEADER_ID, "x").await.unwrap());
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.get(keys::LEADER_ID).await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_takeover_only_against_observed_value() {
        let store = MemorySettingsStore::new();
        store.set(keys::LEADER_ID, "old:1").await.unwrap();

        let first = ConditionalUpdate::when_equals(keys::LEADER_ID, "old:1", "a:1");
        let second = ConditionalUpdate::when_equals(keys::LEADER_ID, "old:1", "b:2");
        assert!(store.try_conditional_update(first).await.unwrap());
        assert!(!store.try_conditional_update(second).await.unwrap());
        assert_eq!(store.snapshot()[keys::LEADER_ID], "a:1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_single_winner() {
        let store = Arc::new(MemorySettingsStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let update =
                    ConditionalUpdate::when_equals(keys::LEADER_ID, "", &format!("n{i}:1"));
                store.try_conditional_update(update).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            winners += usize::from(handle.await.unwrap());
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_failing_store_changes_nothing() {
        let store = MemorySettingsStore::new();
        store.set(keys::LEADER_ID, "a:1").await.unwrap();

        store.set_failing(true);
        assert!(store.get(keys::LEADER_ID).await.is_err());
        let claim = ConditionalUpdate::when_equals(keys::LEADER_ID, "a:1", "b:2");
        assert!(store.try_conditional_update(claim).await.is_err());
        assert_eq!(store.write_count(), 1);

        store.set_failing(false);
        assert_eq!(store.get(keys::LEADER_ID).await.unwrap().as_deref(), Some("a:1"));
    }
}
