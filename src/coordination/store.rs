//! Abstract coordination store trait.
//!
//! Every instance of a fleet talks to the same key/value settings table.
//! Besides plain reads and writes, the store must offer one transactional
//! read-modify-write, [`SettingsStore::try_conditional_update`], which is the
//! only serialization point leader election relies on.  Any backend that can
//! hold a lock across "read old value, decide, write new value" can implement
//! it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Well-known setting keys.
pub mod keys {
    /// Identity of the current leader; empty when vacant.
    pub const LEADER_ID: &str = "LeaderId";
    /// ISO-8601 UTC timestamp of the leader's last heartbeat.
    pub const LEADER_HEARTBEAT: &str = "LeaderHeartbeat";
    /// Heartbeat age (minutes) after which the leader may be taken over.
    pub const LEADER_TIMEOUT: &str = "LeaderTimeout";
    /// Seconds between election checks.
    pub const LEADER_CHECK_INTERVAL: &str = "LeaderCheckIntervalSeconds";
}

/// Predicate evaluated against the current value of a key.
///
/// An absent row is presented as the empty string.
pub type ValuePredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// A compare-and-swap request against a single key.
///
/// `new_value` is written to `key` only if `predicate` holds for the value
/// read inside the same transaction.  `companions` are written in that same
/// transaction when (and only when) the primary write happens.
pub struct ConditionalUpdate {
    pub key: String,
    pub new_value: String,
    predicate: ValuePredicate,
    pub companions: Vec<(String, String)>,
}

impl ConditionalUpdate {
    /// Build an update guarded by an arbitrary predicate.
    pub fn new<F>(key: &str, new_value: &str, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            key: key.to_string(),
            new_value: new_value.to_string(),
            predicate: Box::new(predicate),
            companions: Vec::new(),
        }
    }

    /// Build an update that applies only while `key` still holds `expected`.
    pub fn when_equals(key: &str, expected: &str, new_value: &str) -> Self {
        let expected = expected.to_string();
        Self::new(key, new_value, move |current| current == expected)
    }

    /// Also write `key = value` if the update applies.
    pub fn also_set(mut self, key: &str, value: &str) -> Self {
        self.companions.push((key.to_string(), value.to_string()));
        self
    }

    /// Evaluate the guard against the current stored value.
    pub fn matches(&self, current: &str) -> bool {
        (self.predicate)(current)
    }
}

impl fmt::Debug for ConditionalUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalUpdate")
            .field("key", &self.key)
            .field("new_value", &self.new_value)
            .field("companions", &self.companions)
            .finish_non_exhaustive()
    }
}

/// Async coordination store contract.
pub trait SettingsStore: Send + Sync + 'static {
    /// Read a single setting.  The election itself reads through
    /// [`get_many`](Self::get_many); this is for bootstrap checks and tests.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>>;

    /// Read several settings from one consistent snapshot. Missing keys are
    /// simply absent from the returned map.
    fn get_many(
        &self,
        keys: &[&str],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, String>>> + Send + '_>>;

    /// Insert `key = value` only if the key does not exist yet.
    /// Returns whether a row was inserted.
    fn seed(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Unconditionally write `key = value`.
    ///
    /// Bootstrap and test use only.  The coordinator never calls this: its
    /// heartbeat, claim, takeover and relinquish all go through
    /// [`try_conditional_update`](Self::try_conditional_update).
    fn set(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Atomically apply `update` if its predicate holds. Returns `false` when
    /// the predicate rejected the current value; that is an expected outcome,
    /// not an error.
    fn try_conditional_update(
        &self,
        update: ConditionalUpdate,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;
}

/// Current time as an ISO-8601 UTC string (e.g. `2026-02-23T12:00:00.000Z`).
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
