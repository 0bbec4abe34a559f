//! Shared coordination store.
//!
//! The coordination store is the key/value settings table every instance
//! can reach.  The [`store::SettingsStore`] trait defines the interface;
//! [`sqlite::SqliteSettingsStore`] is the default implementation and
//! [`memory::MemorySettingsStore`] serves tests and throwaway runs.

pub mod memory;
pub mod sqlite;
pub mod store;

pub use store::{keys, ConditionalUpdate, SettingsStore};
