//! Durable response storage.
//!
//! The [`sink::ResponseSink`] trait abstracts over where flushed answers
//! end up.  Implementations include a SQLite table and an in-memory vector.

pub mod memory;
pub mod sink;
pub mod sqlite;

pub use sink::{ResponseSink, StoredResponse};
