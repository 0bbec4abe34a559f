//! SurveyShield library -- delayed, leader-elected persistence of anonymous
//! survey responses.
//!
//! Several instances share one coordination store and elect a single writer
//! among themselves.  Answers are buffered in memory and released to storage
//! in randomized batches by the elected writer only, so the time an answer
//! was submitted cannot be read off the time it was stored.

use std::sync::Arc;

pub mod anonymize;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod dss;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod storage;

use crate::cluster::{LeaderCoordinator, PeerClient};
use crate::config::Config;
use crate::dss::FlushScheduler;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Leader election for this instance.
    pub coordinator: Arc<LeaderCoordinator>,
    /// Pending queue and flush loop.
    pub scheduler: Arc<FlushScheduler>,
    /// Signed client for calls to other instances.
    pub peer: Arc<PeerClient>,
}
