//! Multi-instance coordination.
//!
//! Leader election over the shared settings store, the one-time
//! connectivity guard a follower runs before joining, and the signed HTTP
//! protocol instances use to talk to each other.

pub mod client;
pub mod coordinator;
pub mod guard;
pub mod identity;
pub mod protocol;

pub use client::PeerClient;
pub use coordinator::{LeaderCoordinator, LeadershipState};
pub use identity::InstanceIdentity;
