//! Leader election over the shared coordination store.
//!
//! Every instance runs the same periodic check and races its peers to own
//! the `LeaderId` setting.  The store's conditional update is the only
//! serialization point: claims and takeovers are compare-and-swap writes
//! against the value the instance just observed, so at most one contender
//! wins any given round.  No quorum, no log; crashes are healed by heartbeat
//! timeout.
//!
//! The current state is published on a `watch` channel.  Dependents (the
//! flush scheduler, HTTP handlers) either poll [`LeaderCoordinator::is_leader`]
//! or [`LeaderCoordinator::subscribe`] to transitions.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::guard::{verify_leader_reachable, LeaderProbe};
use super::identity::InstanceIdentity;
use crate::config::{DeploymentMode, ElectionConfig};
use crate::coordination::store::now_iso8601;
use crate::coordination::{keys, ConditionalUpdate, SettingsStore};
use crate::errors::ShieldError;
use crate::metrics::{IS_LEADER, LEADERSHIP_TRANSITIONS_TOTAL};

/// Where this instance stands in the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LeadershipState {
    /// No election outcome known yet.
    Uninitialized,
    Follower,
    Leader,
}

/// Election timing in effect for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
    pub leader_timeout: Duration,
    pub check_interval: Duration,
}

impl ElectionTiming {
    fn from_defaults(defaults: &ElectionConfig) -> Self {
        Self {
            leader_timeout: minutes(defaults.leader_timeout_minutes)
                .unwrap_or(Duration::from_secs(DEFAULT_LEADER_TIMEOUT_MINUTES * 60)),
            check_interval: seconds(defaults.check_interval_seconds)
                .unwrap_or(Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECONDS)),
        }
    }
}

struct RunningTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Elects exactly one writer among the instances sharing a store.
pub struct LeaderCoordinator {
    identity: InstanceIdentity,
    mode: DeploymentMode,
    store: Arc<dyn SettingsStore>,
    probe: Arc<dyn LeaderProbe>,
    defaults: ElectionConfig,
    timing: RwLock<ElectionTiming>,
    state_tx: watch::Sender<LeadershipState>,
    /// Leader last accepted while following; used for logging and forwarding.
    observed_leader: Mutex<Option<String>>,
    /// Held for the duration of one check; a second check skips instead of
    /// queuing behind it.
    check_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<RunningTask>>,
}

impl LeaderCoordinator {
    pub fn new(
        identity: InstanceIdentity,
        mode: DeploymentMode,
        store: Arc<dyn SettingsStore>,
        probe: Arc<dyn LeaderProbe>,
        defaults: ElectionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(LeadershipState::Uninitialized);
        Self {
            identity,
            mode,
            store,
            probe,
            timing: RwLock::new(ElectionTiming::from_defaults(&defaults)),
            defaults,
            state_tx,
            observed_leader: Mutex::new(None),
            check_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    /// Write default election settings unless they already exist.
    /// Idempotent; every instance may call it at bootstrap.
    pub async fn seed_settings(
        store: &dyn SettingsStore,
        defaults: &ElectionConfig,
    ) -> anyhow::Result<()> {
        store.seed(keys::LEADER_ID, "").await?;
        store.seed(keys::LEADER_HEARTBEAT, "").await?;
        store
            .seed(keys::LEADER_TIMEOUT, &defaults.leader_timeout_minutes.to_string())
            .await?;
        store
            .seed(
                keys::LEADER_CHECK_INTERVAL,
                &defaults.check_interval_seconds.to_string(),
            )
            .await?;
        Ok(())
    }

    // -- Accessors ----------------------------------------------------------

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn state(&self) -> LeadershipState {
        *self.state_tx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeadershipState::Leader
    }

    /// Whether at least one election outcome is known.
    pub fn is_ready(&self) -> bool {
        self.state() != LeadershipState::Uninitialized
    }

    pub fn timing(&self) -> ElectionTiming {
        *self.timing.read().expect("rwlock poisoned")
    }

    /// The leader this instance currently defers to, if any.
    pub fn current_leader(&self) -> Option<String> {
        if self.is_leader() {
            return Some(self.identity.to_string());
        }
        self.observed_leader.lock().expect("mutex poisoned").clone()
    }

    /// Receive every leadership transition.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_tx.subscribe()
    }

    /// Wait until an election outcome is known.
    pub async fn wait_ready(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail while we
        // are borrowed.
        let _ = rx
            .wait_for(|state| *state != LeadershipState::Uninitialized)
            .await;
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Join the fleet and start the periodic election check.
    ///
    /// Fails with [`ShieldError::LeaderUnreachable`] when a live leader is
    /// recorded that this instance cannot reach; the caller must abort
    /// startup in that case.
    pub async fn start(self: &Arc<Self>) -> Result<(), ShieldError> {
        if self.mode == DeploymentMode::Single {
            info!(instance = %self.identity, "Single-instance deployment: acting as leader");
            self.transition(LeadershipState::Leader);
            return Ok(());
        }

        let timing = self.load_timing().await?;
        *self.timing.write().expect("rwlock poisoned") = timing;
        info!(
            instance = %self.identity,
            timeout_secs = timing.leader_timeout.as_secs(),
            interval_secs = timing.check_interval.as_secs(),
            "Starting leader election"
        );

        let recorded = self
            .store
            .get_many(&[keys::LEADER_ID, keys::LEADER_HEARTBEAT])
            .await
            .map_err(ShieldError::Internal)?;
        let leader = recorded.get(keys::LEADER_ID).map(String::as_str).unwrap_or("");
        if !leader.is_empty() && leader != self.identity.as_str() {
            let heartbeat = recorded.get(keys::LEADER_HEARTBEAT).map(String::as_str);
            if heartbeat_expired(heartbeat, Utc::now(), timing.leader_timeout) {
                info!(leader, "Recorded leader looks stale; skipping connectivity check");
            } else {
                verify_leader_reachable(self.probe.as_ref(), leader).await?;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            coordinator.run_loop(stop_rx).await;
        });
        *self.task.lock().expect("mutex poisoned") = Some(RunningTask {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the periodic check and, if leading, give up leadership so a
    /// follower does not have to wait for the heartbeat to expire.
    pub async fn stop(&self) {
        let task = self.task.lock().expect("mutex poisoned").take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Leader election task ended abnormally");
            }
        }

        if self.mode == DeploymentMode::Single || !self.is_leader() {
            return;
        }

        let release = ConditionalUpdate::when_equals(keys::LEADER_ID, self.identity.as_str(), "");
        match self.store.try_conditional_update(release).await {
            Ok(true) => info!(instance = %self.identity, "Relinquished leadership"),
            Ok(false) => debug!("Leadership already passed to another instance"),
            Err(e) => warn!(error = %e, "Failed to relinquish leadership; peers will wait for timeout"),
        }
        self.transition(LeadershipState::Follower);
    }

    async fn run_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.timing().check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_check().await;
                }
                _ = stop.changed() => break,
            }
        }
        debug!("Leader election loop stopped");
    }

    // -- Election check -----------------------------------------------------

    /// Run one election check.
    ///
    /// Returns `None` when another check is still in flight (the call is
    /// skipped rather than queued).  Store failures are logged and leave the
    /// current state unchanged; the next tick retries.
    pub async fn run_check(&self) -> Option<LeadershipState> {
        if self.mode == DeploymentMode::Single {
            return Some(self.state());
        }

        let Ok(_guard) = self.check_lock.try_lock() else {
            debug!("Previous leader election check still running; skipping");
            return None;
        };

        match self.check_once().await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "Leader election check failed");
                Some(self.state())
            }
        }
    }

    async fn check_once(&self) -> anyhow::Result<LeadershipState> {
        let me = self.identity.as_str();
        let values = self
            .store
            .get_many(&[keys::LEADER_ID, keys::LEADER_HEARTBEAT])
            .await?;
        let leader = values.get(keys::LEADER_ID).map(String::as_str).unwrap_or("");
        let now = now_iso8601();

        if leader == me {
            // Refresh only while we still hold the row; a takeover that
            // slipped in since the read must not get our heartbeat.
            let refresh = ConditionalUpdate::when_equals(keys::LEADER_ID, me, me)
                .also_set(keys::LEADER_HEARTBEAT, &now);
            if self.store.try_conditional_update(refresh).await? {
                return Ok(self.transition(LeadershipState::Leader));
            }
            warn!(instance = me, "Lost leadership between read and heartbeat");
            return Ok(self.transition(LeadershipState::Follower));
        }

        if leader.is_empty() {
            let claim = ConditionalUpdate::when_equals(keys::LEADER_ID, "", me)
                .also_set(keys::LEADER_HEARTBEAT, &now);
            if self.store.try_conditional_update(claim).await? {
                info!(instance = me, "Claimed vacant leadership");
                return Ok(self.transition(LeadershipState::Leader));
            }
            debug!("Lost the race for vacant leadership");
            return Ok(self.transition(LeadershipState::Follower));
        }

        let heartbeat = values.get(keys::LEADER_HEARTBEAT).map(String::as_str);
        let timeout = self.timing().leader_timeout;
        if heartbeat_expired(heartbeat, Utc::now(), timeout) {
            let takeover = ConditionalUpdate::when_equals(keys::LEADER_ID, leader, me)
                .also_set(keys::LEADER_HEARTBEAT, &now);
            if self.store.try_conditional_update(takeover).await? {
                info!(
                    instance = me,
                    previous = leader,
                    last_heartbeat = heartbeat.unwrap_or(""),
                    "Took over leadership from unresponsive leader"
                );
                return Ok(self.transition(LeadershipState::Leader));
            }
            debug!(previous = leader, "Lost the race to take over leadership");
            return Ok(self.transition(LeadershipState::Follower));
        }

        if self.is_leader() {
            warn!(instance = me, leader, "Superseded by another leader; stepping down");
        }
        self.accept_leader(leader);
        Ok(self.transition(LeadershipState::Follower))
    }

    fn accept_leader(&self, leader: &str) {
        let mut observed = self.observed_leader.lock().expect("mutex poisoned");
        if observed.as_deref() != Some(leader) {
            info!(leader, "Following leader");
            *observed = Some(leader.to_string());
        }
    }

    /// Publish `next` if it differs from the current state and return it.
    fn transition(&self, next: LeadershipState) -> LeadershipState {
        let mut previous = next;
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            previous = *state;
            *state = next;
            true
        });

        if changed {
            metrics::counter!(LEADERSHIP_TRANSITIONS_TOTAL).increment(1);
            let gauge = if next == LeadershipState::Leader { 1.0 } else { 0.0 };
            metrics::gauge!(IS_LEADER).set(gauge);
            match next {
                LeadershipState::Leader => {
                    *self.observed_leader.lock().expect("mutex poisoned") = None;
                    info!(instance = %self.identity, ?previous, "Now leader");
                }
                LeadershipState::Follower if previous == LeadershipState::Leader => {
                    info!(instance = %self.identity, "No longer leader");
                }
                _ => {}
            }
        }
        next
    }

    async fn load_timing(&self) -> Result<ElectionTiming, ShieldError> {
        let values = self
            .store
            .get_many(&[keys::LEADER_TIMEOUT, keys::LEADER_CHECK_INTERVAL])
            .await
            .map_err(ShieldError::Internal)?;

        let fallback = ElectionTiming::from_defaults(&self.defaults);
        let leader_timeout = parse_positive(values.get(keys::LEADER_TIMEOUT))
            .and_then(minutes)
            .unwrap_or_else(|| {
                warn_unusable(keys::LEADER_TIMEOUT, values.get(keys::LEADER_TIMEOUT));
                fallback.leader_timeout
            });
        let check_interval = parse_positive(values.get(keys::LEADER_CHECK_INTERVAL))
            .and_then(seconds)
            .unwrap_or_else(|| {
                warn_unusable(keys::LEADER_CHECK_INTERVAL, values.get(keys::LEADER_CHECK_INTERVAL));
                fallback.check_interval
            });

        Ok(ElectionTiming {
            leader_timeout,
            check_interval,
        })
    }
}

/// Upper bound for any election timing value, one week.
const MAX_TIMING_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_LEADER_TIMEOUT_MINUTES: u64 = 5;
const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 30;

fn parse_positive(raw: Option<&String>) -> Option<u64> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// `minutes` as a duration, or `None` when zero or beyond [`MAX_TIMING_SECS`].
fn minutes(minutes: u64) -> Option<Duration> {
    minutes.checked_mul(60).and_then(seconds)
}

fn seconds(seconds: u64) -> Option<Duration> {
    (1..=MAX_TIMING_SECS)
        .contains(&seconds)
        .then(|| Duration::from_secs(seconds))
}

fn warn_unusable(key: &str, raw: Option<&String>) {
    if let Some(raw) = raw {
        warn!(key, value = %raw, "Unusable election setting; using the configured default");
    }
}

/// Whether a heartbeat is older than `timeout` at `now`.
///
/// A missing or unreadable heartbeat counts as expired: the claim writes
/// `LeaderId` and `LeaderHeartbeat` together, so a leader without a
/// readable heartbeat was never set by a live coordinator.
pub fn heartbeat_expired(heartbeat: Option<&str>, now: DateTime<Utc>, timeout: Duration) -> bool {
    let Some(raw) = heartbeat.filter(|h| !h.is_empty()) else {
        return true;
    };
    let Ok(beat) = DateTime::parse_from_rfc3339(raw) else {
        warn!(heartbeat = raw, "Unreadable leader heartbeat");
        return true;
    };
    let age = now - beat.with_timezone(&Utc);
    match chrono::Duration::from_std(timeout) {
        Ok(limit) => age > limit,
        Err(_) => false,
    }
}
