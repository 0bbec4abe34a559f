//! Randomized flush policy.
//!
//! Each survey carries a flush probability.  It starts at the minimum, climbs
//! by a fixed step on every eligible tick that does not flush (capped at the
//! maximum), and usually drops back to the minimum after a flush.  With
//! `reset_skip_percentage` chance the drop is skipped and the probability
//! carries over unchanged; later misses keep climbing from there.

use std::time::Duration;

use garde::Validate;
use rand::Rng;

use crate::config::FlushConfig;
use crate::errors::ShieldError;

/// Validated, immutable flush tuning.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct FlushPolicy {
    #[garde(range(max = 100))]
    min_percentage: u32,
    #[garde(range(max = 100))]
    max_percentage: u32,
    #[garde(range(max = 100))]
    percentage_increment: u32,
    #[garde(range(max = 100))]
    reset_skip_percentage: u32,
    #[garde(range(min = 1))]
    min_batch_size: usize,
    #[garde(skip)]
    check_interval: Duration,
    #[garde(skip)]
    idle_state_ttl: Duration,
}

impl FlushPolicy {
    pub fn from_config(config: &FlushConfig) -> Result<Self, ShieldError> {
        let policy = Self {
            min_percentage: config.min_percentage,
            max_percentage: config.max_percentage,
            percentage_increment: config.percentage_increment,
            reset_skip_percentage: config.reset_skip_percentage,
            min_batch_size: config.min_batch_size,
            check_interval: Duration::from_secs(config.check_interval_seconds.max(1)),
            idle_state_ttl: Duration::from_secs(config.idle_state_ttl_seconds),
        };
        policy
            .validate()
            .map_err(|report| ShieldError::InvalidConfig(format!("flush: {report}")))?;
        if policy.min_percentage > policy.max_percentage {
            return Err(ShieldError::InvalidConfig(format!(
                "flush: min_percentage ({}) exceeds max_percentage ({})",
                policy.min_percentage, policy.max_percentage
            )));
        }
        Ok(policy)
    }

    pub fn min_percentage(&self) -> u32 {
        self.min_percentage
    }

    pub fn max_percentage(&self) -> u32 {
        self.max_percentage
    }

    pub fn min_batch_size(&self) -> usize {
        self.min_batch_size
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn idle_state_ttl(&self) -> Duration {
        self.idle_state_ttl
    }

    /// Whether `pending` responses are enough for a scheduled flush.
    pub fn is_eligible(&self, pending: usize) -> bool {
        pending >= self.min_batch_size
    }

    /// Whether a draw in `0..100` hits the current probability.
    pub fn should_flush(&self, probability: u32, draw: u32) -> bool {
        draw < probability
    }

    /// Probability after an eligible tick that did not flush.
    pub fn after_miss(&self, probability: u32) -> u32 {
        probability
            .saturating_add(self.percentage_increment)
            .min(self.max_percentage)
    }

    /// Whether a draw in `0..100` skips the post-flush reset.
    pub fn should_skip_reset(&self, draw: u32) -> bool {
        draw < self.reset_skip_percentage
    }

    /// Probability after a successful flush.
    pub fn after_flush(&self, probability: u32, skip_reset: bool) -> u32 {
        if skip_reset {
            probability
        } else {
            self.min_percentage
        }
    }
}

/// Source of uniform draws in `0..100`.
pub trait Dice: Send + Sync + 'static {
    fn roll(&self) -> u32;
}

/// Thread-local RNG; the production source.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngDice;

impl Dice for ThreadRngDice {
    fn roll(&self) -> u32 {
        rand::thread_rng().gen_range(0..100)
    }
}

/// Always rolls the same value.  `FixedDice(0)` hits any non-zero
/// probability; `FixedDice(99)` only hits 100%.
#[derive(Debug, Clone, Copy)]
pub struct FixedDice(pub u32);

impl Dice for FixedDice {
    fn roll(&self) -> u32 {
        self.0
    }
}
