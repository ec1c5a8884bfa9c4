//! Retry delay policy for transiently failed mutations.
//!
//! The delay curve is independent of the retry bound (`SyncConfig::max_retries`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default delay table, indexed by `min(attempts, len - 1)`.
pub const DEFAULT_RETRY_DELAYS_SECS: [u64; 5] = [1, 2, 5, 10, 30];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Explicit delay table; the last entry repeats.
    Table { delays_secs: Vec<u64> },
    /// `base * 2^attempts`, capped.
    Exponential { base_secs: u64, max_secs: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Table {
            delays_secs: DEFAULT_RETRY_DELAYS_SECS.to_vec(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, given the attempts recorded so far.
    pub fn delay(&self, attempts: u32) -> Duration {
        match self {
            BackoffPolicy::Table { delays_secs } => {
                if delays_secs.is_empty() {
                    return Duration::ZERO;
                }
                let index = (attempts as usize).min(delays_secs.len() - 1);
                Duration::from_secs(delays_secs[index])
            }
            BackoffPolicy::Exponential {
                base_secs,
                max_secs,
            } => {
                const MAX_EXPONENT: u32 = 16;
                let factor = 2_u64.saturating_pow(attempts.min(MAX_EXPONENT));
                Duration::from_secs(base_secs.saturating_mul(factor).min(*max_secs))
            }
        }
    }
}
