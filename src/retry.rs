//! Task retry configuration and exponential backoff.

use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::machines::MachinePresetName;

/// Retry section of a task definition. Unset fields fall back to the defaults
/// in [`RetryOptions::resolved`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub min_timeout_in_ms: Option<u64>,
    #[serde(default)]
    pub max_timeout_in_ms: Option<u64>,
    #[serde(default)]
    pub randomize: Option<bool>,
    #[serde(default)]
    pub out_of_memory: Option<OutOfMemoryRetry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutOfMemoryRetry {
    /// Preset to retry on after an out-of-memory failure.
    #[serde(default)]
    pub machine: Option<MachinePresetName>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRetry {
    pub max_attempts: u32,
    pub factor: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub randomize: bool,
}

impl Default for ResolvedRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            factor: 2.0,
            min_timeout_ms: 1_000,
            max_timeout_ms: 60_000,
            randomize: true,
        }
    }
}

impl RetryOptions {
    pub fn resolved(&self) -> ResolvedRetry {
        let d = ResolvedRetry::default();
        ResolvedRetry {
            max_attempts: self.max_attempts.unwrap_or(d.max_attempts),
            factor: self.factor.unwrap_or(d.factor),
            min_timeout_ms: self.min_timeout_in_ms.unwrap_or(d.min_timeout_ms),
            max_timeout_ms: self.max_timeout_in_ms.unwrap_or(d.max_timeout_ms),
            randomize: self.randomize.unwrap_or(d.randomize),
        }
    }

    pub fn out_of_memory_machine(&self) -> Option<MachinePresetName> {
        self.out_of_memory.as_ref().and_then(|o| o.machine)
    }
}

/// Delay before the attempt after `attempt`, or `None` once attempts are exhausted.
///
/// `min * factor^(attempt-1)`, scaled by a random factor in `[1, 2)` when
/// randomized, capped at `max`.
pub fn calculate_next_retry_delay(options: &RetryOptions, attempt: u32) -> Option<Duration> {
    let r = options.resolved();
    if attempt >= r.max_attempts {
        return None;
    }
    let random = if r.randomize {
        rand::rng().random_range(1.0..2.0)
    } else {
        1.0
    };
    let exp = attempt.saturating_sub(1) as i32;
    let raw = random * r.min_timeout_ms as f64 * r.factor.powi(exp);
    let ms = raw.min(r.max_timeout_ms as f64).max(0.0).round() as u64;
    Some(Duration::from_millis(ms))
}
