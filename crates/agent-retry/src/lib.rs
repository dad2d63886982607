//! Backoff calculation shared by the dispatch reconnect supervisor and
//! action-catalog fetch retries.
//!
//! Only the delay math lives here; `agent-dispatch` owns the actual sleep
//! loop and the decision of when to give up reconnecting entirely, since
//! that decision also depends on transport-level error classification this
//! crate has no knowledge of.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How delay grows between successive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffCurve {
    /// Doubles the delay every attempt, up to `max_delay`.
    #[default]
    Exponential,
    /// Multiplies the delay by 1.5 every attempt, up to `max_delay`.
    Geometric1_5,
    /// Same delay on every attempt.
    Constant,
}

/// Tunable parameters for [`next_delay`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub curve: BackoffCurve,
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Fraction of the computed delay randomized in either direction, in
    /// `[0.0, 1.0]`. `0.5` means the actual delay returned is somewhere
    /// between 50% and 150% of the unjittered value.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            curve: BackoffCurve::Exponential,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.25
}

impl BackoffConfig {
    /// The reconnect backoff the dispatch loop falls back to when the
    /// coordinator gives it no explicit retry hint: 2s, 3s, 4.5s, ...,
    /// capped at 15 minutes so an outage doesn't leave the agent silent
    /// for hours but also doesn't hammer the coordinator on the first
    /// blip.
    pub fn dispatch_reconnect() -> Self {
        Self {
            curve: BackoffCurve::Geometric1_5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(900),
            jitter: 0.3,
        }
    }
}

/// Computes the delay before attempt number `attempt` (1-indexed: the
/// first retry after an initial failure is attempt `1`).
pub fn next_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let raw = match config.curve {
        BackoffCurve::Constant => config.initial_delay,
        BackoffCurve::Exponential => {
            let exponent = attempt.saturating_sub(1).min(20);
            config
                .initial_delay
                .saturating_mul(2u32.saturating_pow(exponent))
        }
        BackoffCurve::Geometric1_5 => {
            let exponent = attempt.saturating_sub(1).min(50);
            config.initial_delay.mul_f64(1.5_f64.powi(exponent as i32))
        }
    };
    let capped = raw.min(config.max_delay);
    apply_jitter(capped, config.jitter)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    use rand::RngExt;
    let mut rng = rand::rng();
    let factor = 1.0 - jitter + rng.random::<f64>() * (2.0 * jitter);
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}
