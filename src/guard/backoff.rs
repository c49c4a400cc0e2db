//! Backoff curves and jitter.
//!
//! Pure functions: given an attempt number (1-based) and, for decorrelated
//! jitter, the previous delay of the same operation, produce the wait before
//! the next attempt. Randomness comes from a caller-supplied [`RandomSource`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::random::RandomSource;
use crate::types::{Error, Result};

/// Shape of the backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
    Custom,
}

/// Caller-supplied backoff curve: attempt number to delay.
#[derive(Clone)]
pub struct CustomBackoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl CustomBackoff {
    pub fn new(curve: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(curve))
    }

    fn delay(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }
}

impl fmt::Debug for CustomBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomBackoff(..)")
    }
}

impl PartialEq for CustomBackoff {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Backoff curve configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for every computed delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor for the exponential curve.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Curve used when `kind` is `custom`. Code-only, never serialized.
    #[serde(skip)]
    pub custom: Option<CustomBackoff>,
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }
}

impl BackoffConfig {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            custom: None,
        }
    }

    pub fn linear(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            initial_delay,
            max_delay,
            multiplier: 1.0,
            custom: None,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial_delay,
            max_delay,
            multiplier,
            custom: None,
        }
    }

    pub fn custom(
        initial_delay: Duration,
        max_delay: Duration,
        curve: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: BackoffKind::Custom,
            initial_delay,
            max_delay,
            multiplier: 1.0,
            custom: Some(CustomBackoff::new(curve)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_delay > self.max_delay {
            return Err(Error::validation(format!(
                "backoff initial_delay ({:?}) exceeds max_delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(Error::validation(format!(
                "backoff multiplier must be a positive number, got {}",
                self.multiplier
            )));
        }
        if self.kind == BackoffKind::Custom && self.custom.is_none() {
            return Err(Error::validation(
                "custom backoff requires a curve function",
            ));
        }
        Ok(())
    }

    /// Base delay (before jitter) for a 1-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.kind {
            BackoffKind::Fixed => self.initial_delay,
            BackoffKind::Linear => clamp_micros(
                micros(self.initial_delay) * f64::from(attempt),
                self.max_delay,
            ),
            BackoffKind::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                clamp_micros(
                    micros(self.initial_delay) * self.multiplier.powi(exponent),
                    self.max_delay,
                )
            }
            BackoffKind::Custom => match &self.custom {
                Some(curve) => curve.delay(attempt).min(self.max_delay),
                None => self.initial_delay,
            },
        }
    }
}

/// Randomization strategy applied on top of the base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterKind {
    None,
    Full,
    Equal,
    Decorrelated,
}

/// Jitter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterConfig {
    #[serde(rename = "type")]
    pub kind: JitterKind,

    /// Scale of the random half for `equal` jitter, in `[0, 1]`.
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_factor() -> f64 {
    1.0
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self::new(JitterKind::Full)
    }
}

impl JitterConfig {
    pub fn new(kind: JitterKind) -> Self {
        Self { kind, factor: 1.0 }
    }

    pub fn none() -> Self {
        Self::new(JitterKind::None)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.factor) {
            return Err(Error::validation(format!(
                "jitter factor must be within [0, 1], got {}",
                self.factor
            )));
        }
        Ok(())
    }

    /// Apply jitter to `base`.
    ///
    /// `previous` is the delay this operation waited last time; only the
    /// decorrelated strategy reads it and falls back to the initial delay.
    pub fn apply(
        &self,
        base: Duration,
        previous: Option<Duration>,
        backoff: &BackoffConfig,
        rng: &dyn RandomSource,
    ) -> Duration {
        match self.kind {
            JitterKind::None => base,
            JitterKind::Full => base.mul_f64(rng.next_f64()).min(base),
            JitterKind::Equal => {
                let half = base / 2;
                (half + half.mul_f64(rng.next_f64() * self.factor)).min(base)
            }
            JitterKind::Decorrelated => {
                let low = micros(backoff.initial_delay);
                let high = micros(previous.unwrap_or(backoff.initial_delay)) * 3.0;
                if high <= low {
                    return clamp_micros(low, backoff.max_delay);
                }
                clamp_micros(low + (high - low) * rng.next_f64(), backoff.max_delay)
            }
        }
    }
}

fn micros(d: Duration) -> f64 {
    d.as_micros() as f64
}

fn clamp_micros(us: f64, max: Duration) -> Duration {
    let us = if us.is_nan() { 0.0 } else { us };
    let clamped = us.clamp(0.0, micros(max));
    Duration::from_micros(clamped as u64)
}
