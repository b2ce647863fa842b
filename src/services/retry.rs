//! Retry policy: decides whether and when a failed backend call is re-attempted.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ErrorKind;

/// Backoff rule for one error kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryRule {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryRule {
    pub const fn new(max_retries: u32, base_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_multiplier,
        }
    }

    /// `base_delay * multiplier^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.base_delay
            .mul_f64(self.backoff_multiplier.powi(exponent).min(MAX_BACKOFF_FACTOR))
    }
}

/// Caps the exponential factor so `Duration::mul_f64` cannot overflow.
const MAX_BACKOFF_FACTOR: f64 = 1.0e6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(ErrorKind),
}

/// Per-kind retry table. Kinds without a rule are never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    rules: HashMap<ErrorKind, RetryRule>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let rules = HashMap::from([
            (
                ErrorKind::RateLimited,
                RetryRule::new(3, Duration::from_secs(30), 2.0),
            ),
            (
                ErrorKind::Timeout,
                RetryRule::new(2, Duration::from_secs(10), 1.5),
            ),
            (
                ErrorKind::ServiceOverloaded,
                RetryRule::new(5, Duration::from_secs(60), 3.0),
            ),
            (
                ErrorKind::TransientNetwork,
                RetryRule::new(1, Duration::from_secs(5), 2.0),
            ),
        ]);
        Self { rules }
    }
}

impl RetryPolicy {
    /// Replace the rule for one kind.
    pub fn with_rule(mut self, kind: ErrorKind, rule: RetryRule) -> Self {
        self.rules.insert(kind, rule);
        self
    }

    /// Decide after the zero-based `attempt` failed with `kind`.
    pub fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        match self.rules.get(&kind) {
            Some(rule) if attempt < rule.max_retries => RetryDecision::RetryAfter(rule.delay_for(attempt)),
            _ => RetryDecision::GiveUp(kind),
        }
    }
}
