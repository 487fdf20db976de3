//! Reconnection strategies for broken sessions.
//!
//! A strategy is consulted every time a session tries to re-establish its
//! connection. Strategies are stateful and never shared: each session gets its
//! own instance from a [`ReconnectionStrategyFactory`] when its failover
//! callback is attached, and the instance's counter lives as long as the
//! session does.

use std::fmt;
use std::time::Duration;

/// Outcome of consulting a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Make another connection attempt after waiting `delay`.
    Retry {
        /// Pause before the attempt.
        delay: Duration,
    },
    /// Stop trying; the session becomes permanently failed.
    GiveUp,
}

/// A per-session retry policy.
pub trait ReconnectionStrategy: Send + fmt::Debug {
    /// Decide whether reconnection attempt number `attempt` (1-based within
    /// the current fault) may run.
    fn decide(&mut self, attempt: u32) -> Decision;

    /// Total attempts granted over this instance's lifetime.
    fn attempts_made(&self) -> u32;
}

/// Produces a fresh strategy for every session.
pub trait ReconnectionStrategyFactory: Send + Sync {
    /// Create a new strategy instance with its own state.
    fn create(&self) -> Box<dyn ReconnectionStrategy>;
}

/// Allows exactly `max_attempts` reconnection attempts over the lifetime of
/// the instance, each after a fixed delay.
///
/// With `max_attempts == 0` the first fault is final.
#[derive(Debug, Clone)]
pub struct KTimesReconnectionStrategy {
    max_attempts: u32,
    delay: Duration,
    made: u32,
}

impl KTimesReconnectionStrategy {
    /// Create a strategy allowing `max_attempts` attempts without delay.
    pub fn new(max_attempts: u32) -> Self {
        Self::with_delay(max_attempts, Duration::ZERO)
    }

    /// Create a strategy allowing `max_attempts` attempts, each after `delay`.
    pub fn with_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            made: 0,
        }
    }
}

impl ReconnectionStrategy for KTimesReconnectionStrategy {
    fn decide(&mut self, _attempt: u32) -> Decision {
        if self.made >= self.max_attempts {
            return Decision::GiveUp;
        }
        self.made += 1;
        Decision::Retry { delay: self.delay }
    }

    fn attempts_made(&self) -> u32 {
        self.made
    }
}

/// Factory for [`KTimesReconnectionStrategy`].
#[derive(Debug, Clone)]
pub struct KTimesReconnectionStrategyFactory {
    max_attempts: u32,
    delay: Duration,
}

impl KTimesReconnectionStrategyFactory {
    /// Sessions may reconnect `max_attempts` times, immediately.
    pub fn new(max_attempts: u32) -> Self {
        Self::with_delay(max_attempts, Duration::ZERO)
    }

    /// Sessions may reconnect `max_attempts` times, pausing `delay` before each.
    pub fn with_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl ReconnectionStrategyFactory for KTimesReconnectionStrategyFactory {
    fn create(&self) -> Box<dyn ReconnectionStrategy> {
        Box::new(KTimesReconnectionStrategy::with_delay(
            self.max_attempts,
            self.delay,
        ))
    }
}

/// Bounded strategy whose delay doubles with every attempt of a fault,
/// capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffStrategy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    made: u32,
}

impl ExponentialBackoffStrategy {
    /// Create a new backoff strategy.
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            made: 0,
        }
    }

    /// Delay before attempt number `attempt` of a fault.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl ReconnectionStrategy for ExponentialBackoffStrategy {
    fn decide(&mut self, attempt: u32) -> Decision {
        if self.made >= self.max_attempts {
            return Decision::GiveUp;
        }
        self.made += 1;
        Decision::Retry {
            delay: self.delay_for(attempt),
        }
    }

    fn attempts_made(&self) -> u32 {
        self.made
    }
}

/// Factory for [`ExponentialBackoffStrategy`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoffStrategyFactory {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffStrategyFactory {
    /// Create a new factory.
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }
}

impl ReconnectionStrategyFactory for ExponentialBackoffStrategyFactory {
    fn create(&self) -> Box<dyn ReconnectionStrategy> {
        Box::new(ExponentialBackoffStrategy::new(
            self.max_attempts,
            self.initial_delay,
            self.max_delay,
        ))
    }
}
