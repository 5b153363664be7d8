//! Delays between reconnection attempts to a host that went down.

use std::time::Duration;

use crate::errors::InvalidArgument;

/// Produces a fresh [`ReconnectionSchedule`] each time a host goes down.
pub trait ReconnectionPolicy: std::fmt::Debug + Send + Sync {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// Sequence of delays for one down period of one host.
pub trait ReconnectionSchedule: Send {
    /// Returns the delay before the next attempt and advances the schedule.
    fn get_delay(&mut self) -> Duration;
}

/// Waits the same delay before every attempt.
#[derive(Debug, Clone, Copy)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

struct ConstantSchedule {
    delay: Duration,
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule { delay: self.delay })
    }
}

impl ReconnectionSchedule for ConstantSchedule {
    fn get_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Doubles the delay after every attempt, starting at `base_delay` and
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    /// Fails if `base_delay` is zero or greater than `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Result<Self, InvalidArgument> {
        if base_delay.is_zero() {
            return Err(InvalidArgument(
                "base delay must be strictly positive".to_owned(),
            ));
        }
        if base_delay > max_delay {
            return Err(InvalidArgument(format!(
                "base delay ({:?}) cannot be greater than max delay ({:?})",
                base_delay, max_delay
            )));
        }
        Ok(Self {
            base_delay,
            max_delay,
        })
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for ExponentialReconnectionPolicy {
    /// One second, doubling up to ten minutes.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
        }
    }
}

struct ExponentialSchedule {
    base_delay: Duration,
    max_delay: Duration,
    attempts: u32,
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            attempts: 0,
        })
    }
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn get_delay(&mut self) -> Duration {
        // Past 2^31 the delay has long been capped.
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        self.attempts = self.attempts.saturating_add(1).min(32);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn exponential_sequence_is_capped() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(32))
                .unwrap();
        let mut schedule = policy.new_schedule();
        let delays: Vec<u64> = (0..8).map(|_| schedule.get_delay().as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn exponential_schedule_survives_many_attempts() {
        let policy = ExponentialReconnectionPolicy::default();
        let mut schedule = policy.new_schedule();
        for _ in 0..100 {
            assert!(schedule.get_delay() <= Duration::from_secs(600));
        }
        assert_eq!(schedule.get_delay(), Duration::from_secs(600));
    }

    #[test]
    fn schedules_are_independent() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_millis(100), Duration::from_secs(1))
                .unwrap();
        let mut first = policy.new_schedule();
        first.get_delay();
        first.get_delay();
        let mut second = policy.new_schedule();
        assert_eq!(second.get_delay(), Duration::from_millis(100));
        assert_eq!(first.get_delay(), Duration::from_millis(400));
    }

    #[test]
    fn exponential_rejects_invalid_arguments() {
        assert_matches!(
            ExponentialReconnectionPolicy::new(Duration::ZERO, Duration::from_secs(1)),
            Err(InvalidArgument(_))
        );
        assert_matches!(
            ExponentialReconnectionPolicy::new(Duration::from_secs(2), Duration::from_secs(1)),
            Err(InvalidArgument(_))
        );
        assert!(
            ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(1))
                .is_ok()
        );
    }

    #[test]
    fn constant_schedule() {
        let mut schedule = ConstantReconnectionPolicy::new(Duration::from_millis(250)).new_schedule();
        for _ in 0..3 {
            assert_eq!(schedule.get_delay(), Duration::from_millis(250));
        }
    }
}
