//! One-shot relative timers driving the key press cadence.
//!
//! Expiry is observed, not delivered: the key state reader asks its timer
//! whether the deadline has passed before answering each scan. A deadline
//! armed right after an expiry was observed counts from the expired deadline
//! rather than from the moment of the scan, so slow polling does not stretch
//! the key press timeline.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer could not be armed")]
    Unavailable,
}

pub type Result<T, E = TimerError> = core::result::Result<T, E>;

pub trait Timer {
    /// Arms a one-shot deadline `after` from now, replacing a pending one.
    fn arm(&mut self, after: Duration) -> Result<()>;
    fn cancel(&mut self);
    /// Returns true, once, when the pending deadline has passed.
    fn expired(&mut self) -> bool;
}

#[derive(Debug, Default)]
struct Clock {
    now: Duration,
    deadline: Option<Duration>,
    fired: Option<Duration>,
    broken: bool,
}

/// Simulated time, advanced explicitly. Clones share one clock so a driver
/// can hold on to the timer it handed to a reader.
#[derive(Debug, Clone, Default)]
pub struct ManualTimer {
    clock: Rc<RefCell<Clock>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A timer whose `arm` always fails.
    pub fn broken() -> Self {
        let timer = Self::default();
        timer.clock.borrow_mut().broken = true;
        timer
    }

    pub fn advance(&self, by: Duration) {
        self.clock.borrow_mut().now += by;
    }

    pub fn now(&self) -> Duration {
        self.clock.borrow().now
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.clock.borrow().deadline
    }
}

impl Timer for ManualTimer {
    fn arm(&mut self, after: Duration) -> Result<()> {
        let mut clock = self.clock.borrow_mut();
        if clock.broken {
            return Err(TimerError::Unavailable);
        }
        let base = clock.fired.take().unwrap_or(clock.now);
        clock.deadline = Some(base + after);
        Ok(())
    }

    fn cancel(&mut self) {
        let mut clock = self.clock.borrow_mut();
        clock.deadline = None;
        clock.fired = None;
    }

    fn expired(&mut self) -> bool {
        let mut clock = self.clock.borrow_mut();
        match clock.deadline {
            Some(deadline) if deadline <= clock.now => {
                clock.deadline = None;
                clock.fired = Some(deadline);
                true
            }
            _ => {
                clock.fired = None;
                false
            }
        }
    }
}

/// Wall clock timer.
#[derive(Debug, Default)]
pub struct InstantTimer {
    deadline: Option<Instant>,
    fired: Option<Instant>,
}

impl Timer for InstantTimer {
    fn arm(&mut self, after: Duration) -> Result<()> {
        let base = self.fired.take().unwrap_or_else(Instant::now);
        self.deadline = Some(base + after);
        Ok(())
    }

    fn cancel(&mut self) {
        self.deadline = None;
        self.fired = None;
    }

    fn expired(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => {
                self.deadline = None;
                self.fired = Some(deadline);
                true
            }
            _ => {
                self.fired = None;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn fires_once() -> Result<()> {
        let mut timer = ManualTimer::new();
        timer.arm(20 * MS)?;
        timer.advance(19 * MS);
        assert!(!timer.expired());
        timer.advance(MS);
        assert!(timer.expired());
        assert!(!timer.expired());
        assert_eq!(timer.deadline(), None);
        Ok(())
    }

    #[test]
    fn rearm_counts_from_expired_deadline() -> Result<()> {
        let mut timer = ManualTimer::new();
        timer.arm(20 * MS)?;
        timer.advance(35 * MS);
        assert!(timer.expired());
        timer.arm(20 * MS)?;
        assert_eq!(timer.deadline(), Some(40 * MS));

        assert!(!timer.expired());
        timer.arm(20 * MS)?;
        assert_eq!(timer.deadline(), Some(55 * MS));
        Ok(())
    }

    #[test]
    fn clones_share_a_clock() -> Result<()> {
        let driver = ManualTimer::new();
        let mut reader = driver.clone();
        reader.arm(5 * MS)?;
        driver.advance(5 * MS);
        assert!(reader.expired());
        Ok(())
    }

    #[test]
    fn cancel_and_broken() -> Result<()> {
        let mut timer = ManualTimer::new();
        timer.arm(MS)?;
        timer.cancel();
        timer.advance(10 * MS);
        assert!(!timer.expired());

        let mut broken = ManualTimer::broken();
        assert_eq!(broken.arm(MS), Err(TimerError::Unavailable));
        Ok(())
    }

    #[test]
    fn instant_timer() -> Result<()> {
        let mut timer = InstantTimer::default();
        timer.arm(Duration::ZERO)?;
        assert!(timer.expired());
        timer.arm(Duration::from_secs(3600))?;
        assert!(!timer.expired());
        timer.cancel();
        assert!(!timer.expired());
        Ok(())
    }
}
