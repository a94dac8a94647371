//! Wall-clock abstraction shared by every tier that tracks entry age.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to. Used to exercise TTL boundaries
/// without sleeping.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Move the clock forward.
  pub fn advance(&self, by: Duration) {
    let delta = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    *self.now.lock() += delta;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock()
  }
}

/// Age of a timestamp relative to `now`. Timestamps in the future count as age zero.
pub fn elapsed_since(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
  (now - then).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_advances() {
    let clock = ManualClock::default();
    let start = clock.now();
    clock.advance(Duration::from_secs(90));
    assert_eq!(elapsed_since(clock.now(), start), Duration::from_secs(90));
  }

  #[test]
  fn test_future_timestamp_has_zero_age() {
    let now = Utc::now();
    let later = now + chrono::Duration::seconds(10);
    assert_eq!(elapsed_since(now, later), Duration::ZERO);
  }
}
