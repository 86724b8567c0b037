// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::{
    ops::{Add, AddAssign},
    sync::OnceLock,
    time::Instant,
};

/// A monotonic timestamp with microsecond resolution.
///
/// Values compare by age, not by wall clock. Small offsets are routinely
/// added to a shared sample to impose an order on events that happened
/// within the same microsecond, so a `Time` is best read as an ordering
/// key that happens to be measured in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(u64);

impl Time {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_micros(us: u64) -> Self {
        Self(us)
    }

    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Signed microsecond distance from `earlier` to `self`.
    #[must_use]
    pub fn delta(self, earlier: Self) -> i64 {
        let a = i64::try_from(self.0).unwrap_or(i64::MAX);
        let b = i64::try_from(earlier.0).unwrap_or(i64::MAX);
        a.saturating_sub(b)
    }

    /// Shift by a signed number of microseconds, saturating at both ends.
    #[must_use]
    pub fn offset(self, delta: i64) -> Self {
        Self(self.0.saturating_add_signed(delta))
    }
}

impl Add<u64> for Time {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Self(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for Time {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

/// A source of [`Time`] samples.
pub trait Clock {
    fn now(&self) -> Time;
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// A [`Clock`] backed by the process-wide monotonic clock.
///
/// All instances share one epoch, so timestamps taken through different
/// `StdClock` values are mutually comparable.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdClock {}

impl Clock for StdClock {
    fn now(&self) -> Time {
        let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
        Time::from_micros(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
    }
}
