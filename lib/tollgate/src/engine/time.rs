// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments and durations for expiry bookkeeping.

use core::ops::Add;
use core::time::Duration;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A moment in time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Moment {
    inner: Instant,
}

impl Moment {
    /// Compute the delta between `self - earlier` and return it as
    /// milliseconds.
    ///
    /// Saturates to zero if `earlier` is actually later than `self`.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.duration_since(earlier.inner);
        delta.as_secs() * MILLIS + u64::from(delta.subsec_millis())
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self { inner: self.inner + rhs }
    }
}

impl Default for Moment {
    fn default() -> Self {
        Self::now()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delta_millis() {
        let t0 = Moment::now();
        let t1 = t0 + Duration::from_millis(2_500);
        assert_eq!(t1.delta_as_millis(t0), 2_500);
        // Negative deltas saturate rather than panic.
        assert_eq!(t0.delta_as_millis(t1), 0);
    }
}
