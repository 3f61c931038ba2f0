// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrap-aware tick timestamps.
//!
//! The platform's tick counter is a free-running `u32`; at a 1 kHz tick
//! rate it wraps roughly every 49 days, and the specification guarantees
//! correct ordering only within a window of about half that range (24
//! days measured from "now"). [`Timestamp`] bakes that into its ordering
//! so the scheduled/background queues don't need to special-case the
//! wraparound themselves.

use core::ops::Add;

/// A point in time, measured in platform ticks since an arbitrary epoch.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Timestamp(pub u32);

impl Timestamp {
    pub fn new(ticks: u32) -> Self {
        Self(ticks)
    }

    pub fn ticks(self) -> u32 {
        self.0
    }

    /// Signed distance from `self` to `other`, in ticks. Positive means
    /// `other` is later than `self`. Correct as long as the true distance
    /// between the two timestamps is less than `i32::MAX` ticks, which the
    /// half-open ordering window guarantees.
    pub fn signed_diff(self, other: Timestamp) -> i32 {
        other.0.wrapping_sub(self.0) as i32
    }

    /// True if `self` is strictly before `other`, honoring wraparound.
    pub fn is_before(self, other: Timestamp) -> bool {
        self.signed_diff(other) > 0
    }

    /// True if `self` has already arrived relative to `now` (`self <=
    /// now`), honoring wraparound.
    pub fn has_elapsed(self, now: Timestamp) -> bool {
        !now.is_before(self)
    }

    pub fn saturating_delay_from(self, now: Timestamp) -> u32 {
        let diff = now.signed_diff(self);
        if diff <= 0 {
            0
        } else {
            diff as u32
        }
    }
}

impl Add<u32> for Timestamp {
    type Output = Timestamp;

    fn add(self, delay: u32) -> Timestamp {
        Timestamp(self.0.wrapping_add(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_without_wraparound() {
        let a = Timestamp::new(10);
        let b = Timestamp::new(20);
        assert!(a.is_before(b));
        assert!(!b.is_before(a));
        assert!(a.has_elapsed(b));
        assert!(!b.has_elapsed(a));
    }

    #[test]
    fn ordering_across_wraparound() {
        let a = Timestamp::new(u32::MAX - 5);
        let b = a + 10;
        assert!(a.is_before(b));
        assert_eq!(b.0, 4);
    }

    #[test]
    fn saturating_delay_never_goes_negative() {
        let now = Timestamp::new(100);
        let past = Timestamp::new(50);
        assert_eq!(past.saturating_delay_from(now), 0);
        let future = Timestamp::new(150);
        assert_eq!(future.saturating_delay_from(now), 50);
    }
}
