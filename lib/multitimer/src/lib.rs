// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A timer multiplexer.
//!
//! `Multitimer` lets a single driver task manage several independent
//! logical deadlines even though a `TaskBody::tick` can only report one
//! `TaskStatus` (one deadline) per return. The independent timers
//! correspond to variants of an enum type, to make it easy to tell them
//! apart.
//!
//! The expected usage model, inside a driver's `tick`:
//!
//! - Create an `enum` type naming your timers, and derive the `Enum` trait
//!   (from the `enum_map` crate) for it.
//! - Create a `Multitimer<YourEnumType>` once, at construction.
//! - Call [`Multitimer::set_timer`]/[`Multitimer::clear_timer`] as your
//!   state machine schedules and cancels deadlines.
//! - At the top of every `tick`, call [`Multitimer::poll`] with the
//!   current platform tick; then drain [`Multitimer::iter_fired`] to see
//!   which logical timers just elapsed.
//! - Fold [`Multitimer::next_deadline`] into whatever `TaskStatus` the
//!   rest of `tick` would otherwise return, via `kern::sched::Scheduler::prioritise`
//!   (or `RunLater` directly if it's the only deadline the task has).
//!
//! Unlike the scheduler's own per-task deadline, ticks here are plain
//! `u32`s compared the same wrap-aware way `kern::time::Timestamp` does
//! (so a multitimer can track windows up to ~24 days without confusing a
//! wrapped clock for an elapsed one), duplicated locally rather than
//! pulling in all of `kern` for one comparison.

#![cfg_attr(not(test), no_std)]

use enum_map::{EnumArray, EnumMap};

fn is_before(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

fn has_elapsed(deadline: u32, now: u32) -> bool {
    !is_before(now, deadline)
}

pub struct Multitimer<E: EnumArray<Timer>> {
    timers: EnumMap<E, Timer>,
}

impl<E: EnumArray<Timer> + Copy> Multitimer<E> {
    pub fn new() -> Self {
        Self {
            timers: EnumMap::default(),
        }
    }

    /// Sets the timer chosen by `which` to go off at tick `deadline`, with
    /// optional auto-repeat behavior. Replaces any prior setting.
    pub fn set_timer(&mut self, which: E, deadline: u32, repeat: Option<Repeat>) {
        let fired_but_not_observed = self.timers[which].fired_but_not_observed;
        self.timers[which] = Timer {
            deadline: Some((deadline, repeat)),
            fired_but_not_observed,
        };
    }

    pub fn get_timer(&self, which: E) -> Option<(u32, Option<Repeat>)> {
        self.timers[which].deadline
    }

    pub fn clear_timer(&mut self, which: E) -> bool {
        self.timers[which].deadline.take().is_some()
    }

    /// Advances every timer's state to `now`: any timer whose deadline has
    /// elapsed is marked fired (observable via `iter_fired`) and, if it
    /// repeats, rearmed for its next occurrence.
    pub fn poll(&mut self, now: u32) {
        for timer in self.timers.values_mut() {
            if let Some((d, r)) = timer.deadline {
                if has_elapsed(d, now) {
                    timer.deadline = match r {
                        Some(Repeat::AfterWake(period)) => {
                            Some((now.wrapping_add(period), r))
                        }
                        Some(Repeat::AfterDeadline(period)) => {
                            Some((d.wrapping_add(period), r))
                        }
                        None => None,
                    };
                    timer.fired_but_not_observed = true;
                }
            }
        }
    }

    /// Returns an iterator over every timer that has fired since the last
    /// time it was observed through this function. A timer may have fired
    /// more than once between polls; that information is lost.
    ///
    /// Timers appear in declaration order. If the iterator is dropped
    /// before it's exhausted, any timer it didn't reach stays flagged and
    /// is reported again next call.
    pub fn iter_fired(&mut self) -> impl Iterator<Item = E> + '_ {
        self.timers.iter_mut().filter_map(move |(e, timer)| {
            if core::mem::replace(&mut timer.fired_but_not_observed, false) {
                Some(e)
            } else {
                None
            }
        })
    }

    /// The earliest deadline across every still-armed timer, for a `tick`
    /// to fold into the `TaskStatus` it returns.
    pub fn next_deadline(&self) -> Option<u32> {
        self.timers
            .values()
            .filter_map(|t| t.deadline)
            .map(|(d, _)| d)
            .fold(None, |acc, d| match acc {
                None => Some(d),
                Some(a) => Some(if is_before(d, a) { d } else { a }),
            })
    }
}

impl<E: EnumArray<Timer> + Copy> Default for Multitimer<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Default)]
pub struct Timer {
    deadline: Option<(u32, Option<Repeat>)>,
    fired_but_not_observed: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Repeat {
    /// Re-arm `period` ticks after the tick at which the timer was polled
    /// and found to have fired (drifts with how promptly it's observed).
    AfterWake(u32),
    /// Re-arm exactly `period` ticks after the deadline that just fired
    /// (does not drift, but can fire a burst of "already elapsed" events
    /// if polling falls behind by more than one period).
    AfterDeadline(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_map::Enum;
    use std::vec::Vec;

    #[derive(Copy, Clone, Debug, Eq, PartialEq, Enum)]
    enum Timers {
        A,
        B,
    }

    #[test]
    fn nothing_fired_initially() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        assert!(uut.iter_fired().next().is_none());
        assert_eq!(uut.next_deadline(), None);
    }

    #[test]
    fn earliest_timer_drives_next_deadline() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 1234, None);
        uut.set_timer(Timers::B, 12, None);
        assert_eq!(uut.next_deadline(), Some(12));
    }

    #[test]
    fn clear_timer_removes_it_from_consideration() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 1234, None);
        uut.set_timer(Timers::B, 12, None);
        assert!(uut.clear_timer(Timers::B));
        assert_eq!(uut.next_deadline(), Some(1234));
        assert!(!uut.clear_timer(Timers::B), "already cleared");
    }

    #[test]
    fn basic_firing_behavior() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 1234, None);
        uut.set_timer(Timers::B, 12, None);

        uut.poll(0);
        assert_eq!(uut.iter_fired().next(), None);

        uut.poll(11);
        assert_eq!(uut.iter_fired().next(), None);

        uut.poll(100);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::B]);

        uut.poll(10_000);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::A]);

        uut.poll(10_000_000);
        assert_eq!(uut.iter_fired().next(), None);
    }

    #[test]
    fn repeat_after_deadline_does_not_drift() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::A, 1234, Some(Repeat::AfterDeadline(1000)));

        uut.poll(1300);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::A]);
        assert_eq!(
            uut.get_timer(Timers::A),
            Some((2234, Some(Repeat::AfterDeadline(1000))))
        );
    }

    #[test]
    fn repeat_after_wake_measures_from_observation() {
        let mut uut: Multitimer<Timers> = Multitimer::new();
        uut.set_timer(Timers::B, 12, Some(Repeat::AfterWake(2000)));

        uut.poll(100);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Timers::B]);
        assert_eq!(
            uut.get_timer(Timers::B),
            Some((2100, Some(Repeat::AfterWake(2000))))
        );
    }
}
