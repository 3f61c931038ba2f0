// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The 32-bit event-flag subsystem (component C).
//!
//! Every driver back end communicates completion to its consumer through
//! one of these: a 32-bit bitmask that an ISR sets with
//! [`EventTable::set_bits`] and a task clears (and reads) with
//! [`EventTable::get_bits`]/[`EventTable::clear_bits`]. The table also
//! tracks, per event, which task is bound to it, and maintains a FIFO of
//! events that have gone from all-clear to having at least one bit set,
//! so the scheduler can drain "something happened, go wake its owner" in
//! submission order without scanning every event on every tick.
//!
//! The mutation path (`set_bits`/`clear_bits`/`reset_bits`) must be safe
//! to call from interrupt context, so it takes the platform's critical
//! section rather than assuming it's already held.

use crate::platform::{critical, Platform};
use crate::task::TaskIdx;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EventIdx(u16);

impl EventIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct EventSlot {
    bits: u32,
    consumer: Option<TaskIdx>,
    queued: bool,
    next: Option<u16>,
}

/// A fixed population of `NE` event-flag words, each independently
/// readable/writable and each able to carry one bound consumer task.
pub struct EventTable<const NE: usize> {
    slots: [EventSlot; NE],
    pending_head: Option<u16>,
    pending_tail: Option<u16>,
}

impl<const NE: usize> EventTable<NE> {
    pub fn new() -> Self {
        const EMPTY: EventSlot = EventSlot {
            bits: 0,
            consumer: None,
            queued: false,
            next: None,
        };
        Self {
            slots: [EMPTY; NE],
            pending_head: None,
            pending_tail: None,
        }
    }

    /// Names event slot `i` so a driver can bind and signal it. Analogous
    /// to `Scheduler::task_at`.
    pub fn event_at(&self, i: usize) -> EventIdx {
        assert!(i < NE);
        EventIdx(i as u16)
    }

    pub fn bind_consumer(&mut self, idx: EventIdx, task: TaskIdx) {
        self.slots[idx.index()].consumer = Some(task);
    }

    pub fn get_bits(&self, idx: EventIdx) -> u32 {
        self.slots[idx.index()].bits
    }

    /// Sets `mask` into the event's bits and returns the value *before*
    /// the set, so a caller can tell whether this transitioned the event
    /// from all-clear (and hence needs to enqueue it for its consumer).
    /// Safe to call from an ISR.
    pub fn set_bits<P: Platform>(
        &mut self,
        platform: &P,
        idx: EventIdx,
        mask: u32,
    ) -> u32 {
        critical(platform, || {
            let slot = &mut self.slots[idx.index()];
            let prior = slot.bits;
            slot.bits |= mask;
            self.enqueue_if_pending(idx);
            prior
        })
    }

    /// Clears `mask` out of the event's bits. Per the spec, set and clear
    /// both enqueue the event's consumer (if any, and if it isn't already
    /// queued) — an event that transitioned by being cleared still needs
    /// to be observed on the next drain, not just one that was set.
    pub fn clear_bits<P: Platform>(
        &mut self,
        platform: &P,
        idx: EventIdx,
        mask: u32,
    ) -> u32 {
        critical(platform, || {
            let slot = &mut self.slots[idx.index()];
            let prior = slot.bits;
            slot.bits &= !mask;
            self.enqueue_if_pending(idx);
            prior
        })
    }

    pub fn reset_bits<P: Platform>(&mut self, platform: &P, idx: EventIdx) -> u32 {
        critical(platform, || {
            let slot = &mut self.slots[idx.index()];
            let prior = slot.bits;
            slot.bits = 0;
            prior
        })
    }

    /// Appends the event to the pending queue if it isn't already sitting
    /// in it. Called after every bit mutation (set *and* clear), matching
    /// the spec's "set and clear both ... if not already queued, append."
    fn enqueue_if_pending(&mut self, idx: EventIdx) {
        if self.slots[idx.index()].queued {
            return;
        }
        self.slots[idx.index()].queued = true;
        let i = idx.0;
        self.slots[idx.index()].next = None;
        match self.pending_tail {
            Some(tail) => self.slots[tail as usize].next = Some(i),
            None => self.pending_head = Some(i),
        }
        self.pending_tail = Some(i);
    }

    /// Pops the oldest event that transitioned to non-zero bits since the
    /// last time it was popped, returning the task bound to it (if any).
    /// Events queue in the order they first went non-zero; an event
    /// already queued does not requeue on a later `set_bits`.
    pub fn get_next_consumer<P: Platform>(&mut self, platform: &P) -> Option<TaskIdx> {
        critical(platform, || {
            let head = self.pending_head?;
            let slot = &mut self.slots[head as usize];
            slot.queued = false;
            self.pending_head = slot.next;
            if self.pending_head.is_none() {
                self.pending_tail = None;
            }
            slot.consumer
        })
    }
}

impl<const NE: usize> Default for EventTable<NE> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimPlatform;

    #[test]
    fn set_then_get_then_clear_round_trips() {
        let p = SimPlatform::new();
        let mut events: EventTable<4> = EventTable::new();
        let idx = EventIdx(0);
        events.set_bits(&p, idx, 0b101);
        assert_eq!(events.get_bits(idx), 0b101);
        events.clear_bits(&p, idx, 0b001);
        assert_eq!(events.get_bits(idx), 0b100);
        events.reset_bits(&p, idx);
        assert_eq!(events.get_bits(idx), 0);
    }

    #[test]
    fn consumers_pop_in_first_set_order() {
        let p = SimPlatform::new();
        let mut events: EventTable<4> = EventTable::new();
        let e1 = EventIdx(0);
        let e2 = EventIdx(1);
        let e3 = EventIdx(2);
        events.bind_consumer(e1, TaskIdx(1));
        events.bind_consumer(e2, TaskIdx(2));
        events.bind_consumer(e3, TaskIdx(3));

        events.set_bits(&p, e2, 1);
        events.set_bits(&p, e1, 1);
        events.set_bits(&p, e3, 1);

        assert_eq!(events.get_next_consumer(&p), Some(TaskIdx(2)));
        assert_eq!(events.get_next_consumer(&p), Some(TaskIdx(1)));
        assert_eq!(events.get_next_consumer(&p), Some(TaskIdx(3)));
        assert_eq!(events.get_next_consumer(&p), None);
    }

    #[test]
    fn clearing_bits_queues_the_consumer_same_as_setting_them() {
        let p = SimPlatform::new();
        let mut events: EventTable<4> = EventTable::new();
        let e1 = EventIdx(0);
        events.bind_consumer(e1, TaskIdx(9));
        events.set_bits(&p, e1, 0b1);
        assert_eq!(events.get_next_consumer(&p), Some(TaskIdx(9)));

        events.clear_bits(&p, e1, 0b1);
        assert_eq!(
            events.get_next_consumer(&p),
            Some(TaskIdx(9)),
            "a clear must queue the consumer just like a set does"
        );
    }

    #[test]
    fn setting_an_already_pending_event_does_not_requeue_it() {
        let p = SimPlatform::new();
        let mut events: EventTable<4> = EventTable::new();
        let e1 = EventIdx(0);
        events.bind_consumer(e1, TaskIdx(9));
        events.set_bits(&p, e1, 0b01);
        events.set_bits(&p, e1, 0b10);
        assert_eq!(events.get_next_consumer(&p), Some(TaskIdx(9)));
        assert_eq!(events.get_next_consumer(&p), None);
    }
}
