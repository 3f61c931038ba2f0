// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-facing API for a periodic timer channel (component G, timer
//! variant).
//!
//! Unlike I2C/SPI/flash, a timer channel has no byte stream to read a
//! request header from or write a response into: Select just picks a
//! channel, Issue programs a deadline, and Release is implicit in
//! reporting completion, since there is no payload to hand back. The
//! completion itself still goes through the shared
//! [`kern::event::EventTable`], exactly the way every other driver's
//! completion event does — this is the part of the contract that carries
//! over unchanged even when the stream plumbing drops out.

#![no_std]

use kern::event::{EventIdx, EventTable};
use kern::platform::Platform;
use kern::task::TaskIdx;

/// The bit [`Device::poll`] looks for in the channel's event word.
pub const EXPIRED_BIT: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceState {
    Idle,
    Armed,
}

/// One timer channel: a deadline request slot plus the event its
/// controller signals completion on.
pub struct Device {
    channel: u8,
    event: EventIdx,
    state: DeviceState,
    requested: Option<u32>,
}

impl Device {
    pub fn new(channel: u8, event: EventIdx) -> Self {
        Self {
            channel,
            event,
            state: DeviceState::Idle,
            requested: None,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn event(&self) -> EventIdx {
        self.event
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn bind_consumer<const NE: usize>(&self, events: &mut EventTable<NE>, client: TaskIdx) {
        events.bind_consumer(self.event, client);
    }

    /// Issue: requests a one-shot deadline `ticks` ticks from now. Fails
    /// without side effects if this channel already has an arm
    /// outstanding; the controller's tick picks the request up and
    /// programs the backend.
    pub fn arm(&mut self, ticks: u32) -> bool {
        if self.state != DeviceState::Idle {
            return false;
        }
        self.requested = Some(ticks);
        self.state = DeviceState::Armed;
        true
    }

    /// Drains a pending arm request. Only the controller task that owns
    /// this channel's hardware should call this.
    pub fn take_request(&mut self) -> Option<u32> {
        self.requested.take()
    }

    /// PollComplete and Release in one step: if the channel's event bit
    /// is set, clears it, frees the channel for the next `arm`, and
    /// reports `true`.
    pub fn poll<const NE: usize, P: Platform>(
        &mut self,
        platform: &P,
        events: &mut EventTable<NE>,
    ) -> bool {
        if self.state != DeviceState::Armed {
            return false;
        }
        let prior = events.clear_bits(platform, self.event, EXPIRED_BIT);
        if prior & EXPIRED_BIT != 0 {
            self.state = DeviceState::Idle;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern::platform::sim::SimPlatform;

    #[test]
    fn arm_is_refused_while_already_armed() {
        let events: EventTable<1> = EventTable::new();
        let mut dev = Device::new(0, events.event_at(0));
        assert!(dev.arm(10));
        assert!(!dev.arm(20));
        assert_eq!(dev.state(), DeviceState::Armed);
    }

    #[test]
    fn poll_clears_the_expired_bit_and_releases_the_channel() {
        let p = SimPlatform::new();
        let mut events: EventTable<1> = EventTable::new();
        let mut dev = Device::new(0, events.event_at(0));
        assert!(dev.arm(5));
        assert_eq!(dev.take_request(), Some(5));
        assert!(!dev.poll(&p, &mut events), "nothing fired yet");

        events.set_bits(&p, dev.event(), EXPIRED_BIT);
        assert!(dev.poll(&p, &mut events));
        assert_eq!(dev.state(), DeviceState::Idle);
        assert!(!dev.poll(&p, &mut events), "already released");
    }
}
