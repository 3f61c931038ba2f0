// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The periodic timer back-end driver task (component G, timer variant).
//!
//! Every other driver task in this workspace hands its response back
//! through a [`kern::stream::Stream`]; a timer has no payload to hand
//! back, only the fact that a deadline arrived, so it is the one driver
//! here that talks to [`kern::event::EventTable`] directly instead of
//! going through a device's `rx` stream. `Select` is choosing which of
//! `NCH` independent channels to arm; unlike I2C/SPI there is no shared
//! bus to hold, so channels complete independently rather than in strict
//! Issue/Release turns.

#![no_std]

use abi::TaskStatus;
use drv_timer_api::{Device, EXPIRED_BIT};
use kern::kernel::Kernel;
use kern::platform::Platform;
use kern::task::{TaskBody, TaskIdx};
use ringbuf::{ringbuf, ringbuf_entry};
use static_cell::StaticCell;

/// The capability a hardware back end offers the controller: program a
/// channel's deadline, and report which channel (if any) has expired
/// since the last call.
pub trait TimerBackend {
    fn arm(&mut self, channel: u8, ticks: u32);
    fn poll_fired(&mut self) -> Option<u8>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Armed { channel: u8, ticks: u32 },
    Fired { channel: u8 },
}

ringbuf!(Trace, 32, Trace::None);

pub struct TimerController<
    B: TimerBackend,
    P: Platform,
    const NT: usize,
    const NE: usize,
    const NSEG: usize,
    const SEG: usize,
    const NCH: usize,
> {
    kernel: &'static StaticCell<Kernel<NT, NE, NSEG, SEG>>,
    platform: &'static P,
    backend: B,
    devices: [Device; NCH],
}

impl<
        B: TimerBackend,
        P: Platform,
        const NT: usize,
        const NE: usize,
        const NSEG: usize,
        const SEG: usize,
        const NCH: usize,
    > TimerController<B, P, NT, NE, NSEG, SEG, NCH>
{
    /// Builds a controller with `NCH` channels bound to event slots
    /// `0..NCH` of the kernel's event table, each owned by this task.
    pub fn new(
        kernel: &'static StaticCell<Kernel<NT, NE, NSEG, SEG>>,
        platform: &'static P,
        backend: B,
        self_task: TaskIdx,
    ) -> Self {
        assert!(NCH <= NE, "not enough event slots for this many channels");
        let mut k = kernel.borrow_mut();
        let devices = core::array::from_fn(|i| {
            let event = k.events.event_at(i);
            let device = Device::new(i as u8, event);
            device.bind_consumer(&mut k.events, self_task);
            device
        });
        drop(k);
        Self {
            kernel,
            platform,
            backend,
            devices,
        }
    }

    pub fn device_mut(&mut self, channel: usize) -> &mut Device {
        &mut self.devices[channel]
    }
}

impl<
        B: TimerBackend,
        P: Platform,
        const NT: usize,
        const NE: usize,
        const NSEG: usize,
        const SEG: usize,
        const NCH: usize,
    > TaskBody for TimerController<B, P, NT, NE, NSEG, SEG, NCH>
{
    fn tick(&mut self) -> TaskStatus {
        let mut k = self.kernel.borrow_mut();

        for device in self.devices.iter_mut() {
            if let Some(ticks) = device.take_request() {
                self.backend.arm(device.channel(), ticks);
                k.scheduler.stay_awake();
                ringbuf_entry!(Trace::Armed {
                    channel: device.channel(),
                    ticks,
                });
            }
        }

        while let Some(channel) = self.backend.poll_fired() {
            if let Some(device) = self
                .devices
                .iter()
                .find(|device| device.channel() == channel)
            {
                k.events.set_bits(self.platform, device.event(), EXPIRED_BIT);
                k.scheduler.can_sleep(self.platform);
                ringbuf_entry!(Trace::Fired { channel });
            }
        }

        TaskStatus::RunLater(1)
    }

    fn name(&self) -> Option<&'static str> {
        Some("timer-driver")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern::platform::sim::SimPlatform;
    use kern::sched::Scheduler;
    use kern::task::TaskRecord;
    use std::boxed::Box;

    struct Idle;
    impl TaskBody for Idle {
        fn tick(&mut self) -> TaskStatus {
            TaskStatus::Suspend
        }
    }

    /// Counts armed channels down by one tick per `poll_fired` call, the
    /// way `SimPlatform` advances a simulated clock by hand instead of
    /// waiting on real time.
    struct SimTimerBackend {
        remaining: [Option<u32>; 2],
    }

    impl SimTimerBackend {
        fn new() -> Self {
            Self {
                remaining: [None; 2],
            }
        }
    }

    impl TimerBackend for SimTimerBackend {
        fn arm(&mut self, channel: u8, ticks: u32) {
            self.remaining[channel as usize] = Some(ticks);
        }

        fn poll_fired(&mut self) -> Option<u8> {
            for (i, slot) in self.remaining.iter_mut().enumerate() {
                if let Some(ticks) = slot {
                    if *ticks == 0 {
                        *slot = None;
                        return Some(i as u8);
                    }
                    *ticks -= 1;
                }
            }
            None
        }
    }

    type Ctl = TimerController<SimTimerBackend, SimPlatform, 2, 2, 4, 16, 2>;

    fn new_kernel() -> &'static StaticCell<Kernel<2, 2, 4, 16>> {
        let a: &'static mut dyn TaskBody = Box::leak(Box::new(Idle));
        let b: &'static mut dyn TaskBody = Box::leak(Box::new(Idle));
        let sched = Scheduler::new([TaskRecord::suspended(a), TaskRecord::suspended(b)]);
        Box::leak(Box::new(StaticCell::new(Kernel::new(sched))))
    }

    fn new_controller(kernel: &'static StaticCell<Kernel<2, 2, 4, 16>>) -> Ctl {
        let platform: &'static SimPlatform = Box::leak(Box::new(SimPlatform::new()));
        let self_task = kernel.borrow_mut().scheduler.task_at(1);
        TimerController::new(kernel, platform, SimTimerBackend::new(), self_task)
    }

    #[test]
    fn an_armed_channel_holds_the_scheduler_awake_until_it_fires() {
        let kernel = new_kernel();
        let mut ctl = new_controller(kernel);
        assert!(ctl.device_mut(0).arm(1));

        assert_eq!(ctl.tick(), TaskStatus::RunLater(1));
        assert_eq!(
            kernel.borrow_mut().scheduler.stay_awake_count(),
            1,
            "arming a channel must call stay_awake()"
        );

        assert_eq!(ctl.tick(), TaskStatus::RunLater(1));
        assert_eq!(
            kernel.borrow_mut().scheduler.stay_awake_count(),
            0,
            "the channel firing must balance it with can_sleep()"
        );
    }

    #[test]
    fn second_arm_on_the_same_channel_is_refused_until_release() {
        let kernel = new_kernel();
        let mut ctl = new_controller(kernel);
        assert!(ctl.device_mut(0).arm(3));
        assert!(!ctl.device_mut(0).arm(3));
    }

    #[test]
    fn channel_event_fires_after_its_deadline() {
        let kernel = new_kernel();
        let mut ctl = new_controller(kernel);
        assert!(ctl.device_mut(0).arm(2));

        assert_eq!(ctl.tick(), TaskStatus::RunLater(1));
        {
            let mut k = kernel.borrow_mut();
            assert!(!ctl.device_mut(0).poll(ctl.platform, &mut k.events));
        }

        assert_eq!(ctl.tick(), TaskStatus::RunLater(1));
        assert_eq!(ctl.tick(), TaskStatus::RunLater(1));
        {
            let mut k = kernel.borrow_mut();
            assert!(ctl.device_mut(0).poll(ctl.platform, &mut k.events));
        }
    }

    #[test]
    fn independent_channels_do_not_interfere() {
        let kernel = new_kernel();
        let mut ctl = new_controller(kernel);
        assert!(ctl.device_mut(0).arm(0));
        assert!(ctl.device_mut(1).arm(5));

        assert_eq!(ctl.tick(), TaskStatus::RunLater(1));
        let mut k = kernel.borrow_mut();
        assert!(ctl.device_mut(0).poll(ctl.platform, &mut k.events));
        assert!(!ctl.device_mut(1).poll(ctl.platform, &mut k.events));
    }
}
