// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bundles the pool, event table and scheduler into one context that
//! gets passed by reference through an application's tasks, replacing
//! the free-floating globals an interrupt-driven kernel would otherwise
//! need.

use crate::event::EventTable;
use crate::pool::Pool;
use crate::sched::Scheduler;
use crate::platform::Platform;

/// `NT` tasks, `NE` event words, `NSEG` pool segments of `SEG` bytes
/// each. A driver or application picks these sizes once, at the call
/// site that builds its `Kernel`; nothing inside `kern` hardcodes them.
pub struct Kernel<const NT: usize, const NE: usize, const NSEG: usize, const SEG: usize = 64> {
    pub scheduler: Scheduler<NT>,
    pub events: EventTable<NE>,
    pub pool: Pool<NSEG, SEG>,
}

impl<const NT: usize, const NE: usize, const NSEG: usize, const SEG: usize>
    Kernel<NT, NE, NSEG, SEG>
{
    pub fn new(scheduler: Scheduler<NT>) -> Self {
        Self {
            scheduler,
            events: EventTable::new(),
            pool: Pool::new(),
        }
    }

    /// Runs one dispatch step and returns the number of ticks the
    /// platform may idle for.
    pub fn step<P: Platform>(&mut self, platform: &P) -> u32 {
        self.scheduler.step(platform, &mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimPlatform;
    use crate::task::{TaskBody, TaskRecord};
    use abi::TaskStatus;
    use std::boxed::Box;

    struct OneShot;
    impl TaskBody for OneShot {
        fn tick(&mut self) -> TaskStatus {
            TaskStatus::Suspend
        }
    }

    #[test]
    fn kernel_bundles_step_correctly() {
        let body: &'static mut dyn TaskBody = Box::leak(Box::new(OneShot));
        let sched: Scheduler<1> = Scheduler::new([TaskRecord::suspended(body)]);
        let mut kernel: Kernel<1, 2, 4, 16> = Kernel::new(sched);
        let platform = SimPlatform::new();

        kernel.scheduler.task_start(kernel.scheduler.task_at(0));
        let idle = kernel.step(&platform);
        assert_eq!(idle, 0);
        let idle = kernel.step(&platform);
        assert_eq!(idle, u32::MAX);
    }
}
