// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cooperative scheduler (component D).
//!
//! Every task sits in exactly one of three queues — ready, scheduled, or
//! background — or is suspended (in none of them), or is the one task
//! currently ticking. [`Scheduler::step`] is the entire dispatch loop:
//! drain anything an event flag woke up, promote scheduled/background
//! tasks whose time has come, run one ready task, and otherwise report
//! how long the platform is free to idle.
//!
//! The three queues share one `next` slot per task record for the same
//! reason the memory pool shares one `next` slot per segment: a task can
//! only be linked into one list at a time, so there's only one link field
//! to get wrong.

use crate::event::EventTable;
use crate::platform::Platform;
use crate::task::{TaskIdx, TaskRecord, TaskState};
use crate::time::Timestamp;
use abi::TaskStatus;

const MAX_MONITORS: usize = 4;

/// Observes (and may override) the status a task's `tick()` returned,
/// before the scheduler acts on it. Registered monitors run in reverse
/// registration order — the most recently added sees the raw status
/// first and hands its answer to the one before it.
pub trait LifecycleMonitor {
    fn observe(&self, task: TaskIdx, status: TaskStatus) -> TaskStatus;
}

pub struct Scheduler<const NT: usize> {
    tasks: [TaskRecord; NT],
    ready_head: Option<TaskIdx>,
    ready_tail: Option<TaskIdx>,
    scheduled_head: Option<TaskIdx>,
    background_head: Option<TaskIdx>,
    background_tail: Option<TaskIdx>,
    stay_awake_count: u32,
    current: Option<TaskIdx>,
    monitors: [Option<&'static dyn LifecycleMonitor>; MAX_MONITORS],
    monitor_count: usize,
}

impl<const NT: usize> Scheduler<NT> {
    pub fn new(tasks: [TaskRecord; NT]) -> Self {
        assert!(NT < u8::MAX as usize, "task population must fit in a u8 index");
        Self {
            tasks,
            ready_head: None,
            ready_tail: None,
            scheduled_head: None,
            background_head: None,
            background_tail: None,
            stay_awake_count: 0,
            current: None,
            monitors: [None; MAX_MONITORS],
            monitor_count: 0,
        }
    }

    pub fn task_at(&self, i: usize) -> TaskIdx {
        assert!(i < NT);
        TaskIdx(i as u8)
    }

    pub fn state_of(&self, idx: TaskIdx) -> TaskState {
        self.tasks[idx.index()].state
    }

    pub fn is_runnable(&self, idx: TaskIdx) -> bool {
        !matches!(
            self.state_of(idx),
            TaskState::Suspended | TaskState::Initialising
        )
    }

    pub fn current_task(&self) -> Option<TaskIdx> {
        self.current
    }

    pub fn stay_awake(&mut self) {
        self.stay_awake_count += 1;
    }

    /// The current balance of unmatched `stay_awake` calls. Zero means
    /// `step` is free to elide `idle` for this kernel.
    pub fn stay_awake_count(&self) -> u32 {
        self.stay_awake_count
    }

    pub fn can_sleep<P: Platform>(&mut self, platform: &P) {
        match self.stay_awake_count.checked_sub(1) {
            Some(n) => self.stay_awake_count = n,
            None => platform.assert_fail("can_sleep without a matching stay_awake"),
        }
    }

    /// Unconditionally moves a task to the ready queue, regardless of
    /// what queue (if any) it's currently in. Used to launch tasks out of
    /// `Initialising` at boot.
    pub fn task_start(&mut self, idx: TaskIdx) {
        self.unlink_current(idx);
        self.push_ready(idx);
    }

    /// Moves a task to the ready queue from wherever it currently sits —
    /// suspended, scheduled, or background — cancelling any pending delay
    /// in the process. A no-op for a task that's already ready or active.
    pub fn task_resume(&mut self, idx: TaskIdx) {
        match self.tasks[idx.index()].state {
            TaskState::Ready | TaskState::Active => {}
            _ => {
                self.unlink_current(idx);
                self.push_ready(idx);
            }
        }
    }

    pub fn lifecycle_add_monitor(&mut self, monitor: &'static dyn LifecycleMonitor) -> bool {
        if self.monitor_count >= MAX_MONITORS {
            return false;
        }
        self.monitors[self.monitor_count] = Some(monitor);
        self.monitor_count += 1;
        true
    }

    fn lifecycle_notify(&self, idx: TaskIdx, status: TaskStatus) -> TaskStatus {
        let mut status = status;
        for slot in self.monitors[..self.monitor_count].iter().rev() {
            if let Some(monitor) = slot {
                status = monitor.observe(idx, status);
            }
        }
        status
    }

    /// Combines two desired statuses for the same task into the one that
    /// runs it soonest. `Suspend` is the identity element; the function
    /// is commutative, which is what makes it safe to fold over an
    /// unordered set of callers each asking for a different status.
    ///
    /// Same-queue pairs (`RunLater`/`RunLater`, or any mix of `RunAfter`/
    /// `RunBackground`) keep their queue and take the numeric minimum of
    /// the two delays, treating `RunBackground` as a delay of zero.
    /// Cross-queue pairs (one `RunLater`, the other background) strip the
    /// background bit from both sides first, so the result is always a
    /// `RunLater` carrying the numeric minimum of the two delays.
    pub fn prioritise(a: TaskStatus, b: TaskStatus) -> TaskStatus {
        use TaskStatus::*;
        match (a, b) {
            (Suspend, other) | (other, Suspend) => other,
            (RunImmediate, _) | (_, RunImmediate) => RunImmediate,
            (RunLater(x), RunLater(y)) => RunLater(x.min(y)),
            (RunLater(x), RunAfter(y)) | (RunAfter(y), RunLater(x)) => RunLater(x.min(y)),
            (RunLater(x), RunBackground) | (RunBackground, RunLater(x)) => RunLater(x.min(0)),
            (RunAfter(x), RunAfter(y)) => RunAfter(x.min(y)),
            (RunAfter(x), RunBackground) | (RunBackground, RunAfter(x)) => {
                if x == 0 {
                    RunAfter(x)
                } else {
                    RunBackground
                }
            }
            (RunBackground, RunBackground) => RunBackground,
        }
    }

    /// Runs one tick of the dispatch loop. Returns the number of ticks
    /// the platform is free to idle for before anything needs attention
    /// again (`0` if a task ran or there's more ready work, `u32::MAX` if
    /// nothing is scheduled at all).
    pub fn step<P: Platform, const NE: usize>(
        &mut self,
        platform: &P,
        events: &mut EventTable<NE>,
    ) -> u32 {
        while let Some(consumer) = events.get_next_consumer(platform) {
            self.task_resume(consumer);
        }

        let now = platform.now();
        self.drain_scheduled(now);
        self.drain_background(now);

        if let Some(idx) = self.pop_ready() {
            self.current = Some(idx);
            self.tasks[idx.index()].state = TaskState::Active;
            let raw = self.tasks[idx.index()].body.tick();
            let status = self.lifecycle_notify(idx, raw);
            self.current = None;
            self.enact(idx, status, now);
            return 0;
        }

        if self.stay_awake_count > 0 {
            return 0;
        }

        match self.scheduled_head {
            Some(head) => self.tasks[head.index()]
                .deadline
                .saturating_delay_from(now),
            None => u32::MAX,
        }
    }

    fn enact(&mut self, idx: TaskIdx, status: TaskStatus, now: Timestamp) {
        match status {
            TaskStatus::Suspend => {
                self.tasks[idx.index()].state = TaskState::Suspended;
                self.tasks[idx.index()].next = None;
            }
            TaskStatus::RunImmediate => self.push_ready(idx),
            TaskStatus::RunLater(delay) => {
                self.push_scheduled(idx, now + (delay & 0x7fff_ffff))
            }
            TaskStatus::RunAfter(delay) => {
                self.push_background(idx, now + (delay & 0x7fff_ffff))
            }
            TaskStatus::RunBackground => self.push_background(idx, now),
        }
    }

    fn drain_scheduled(&mut self, now: Timestamp) {
        while let Some(head) = self.scheduled_head {
            if !self.tasks[head.index()].deadline.has_elapsed(now) {
                break;
            }
            self.unlink_scheduled(head);
            self.push_ready(head);
        }
    }

    fn drain_background(&mut self, now: Timestamp) {
        let mut cur = self.background_head;
        let mut prev: Option<TaskIdx> = None;
        while let Some(idx) = cur {
            let next = self.tasks[idx.index()].next;
            if self.tasks[idx.index()].deadline.has_elapsed(now) {
                match prev {
                    Some(p) => self.tasks[p.index()].next = next,
                    None => self.background_head = next,
                }
                if self.background_tail == Some(idx) {
                    self.background_tail = prev;
                }
                self.push_ready(idx);
            } else {
                prev = Some(idx);
            }
            cur = next;
        }
    }

    fn unlink_current(&mut self, idx: TaskIdx) {
        match self.tasks[idx.index()].state {
            TaskState::Ready => self.unlink_ready(idx),
            TaskState::Scheduled => self.unlink_scheduled(idx),
            TaskState::Background => self.unlink_background(idx),
            _ => {}
        }
    }

    fn unlink_generic(
        tasks: &mut [TaskRecord],
        head: &mut Option<TaskIdx>,
        tail: &mut Option<TaskIdx>,
        idx: TaskIdx,
    ) {
        let mut prev: Option<TaskIdx> = None;
        let mut cur = *head;
        while let Some(c) = cur {
            if c == idx {
                let next = tasks[c.index()].next;
                match prev {
                    Some(p) => tasks[p.index()].next = next,
                    None => *head = next,
                }
                if *tail == Some(c) {
                    *tail = prev;
                }
                return;
            }
            prev = Some(c);
            cur = tasks[c.index()].next;
        }
    }

    fn unlink_ready(&mut self, idx: TaskIdx) {
        Self::unlink_generic(&mut self.tasks, &mut self.ready_head, &mut self.ready_tail, idx);
    }

    fn unlink_background(&mut self, idx: TaskIdx) {
        Self::unlink_generic(
            &mut self.tasks,
            &mut self.background_head,
            &mut self.background_tail,
            idx,
        );
    }

    fn unlink_scheduled(&mut self, idx: TaskIdx) {
        let mut unused_tail = None;
        Self::unlink_generic(&mut self.tasks, &mut self.scheduled_head, &mut unused_tail, idx);
    }

    fn push_ready(&mut self, idx: TaskIdx) {
        self.tasks[idx.index()].state = TaskState::Ready;
        self.tasks[idx.index()].next = None;
        match self.ready_tail {
            Some(tail) => self.tasks[tail.index()].next = Some(idx),
            None => self.ready_head = Some(idx),
        }
        self.ready_tail = Some(idx);
    }

    fn pop_ready(&mut self) -> Option<TaskIdx> {
        let head = self.ready_head?;
        self.ready_head = self.tasks[head.index()].next;
        if self.ready_head.is_none() {
            self.ready_tail = None;
        }
        Some(head)
    }

    fn push_background(&mut self, idx: TaskIdx, deadline: Timestamp) {
        self.tasks[idx.index()].state = TaskState::Background;
        self.tasks[idx.index()].deadline = deadline;
        self.tasks[idx.index()].next = None;
        match self.background_tail {
            Some(tail) => self.tasks[tail.index()].next = Some(idx),
            None => self.background_head = Some(idx),
        }
        self.background_tail = Some(idx);
    }

    fn push_scheduled(&mut self, idx: TaskIdx, deadline: Timestamp) {
        self.tasks[idx.index()].state = TaskState::Scheduled;
        self.tasks[idx.index()].deadline = deadline;

        let mut prev: Option<TaskIdx> = None;
        let mut cur = self.scheduled_head;
        while let Some(c) = cur {
            if deadline.is_before(self.tasks[c.index()].deadline) {
                break;
            }
            prev = Some(c);
            cur = self.tasks[c.index()].next;
        }
        self.tasks[idx.index()].next = cur;
        match prev {
            Some(p) => self.tasks[p.index()].next = Some(idx),
            None => self.scheduled_head = Some(idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimPlatform;
    use crate::task::TaskBody;
    use std::boxed::Box;
    use std::cell::Cell;
    use std::vec::Vec;

    struct Recorder {
        log: &'static std::sync::Mutex<Vec<&'static str>>,
        name: &'static str,
        statuses: Cell<usize>,
        plan: &'static [TaskStatus],
    }

    impl TaskBody for Recorder {
        fn tick(&mut self) -> TaskStatus {
            self.log.lock().unwrap().push(self.name);
            let i = self.statuses.get();
            self.statuses.set(i + 1);
            self.plan.get(i).copied().unwrap_or(TaskStatus::Suspend)
        }
    }

    fn leak_task(
        name: &'static str,
        log: &'static std::sync::Mutex<Vec<&'static str>>,
        plan: &'static [TaskStatus],
    ) -> &'static mut dyn TaskBody {
        Box::leak(Box::new(Recorder {
            log,
            name,
            statuses: Cell::new(0),
            plan,
        }))
    }

    #[test]
    fn ready_tasks_run_fifo() {
        static LOG: std::sync::Mutex<Vec<&'static str>> = std::sync::Mutex::new(Vec::new());
        static PLAN: [TaskStatus; 1] = [TaskStatus::Suspend];
        let a = leak_task("a", &LOG, &PLAN);
        let b = leak_task("b", &LOG, &PLAN);
        let mut sched: Scheduler<2> = Scheduler::new([TaskRecord::suspended(a), TaskRecord::suspended(b)]);
        let platform = SimPlatform::new();
        let mut events: EventTable<1> = EventTable::new();

        sched.task_start(sched.task_at(0));
        sched.task_start(sched.task_at(1));
        sched.step(&platform, &mut events);
        sched.step(&platform, &mut events);

        assert_eq!(&*LOG.lock().unwrap(), &["a", "b"]);
    }

    #[test]
    fn run_later_waits_for_its_deadline() {
        static LOG: std::sync::Mutex<Vec<&'static str>> = std::sync::Mutex::new(Vec::new());
        static PLAN: [TaskStatus; 1] = [TaskStatus::RunLater(5)];
        let a = leak_task("a", &LOG, &PLAN);
        let mut sched: Scheduler<1> = Scheduler::new([TaskRecord::suspended(a)]);
        let platform = SimPlatform::new();
        let mut events: EventTable<1> = EventTable::new();

        sched.task_start(sched.task_at(0));
        let idle = sched.step(&platform, &mut events);
        assert_eq!(idle, 0, "first tick should have run the task");

        let idle = sched.step(&platform, &mut events);
        assert_eq!(idle, 5, "nothing ready, should report the scheduled delay");

        platform.advance(5);
        sched.step(&platform, &mut events);
        assert_eq!(LOG.lock().unwrap().len(), 2);
    }

    #[test]
    fn prioritise_is_commutative_with_suspend_as_identity() {
        use TaskStatus::*;
        let cases = [
            (Suspend, RunImmediate),
            (RunLater(3), RunAfter(10)),
            (RunAfter(4), RunBackground),
            (RunLater(7), RunLater(2)),
        ];
        for (a, b) in cases {
            assert_eq!(Scheduler::<1>::prioritise(a, b), Scheduler::<1>::prioritise(b, a));
        }
        assert_eq!(Scheduler::<1>::prioritise(Suspend, RunImmediate), RunImmediate);
        assert_eq!(Scheduler::<1>::prioritise(RunBackground, Suspend), RunBackground);
    }

    #[test]
    fn task_resume_cancels_a_pending_run_later_delay() {
        static LOG: std::sync::Mutex<Vec<&'static str>> = std::sync::Mutex::new(Vec::new());
        static PLAN: [TaskStatus; 1] = [TaskStatus::RunLater(2048)];
        let a = leak_task("a", &LOG, &PLAN);
        let mut sched: Scheduler<1> = Scheduler::new([TaskRecord::suspended(a)]);
        let platform = SimPlatform::new();
        let mut events: EventTable<1> = EventTable::new();

        sched.task_start(sched.task_at(0));
        let idle = sched.step(&platform, &mut events);
        assert_eq!(idle, 2048, "task should be waiting out its full delay");

        platform.advance(3);
        sched.task_resume(sched.task_at(0));
        let idle = sched.step(&platform, &mut events);
        assert_eq!(idle, 0, "an explicit resume should dispatch it immediately");
        assert_eq!(LOG.lock().unwrap().len(), 2);
    }

    #[test]
    fn idle_is_unbounded_with_no_scheduled_work() {
        let a = leak_task("a", {
            static LOG: std::sync::Mutex<Vec<&'static str>> = std::sync::Mutex::new(Vec::new());
            &LOG
        }, {
            static PLAN: [TaskStatus; 0] = [];
            &PLAN
        });
        let mut sched: Scheduler<1> = Scheduler::new([TaskRecord::suspended(a)]);
        let platform = SimPlatform::new();
        let mut events: EventTable<1> = EventTable::new();
        assert_eq!(sched.step(&platform, &mut events), u32::MAX);
    }
}
