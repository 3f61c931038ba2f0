// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task records (component D data model).
//!
//! A task is a `'static` state machine plus the bookkeeping the scheduler
//! needs to hold it in one of its three queues. The specification's
//! "opaque tick function and opaque data pointer" becomes a trait object
//! here: [`TaskBody::tick`] plays the role of the tick function, and
//! `self` plays the role of the data pointer, with the borrow checker
//! guaranteeing a task can't be ticked reentrantly.

use crate::time::Timestamp;
use abi::TaskStatus;

/// A long-lived unit of cooperative work. Implementors hold whatever
/// state their state machine needs and drive it forward one step in
/// `tick`, telling the scheduler what to do with the task next.
pub trait TaskBody {
    fn tick(&mut self) -> TaskStatus;

    /// A short name for diagnostics (ring-buffer entries, panics). Tasks
    /// that don't care can leave this as the default.
    fn name(&self) -> Option<&'static str> {
        None
    }
}

/// Identifies one task's slot inside a particular [`crate::sched::Scheduler`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TaskIdx(pub(crate) u8);

impl TaskIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which of the scheduler's queues (if any) currently owns a task, or
/// whether it's the one actively ticking.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Hasn't been handed to the scheduler yet.
    Initialising,
    /// Sitting in the scheduled queue, waiting for `deadline`.
    Scheduled,
    /// Sitting in the background queue.
    Background,
    /// Sitting in the ready queue, waiting its turn.
    Ready,
    /// Currently inside its own `tick()` call.
    Active,
    /// In no queue; only `task_start`/`task_resume` can move it again.
    Suspended,
}

pub struct TaskRecord {
    pub(crate) body: &'static mut dyn TaskBody,
    pub(crate) state: TaskState,
    pub(crate) deadline: Timestamp,
    pub(crate) next: Option<TaskIdx>,
}

impl TaskRecord {
    /// Builds a task record that starts out suspended — the scheduler
    /// will leave it alone until something calls `task_start` or
    /// `task_resume` on it.
    pub fn suspended(body: &'static mut dyn TaskBody) -> Self {
        Self {
            body,
            state: TaskState::Suspended,
            deadline: Timestamp::new(0),
            next: None,
        }
    }
}
