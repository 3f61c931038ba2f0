// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bounded byte-stream FIFO (component E).
//!
//! A [`Stream`] is a [`Buffer`] with a capacity ceiling and a bound
//! consumer task. Writing into a stream that was empty automatically
//! resumes its consumer — that's the "auto-resume" the specification
//! calls for, so a producer never has to remember to wake the reader
//! itself.

use crate::buffer::Buffer;
use crate::pool::Pool;
use crate::sched::Scheduler;
use crate::task::TaskIdx;

pub struct Stream<const SEG: usize = 64> {
    buf: Buffer<SEG>,
    capacity: u16,
    consumer: Option<TaskIdx>,
}

impl<const SEG: usize> Stream<SEG> {
    pub fn new(capacity: u16) -> Self {
        Self {
            buf: Buffer::new(),
            capacity,
            consumer: None,
        }
    }

    pub fn bind_consumer(&mut self, task: TaskIdx) {
        self.consumer = Some(task);
    }

    pub fn get_read_capacity(&self) -> u16 {
        self.buf.get_size()
    }

    pub fn get_write_capacity(&self) -> u16 {
        self.capacity - self.buf.get_size()
    }

    fn resume_consumer<const NT: usize>(&self, sched: &mut Scheduler<NT>) {
        if let Some(task) = self.consumer {
            sched.task_resume(task);
        }
    }

    /// Appends `src` if there's room for all of it; nothing is written
    /// otherwise. Resumes the bound consumer if the stream was empty.
    pub fn write_all<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        src: &[u8],
    ) -> bool {
        if src.len() as u32 > self.get_write_capacity() as u32 {
            return false;
        }
        let was_empty = self.buf.is_empty();
        if !self.buf.append(pool, src) {
            return false;
        }
        if was_empty && !src.is_empty() {
            self.resume_consumer(sched);
        }
        true
    }

    pub fn write_byte<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        byte: u8,
    ) -> bool {
        self.write_all(pool, sched, &[byte])
    }

    /// Reads and consumes `dst.len()` bytes from the front, or fails (no
    /// change) if fewer than that are available.
    pub fn read_all<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        dst: &mut [u8],
    ) -> bool {
        if dst.len() as u32 > self.get_read_capacity() as u32 {
            return false;
        }
        if !self.buf.read(pool, 0, dst) {
            return false;
        }
        let remaining = self.buf.get_size() - dst.len() as u16;
        self.buf.rebase(pool, remaining);
        true
    }

    pub fn read_byte<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
    ) -> Option<u8> {
        if self.buf.is_empty() {
            return None;
        }
        let mut byte = [0u8; 1];
        self.read_all(pool, &mut byte);
        Some(byte[0])
    }

    /// Reads the next byte without consuming it.
    pub fn peek_byte<const N: usize>(&self, pool: &Pool<N, SEG>) -> Option<u8> {
        if self.buf.is_empty() {
            return None;
        }
        let mut byte = [0u8; 1];
        self.buf.read(pool, 0, &mut byte);
        Some(byte[0])
    }

    /// Un-reads a byte, putting it back at the front of the stream. Fails
    /// if that would exceed capacity (only possible if the stream was
    /// already full, which a well-behaved reader shouldn't hit).
    pub fn push_back_byte<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        byte: u8,
    ) -> bool {
        if self.get_write_capacity() == 0 {
            return false;
        }
        let was_empty = self.buf.is_empty();
        if !self.buf.prepend(pool, &[byte]) {
            return false;
        }
        if was_empty {
            self.resume_consumer(sched);
        }
        true
    }

    /// Swaps the stream's entire backing buffer out to `dst`, leaving the
    /// stream empty, with no byte copying.
    pub fn read_buffer<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        dst: &mut Buffer<SEG>,
    ) {
        self.buf.move_into(pool, dst);
    }

    /// Replaces the stream's contents with `src`'s, with no byte copying.
    /// Fails (no change) if `src` is larger than capacity.
    pub fn write_buffer<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        src: &mut Buffer<SEG>,
    ) -> bool {
        if src.get_size() > self.capacity {
            return false;
        }
        let was_empty = self.buf.is_empty();
        self.buf.reset(pool);
        src.move_into(pool, &mut self.buf);
        if was_empty && !self.buf.is_empty() {
            self.resume_consumer(sched);
        }
        true
    }
}
