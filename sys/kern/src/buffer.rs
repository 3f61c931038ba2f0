// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The segmented logical byte buffer (component F).
//!
//! A [`Buffer`] is a logical run of up to `u16::MAX` bytes backed by a
//! chain of fixed-size segments drawn from a [`Pool`]. It supports
//! growing and shrinking at either end without copying the bytes that
//! don't move: growing at the tail ([`Buffer::extend`]) or shrinking at
//! the tail ([`Buffer::resize`] downward) only ever touches the chain's
//! last segment(s); growing or shrinking at the *head*
//! ([`Buffer::rebase`]) only ever touches the first. `head_offset` is
//! what makes the latter possible — it's slack at the front of the first
//! segment that a `rebase` can eat into before it needs to allocate or
//! free whole segments.

use crate::pool::{Pool, SegIdx};

/// Logical sizes never exceed this; matches `abi::MAX_LOGICAL_SIZE`.
const MAX_LOGICAL_SIZE: u16 = u16::MAX;

pub struct Buffer<const SEG: usize = 64> {
    head: Option<SegIdx>,
    tail: Option<SegIdx>,
    head_offset: u16,
    size: u16,
    segment_count: u16,
}

impl<const SEG: usize> Buffer<SEG> {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            head_offset: 0,
            size: 0,
            segment_count: 0,
        }
    }

    pub fn get_size(&self) -> u16 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn segment_count(&self) -> u16 {
        self.segment_count
    }

    /// Frees the entire backing chain and returns the buffer to empty.
    pub fn reset<const N: usize>(&mut self, pool: &mut Pool<N, SEG>) {
        pool.free_chain(self.head);
        self.head = None;
        self.tail = None;
        self.head_offset = 0;
        self.size = 0;
        self.segment_count = 0;
    }

    /// Grows the buffer by `delta` bytes at the tail, preserving every
    /// existing byte at its current offset. Fails (no observable change)
    /// if the pool doesn't have enough free segments or the new size
    /// would exceed the logical maximum.
    pub fn extend<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        delta: u16,
    ) -> bool {
        if delta == 0 {
            return true;
        }
        let new_size = match self.size.checked_add(delta) {
            Some(s) if s <= MAX_LOGICAL_SIZE => s,
            _ => return false,
        };
        let needed = Pool::<N, SEG>::segments_needed(self.head_offset, new_size);
        let extra = needed - self.segment_count;
        if extra > 0 {
            let new_chain = match pool.alloc_chain(extra) {
                Some(c) => c,
                None => return false,
            };
            if let Some(old_tail) = self.tail {
                pool.set_next(old_tail, Some(new_chain));
            } else {
                self.head = Some(new_chain);
            }
            let mut t = new_chain;
            while let Some(n) = pool.next_of(t) {
                t = n;
            }
            self.tail = Some(t);
            self.segment_count = needed;
        }
        self.size = new_size;
        true
    }

    /// Sets the buffer's size, growing at the tail or shrinking at the
    /// tail as needed.
    pub fn resize<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        new_size: u16,
    ) -> bool {
        use core::cmp::Ordering;
        match new_size.cmp(&self.size) {
            Ordering::Equal => true,
            Ordering::Greater => self.extend(pool, new_size - self.size),
            Ordering::Less => {
                self.truncate_tail(pool, new_size);
                true
            }
        }
    }

    fn truncate_tail<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        new_size: u16,
    ) {
        let needed = Pool::<N, SEG>::segments_needed(self.head_offset, new_size);
        if needed < self.segment_count {
            if needed == 0 {
                pool.free_chain(self.head);
                self.head = None;
                self.tail = None;
            } else {
                let mut new_tail = self.head.expect("segment_count > 0");
                for _ in 1..needed {
                    new_tail = pool.next_of(new_tail).expect("segment_count invariant");
                }
                let rest = pool.next_of(new_tail);
                pool.set_next(new_tail, None);
                pool.free_chain(rest);
                self.tail = Some(new_tail);
            }
            self.segment_count = needed;
        }
        self.size = new_size;
    }

    /// Grows or shrinks the buffer at the *head* instead of the tail:
    /// growing shifts every existing byte's logical offset forward by the
    /// size delta (the new bytes land at the front); shrinking drops
    /// bytes from the front. Fails (no observable change) if growth needs
    /// more segments than the pool has free.
    pub fn rebase<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        new_size: u16,
    ) -> bool {
        use core::cmp::Ordering;
        match new_size.cmp(&self.size) {
            Ordering::Equal => true,
            Ordering::Greater => self.grow_at_head(pool, new_size - self.size),
            Ordering::Less => {
                self.shrink_at_head(pool, self.size - new_size);
                true
            }
        }
    }

    fn grow_at_head<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        delta: u16,
    ) -> bool {
        if delta <= self.head_offset {
            self.head_offset -= delta;
            self.size += delta;
            return true;
        }
        let shortfall = delta - self.head_offset;
        let additional = (shortfall as u32).div_ceil(SEG as u32) as u16;
        let new_chain = match pool.alloc_chain(additional) {
            Some(c) => c,
            None => return false,
        };
        let mut nc_tail = new_chain;
        while let Some(n) = pool.next_of(nc_tail) {
            nc_tail = n;
        }
        pool.set_next(nc_tail, self.head);
        if self.tail.is_none() {
            self.tail = Some(nc_tail);
        }
        self.head = Some(new_chain);
        self.head_offset = additional * SEG as u16 - shortfall;
        self.segment_count += additional;
        self.size += delta;
        true
    }

    fn shrink_at_head<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        delta: u16,
    ) {
        let new_size = self.size - delta;
        if new_size == 0 {
            pool.free_chain(self.head);
            self.head = None;
            self.tail = None;
            self.head_offset = 0;
            self.segment_count = 0;
            self.size = 0;
            return;
        }
        let new_head_offset_total = self.head_offset as u32 + delta as u32;
        let drop_segs = (new_head_offset_total / SEG as u32) as u16;
        let new_head_offset = (new_head_offset_total % SEG as u32) as u16;
        if drop_segs > 0 {
            let mut cur = self.head.expect("non-empty buffer has a head");
            for _ in 0..drop_segs {
                let next = pool.next_of(cur).expect("segment_count invariant");
                pool.free_one(cur);
                cur = next;
            }
            self.head = Some(cur);
            self.segment_count -= drop_segs;
        }
        self.head_offset = new_head_offset;
        self.size = new_size;
    }

    fn locate<const N: usize>(
        &self,
        pool: &Pool<N, SEG>,
        offset: u16,
    ) -> (SegIdx, usize) {
        let logical = offset as u32 + self.head_offset as u32;
        let mut cur = self.head.expect("offset within a non-empty buffer");
        for _ in 0..(logical / SEG as u32) {
            cur = pool.next_of(cur).expect("segment_count invariant");
        }
        (cur, (logical % SEG as u32) as usize)
    }

    /// Returns the segment holding logical byte `offset`, and the offset
    /// within that segment, for callers that want direct access instead
    /// of going through `read`/`write`.
    pub fn get_segment<const N: usize>(
        &self,
        pool: &Pool<N, SEG>,
        offset: u16,
    ) -> Option<(SegIdx, usize)> {
        if offset >= self.size {
            return None;
        }
        Some(self.locate(pool, offset))
    }

    pub fn write<const N: usize>(
        &self,
        pool: &mut Pool<N, SEG>,
        offset: u16,
        src: &[u8],
    ) -> bool {
        let end = offset as u32 + src.len() as u32;
        if end > self.size as u32 {
            return false;
        }
        if src.is_empty() {
            return true;
        }
        let (mut cur, mut off_in_seg) = self.locate(pool, offset);
        let mut remaining = src;
        loop {
            let seg = pool.segment_mut(cur);
            let n = core::cmp::min(SEG - off_in_seg, remaining.len());
            seg[off_in_seg..off_in_seg + n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            if remaining.is_empty() {
                break;
            }
            cur = pool.next_of(cur).expect("segment_count invariant");
            off_in_seg = 0;
        }
        true
    }

    pub fn read<const N: usize>(
        &self,
        pool: &Pool<N, SEG>,
        offset: u16,
        dst: &mut [u8],
    ) -> bool {
        let end = offset as u32 + dst.len() as u32;
        if end > self.size as u32 {
            return false;
        }
        if dst.is_empty() {
            return true;
        }
        let (mut cur, mut off_in_seg) = self.locate(pool, offset);
        let mut written = 0usize;
        loop {
            let seg = pool.segment(cur);
            let n = core::cmp::min(SEG - off_in_seg, dst.len() - written);
            dst[written..written + n].copy_from_slice(&seg[off_in_seg..off_in_seg + n]);
            written += n;
            if written == dst.len() {
                break;
            }
            cur = pool.next_of(cur).expect("segment_count invariant");
            off_in_seg = 0;
        }
        true
    }

    pub fn append<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        src: &[u8],
    ) -> bool {
        let old_size = self.size;
        let len = match u16::try_from(src.len()) {
            Ok(l) => l,
            Err(_) => return false,
        };
        if !self.extend(pool, len) {
            return false;
        }
        self.write(pool, old_size, src)
    }

    pub fn prepend<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        src: &[u8],
    ) -> bool {
        let len = match u16::try_from(src.len()) {
            Ok(l) => l,
            Err(_) => return false,
        };
        let new_size = match self.size.checked_add(len) {
            Some(s) if s <= MAX_LOGICAL_SIZE => s,
            _ => return false,
        };
        if !self.rebase(pool, new_size) {
            return false;
        }
        self.write(pool, 0, src)
    }

    /// Transfers `self`'s backing chain to `dst` with no byte copying,
    /// leaving `self` empty. Any chain `dst` already owned is freed
    /// first.
    pub fn move_into<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        dst: &mut Self,
    ) {
        dst.reset(pool);
        dst.head = self.head.take();
        dst.tail = self.tail.take();
        dst.head_offset = self.head_offset;
        dst.size = self.size;
        dst.segment_count = self.segment_count;
        self.head_offset = 0;
        self.size = 0;
        self.segment_count = 0;
    }

    /// Copies this buffer's full contents into `dst`, replacing whatever
    /// `dst` held. Unlike `move_into`, `self` is left intact.
    pub fn copy<const N: usize>(
        &self,
        pool: &mut Pool<N, SEG>,
        dst: &mut Self,
    ) -> bool {
        self.copy_section(pool, 0, self.size, dst)
    }

    /// Copies `len` bytes starting at `offset` into `dst`, replacing
    /// whatever `dst` held.
    pub fn copy_section<const N: usize>(
        &self,
        pool: &mut Pool<N, SEG>,
        offset: u16,
        len: u16,
        dst: &mut Self,
    ) -> bool {
        if offset as u32 + len as u32 > self.size as u32 {
            return false;
        }
        let mut scratch = Buffer::<SEG>::new();
        if !scratch.extend(pool, len) {
            return false;
        }
        let mut tmp = [0u8; SEG];
        let mut done = 0u16;
        while done < len {
            let n = core::cmp::min(SEG as u16, len - done);
            self.read(pool, offset + done, &mut tmp[..n as usize]);
            scratch.write(pool, done, &tmp[..n as usize]);
            done += n;
        }
        scratch.move_into(pool, dst);
        true
    }

    /// Consumes `a` and `b`, leaving `dst` holding `a`'s bytes followed by
    /// `b`'s, and both inputs empty. Internally copies only the smaller
    /// of the two onto the larger, so the cost is bounded by
    /// `min(a.len(), b.len())` rather than their sum.
    pub fn concatenate<const N: usize>(
        pool: &mut Pool<N, SEG>,
        mut a: Self,
        mut b: Self,
        dst: &mut Self,
    ) -> bool {
        if a.size == 0 {
            b.move_into(pool, dst);
            a.reset(pool);
            return true;
        }
        if b.size == 0 {
            a.move_into(pool, dst);
            b.reset(pool);
            return true;
        }
        let mut tmp = [0u8; SEG];
        let ok = if a.size >= b.size {
            let mut off = 0u16;
            let mut ok = true;
            while off < b.size {
                let n = core::cmp::min(SEG as u16, b.size - off);
                b.read(pool, off, &mut tmp[..n as usize]);
                if !a.append(pool, &tmp[..n as usize]) {
                    ok = false;
                    break;
                }
                off += n;
            }
            if ok {
                a.move_into(pool, dst);
            }
            ok
        } else {
            let mut off = a.size;
            let mut ok = true;
            while off > 0 {
                let n = core::cmp::min(SEG as u16, off);
                off -= n;
                a.read(pool, off, &mut tmp[..n as usize]);
                if !b.prepend(pool, &tmp[..n as usize]) {
                    ok = false;
                    break;
                }
            }
            if ok {
                b.move_into(pool, dst);
            }
            ok
        };
        a.reset(pool);
        b.reset(pool);
        ok
    }
}

impl<const SEG: usize> Default for Buffer<SEG> {
    fn default() -> Self {
        Self::new()
    }
}
