// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed-segment memory pool (component B).
//!
//! A [`Pool`] is `N` fixed-size segments, each `SEG` bytes, living in a
//! single `'static`-sized array with no dynamic allocation. Segments are
//! tracked with a typed-index arena instead of intrusive pointers: a
//! segment's "next" slot means one of two mutually exclusive things
//! depending on whether the segment is free or in use, which is exactly
//! why a segment can never end up a member of two chains (or two
//! positions in the free list) at once — there is only one next-slot to
//! corrupt.

/// Identifies one segment inside a particular [`Pool`]. Meaningless
/// outside the pool that produced it; nothing stops mixing up indices
/// from two different pools; callers are expected to keep exactly one
/// pool per buffer population, as the specification's data model does.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegIdx(u16);

impl SegIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

const NIL: u16 = u16::MAX;

/// `N` segments of `SEG` bytes each, with an embedded singly linked free
/// list.
pub struct Pool<const N: usize, const SEG: usize = 64> {
    data: [[u8; SEG]; N],
    /// Dual-purpose link array: for a free segment, the next free segment
    /// (or `NIL`); for an allocated segment, the next segment in whatever
    /// buffer's chain owns it (or `NIL` for the chain's tail).
    next: [u16; N],
    free_head: u16,
    free_count: u16,
}

impl<const N: usize, const SEG: usize> Pool<N, SEG> {
    /// Segment size in bytes, for callers computing how many segments a
    /// logical size needs.
    pub const SEGMENT_SIZE: usize = SEG;

    pub fn new() -> Self {
        assert!(N < NIL as usize, "pool capacity must fit in a u16 index");
        let mut next = [NIL; N];
        for i in 0..N {
            next[i] = if i + 1 < N { (i + 1) as u16 } else { NIL };
        }
        Self {
            data: [[0u8; SEG]; N],
            next,
            free_head: if N == 0 { NIL } else { 0 },
            free_count: N as u16,
        }
    }

    pub fn capacity(&self) -> u16 {
        N as u16
    }

    pub fn available(&self) -> u16 {
        self.free_count
    }

    /// How many segments a logical size of `len` bytes needs, given `off`
    /// bytes of leading slack in the first segment.
    pub fn segments_needed(off: u16, len: u16) -> u16 {
        if len == 0 && off == 0 {
            return 0;
        }
        let total = off as u32 + len as u32;
        ((total + SEG as u32 - 1) / SEG as u32) as u16
    }

    pub fn segment(&self, idx: SegIdx) -> &[u8; SEG] {
        &self.data[idx.index()]
    }

    pub fn segment_mut(&mut self, idx: SegIdx) -> &mut [u8; SEG] {
        &mut self.data[idx.index()]
    }

    pub fn next_of(&self, idx: SegIdx) -> Option<SegIdx> {
        match self.next[idx.index()] {
            NIL => None,
            n => Some(SegIdx(n)),
        }
    }

    pub fn set_next(&mut self, idx: SegIdx, next: Option<SegIdx>) {
        self.next[idx.index()] = next.map(|s| s.0).unwrap_or(NIL);
    }

    fn pop_free(&mut self) -> Option<SegIdx> {
        if self.free_head == NIL {
            return None;
        }
        let idx = self.free_head;
        self.free_head = self.next[idx as usize];
        self.free_count -= 1;
        Some(SegIdx(idx))
    }

    pub fn alloc_one(&mut self) -> Option<SegIdx> {
        self.pop_free()
    }

    pub fn free_one(&mut self, idx: SegIdx) {
        self.next[idx.index()] = self.free_head;
        self.free_head = idx.0;
        self.free_count += 1;
    }

    /// Allocates `count` segments linked into a single chain, or none at
    /// all if the pool doesn't have that many free. Returns the chain's
    /// head.
    pub fn alloc_chain(&mut self, count: u16) -> Option<SegIdx> {
        if count == 0 || count > self.free_count {
            return None;
        }
        let head = self.pop_free().expect("checked free_count above");
        let mut tail = head;
        for _ in 1..count {
            let seg = self.pop_free().expect("checked free_count above");
            self.set_next(tail, Some(seg));
            tail = seg;
        }
        self.set_next(tail, None);
        Some(head)
    }

    /// Returns an entire chain to the free list in one splice, walking it
    /// once to find its tail and count its length.
    pub fn free_chain(&mut self, head: Option<SegIdx>) -> u16 {
        let Some(head) = head else { return 0 };
        let mut count = 1u16;
        let mut tail = head;
        while let Some(next) = self.next_of(tail) {
            tail = next;
            count += 1;
        }
        self.next[tail.index()] = self.free_head;
        self.free_head = head.0;
        self.free_count += count;
        count
    }

    /// Appends `extra` freshly allocated segments to the tail of an
    /// existing chain (identified by its current tail index), or
    /// allocates a fresh chain if `tail` is `None`. All-or-nothing.
    /// Returns the chain's new tail.
    pub fn grow_chain(
        &mut self,
        tail: Option<SegIdx>,
        extra: u16,
    ) -> Option<SegIdx> {
        if extra == 0 {
            return tail;
        }
        let new_chain = self.alloc_chain(extra)?;
        if let Some(old_tail) = tail {
            self.set_next(old_tail, Some(new_chain));
        }
        let mut new_tail = new_chain;
        while let Some(next) = self.next_of(new_tail) {
            new_tail = next;
        }
        Some(new_tail)
    }
}

impl<const N: usize, const SEG: usize> Default for Pool<N, SEG> {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(feature = "alloc")]
pub mod growable {
    //! A pool whose segments are individually heap-allocated rather than
    //! backed by one fixed `'static` array, for applications that build
    //! with a real allocator and would rather trade a fixed memory
    //! ceiling for graceful degradation under unexpected load.
    //!
    //! `NOMINAL` is the pool's normal-operating target segment count —
    //! the size the backing store idles at under steady-state traffic.
    //! The backing store still grows past it under a burst (this is a
    //! heap, not a hard ceiling) and still shrinks back down afterward;
    //! `NOMINAL` only governs *when* those two reactions fire:
    //!
    //! - Grow a batch, proactively, once free segments drop below one
    //!   quarter of `NOMINAL` — before the free list actually runs dry,
    //!   so a burst doesn't serialize on single-segment allocator calls.
    //! - Trim the backing store's unused tail once free segments exceed
    //!   `NOMINAL` — but only after that surplus has persisted for
    //!   `SHRINK_HYSTERESIS` consecutive frees, so traffic that merely
    //!   hovers near the line doesn't grow and shrink on alternating
    //!   calls.

    extern crate alloc;
    use alloc::vec::Vec;

    const SHRINK_HYSTERESIS: u32 = 8;

    /// A segment living on the heap instead of in a fixed array.
    type HeapSegment<const SEG: usize> = alloc::boxed::Box<[u8; SEG]>;

    /// Companion to [`super::Pool`] for allocator-backed targets. Keeps
    /// the same "one `next` slot per segment, shared between the free
    /// list and chain membership" structure, just with `Vec`-backed
    /// storage that can be extended at runtime.
    pub struct GrowablePool<const SEG: usize, const NOMINAL: usize> {
        segments: Vec<HeapSegment<SEG>>,
        next: Vec<u32>,
        free_head: Option<u32>,
        free_count: u32,
        surplus_streak: u32,
    }

    const NIL: u32 = u32::MAX;

    impl<const SEG: usize, const NOMINAL: usize> GrowablePool<SEG, NOMINAL> {
        pub fn new() -> Self {
            Self {
                segments: Vec::new(),
                next: Vec::new(),
                free_head: None,
                free_count: 0,
                surplus_streak: 0,
            }
        }

        pub fn available(&self) -> u32 {
            self.free_count
        }

        pub fn capacity(&self) -> u32 {
            self.segments.len() as u32
        }

        fn grow_backing_store(&mut self, additional: u32) {
            let start = self.segments.len() as u32;
            for i in 0..additional {
                self.segments.push(alloc::boxed::Box::new([0u8; SEG]));
                let slot = start + i;
                self.next.push(self.free_head.unwrap_or(NIL));
                self.free_head = Some(slot);
            }
            self.free_count += additional;
        }

        /// Allocates one segment. If that drops the free count below one
        /// quarter of `NOMINAL`, grows the backing store by a batch
        /// (enough to bring it back up to half of `NOMINAL`, or by one
        /// segment if `NOMINAL` is small) before the free list can run
        /// dry on a subsequent call; if the free list is already dry
        /// this call, grows by exactly the one segment needed.
        pub fn alloc_one(&mut self) -> u32 {
            if self.free_head.is_none() {
                self.grow_backing_store(1);
            }
            let idx = self.free_head.expect("just grew the pool");
            self.free_head = match self.next[idx as usize] {
                NIL => None,
                n => Some(n),
            };
            self.free_count -= 1;
            self.surplus_streak = 0;

            let low_water = (NOMINAL as u32) / 4;
            if self.free_count < low_water {
                let target = ((NOMINAL as u32) / 2).max(self.free_count + 1);
                let batch = target - self.free_count;
                if batch > 0 {
                    self.grow_backing_store(batch);
                }
            }
            idx
        }

        pub fn free_one(&mut self, idx: u32) {
            self.next[idx as usize] = self.free_head.unwrap_or(NIL);
            self.free_head = Some(idx);
            self.free_count += 1;

            if self.free_count > NOMINAL as u32 {
                self.surplus_streak += 1;
            } else {
                self.surplus_streak = 0;
            }
            if self.surplus_streak >= SHRINK_HYSTERESIS {
                self.shrink_unused_tail();
                self.surplus_streak = 0;
            }
        }

        /// Drops heap-allocated segments off the end of the backing
        /// store that happen to currently be free, without disturbing
        /// any segment still in use. Conservative by design: it only
        /// ever removes a contiguous run of free segments at the very
        /// end of `segments`, so it never needs to touch the free list's
        /// ordering for segments it isn't removing, and it only ever
        /// trims back down to `NOMINAL` free segments, never below —
        /// the backing store settles at its steady-state target instead
        /// of being shrunk to the bone every time it goes idle.
        fn shrink_unused_tail(&mut self) {
            let surplus = self.free_count.saturating_sub(NOMINAL as u32);
            if surplus == 0 {
                return;
            }
            let mut free_at_tail = 0usize;
            let mut cur = self.free_head;
            let mut free_set = alloc::collections::BTreeSet::new();
            while let Some(idx) = cur {
                free_set.insert(idx);
                cur = match self.next[idx as usize] {
                    NIL => None,
                    n => Some(n),
                };
            }
            while free_at_tail < surplus as usize {
                let Some(last) = self.segments.len().checked_sub(1) else {
                    break;
                };
                if free_set.contains(&(last as u32)) {
                    free_at_tail += 1;
                    self.segments.pop();
                    self.next.pop();
                } else {
                    break;
                }
            }
            if free_at_tail > 0 {
                self.free_count -= free_at_tail as u32;
                self.rebuild_free_list(free_set, free_at_tail as u32);
            }
        }

        fn rebuild_free_list(
            &mut self,
            mut free_set: alloc::collections::BTreeSet<u32>,
            removed: u32,
        ) {
            for i in 0..removed {
                free_set.remove(&(self.segments.len() as u32 + i));
            }
            self.free_head = None;
            for &idx in free_set.iter() {
                self.next[idx as usize] = self.free_head.unwrap_or(NIL);
                self.free_head = Some(idx);
            }
        }
    }

    impl<const SEG: usize, const NOMINAL: usize> Default for GrowablePool<SEG, NOMINAL> {
        fn default() -> Self {
            Self::new()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn grows_on_demand_and_tracks_availability() {
            let mut pool: GrowablePool<16, 0> = GrowablePool::new();
            assert_eq!(pool.capacity(), 0);
            let a = pool.alloc_one();
            assert_eq!(pool.capacity(), 1);
            pool.free_one(a);
            assert_eq!(pool.available(), 1);
        }

        #[test]
        fn grows_in_a_batch_once_below_the_low_water_mark() {
            let mut pool: GrowablePool<16, 16> = GrowablePool::new();
            // Draining past NOMINAL/4 = 4 free should trigger a batch
            // grow back up toward NOMINAL/2 = 8, rather than growing
            // exactly one segment per call.
            let handles: Vec<u32> = (0..13).map(|_| pool.alloc_one()).collect();
            assert!(
                pool.capacity() > 13,
                "should have grown ahead of the free list actually running dry"
            );
            for h in handles {
                pool.free_one(h);
            }
        }

        #[test]
        fn shrinks_after_sustained_surplus_but_not_below_nominal() {
            let mut pool: GrowablePool<16, 4> = GrowablePool::new();
            let handles: Vec<u32> = (0..32).map(|_| pool.alloc_one()).collect();
            assert_eq!(pool.capacity(), 32);
            for h in handles {
                pool.free_one(h);
            }
            assert!(pool.capacity() < 32, "sustained surplus should shrink the backing store");
            assert!(
                pool.available() >= 4,
                "trimming should never cut below the nominal target"
            );
        }
    }
}
