// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capability surface every other kernel module is written against.
//!
//! Nothing in `kern` touches a register, a `cortex_m` intrinsic, or a
//! `static mut` directly. Instead every module takes `&impl Platform` (or
//! a concrete, monomorphized `P: Platform`) and calls through it. This
//! keeps the scheduler, event table, pool, buffer and stream code free of
//! `unsafe` and lets it run, unmodified, against [`SimPlatform`] under
//! `cargo test` on the host.

use crate::time::Timestamp;
use core::marker::PhantomData;

/// Capabilities a concrete board support package provides to the kernel.
///
/// A real implementation backs `now`/`idle` with a hardware timer and
/// `enter_critical`/`exit_critical` with `cortex_m::interrupt::Mutex`-style
/// masking (`cpsid i` / `cpsie i` on Cortex-M). None of that detail leaks
/// into this trait: it is expressed purely in terms of what the kernel
/// needs to be correct.
pub trait Platform {
    /// Reads the free-running tick counter. Must be monotonic modulo
    /// `u32` wraparound; two calls less than `i32::MAX` ticks apart compare
    /// correctly under [`Timestamp::is_before`].
    fn now(&self) -> Timestamp;

    /// Blocks (typically `wfi`) until either an interrupt arrives or
    /// `max_ticks` have elapsed, whichever is first. `max_ticks == 0` must
    /// return immediately without sleeping; a platform with no tickless
    /// idle support is free to busy-wait.
    fn idle(&self, max_ticks: u32);

    /// Masks the interrupt sources that can mutate kernel state
    /// (anything that posts event bits or resumes a task) and returns a
    /// token proving the mask is held. Nesting must be supported: a
    /// platform that implements this with a simple disable/enable pair
    /// needs to track a nesting depth itself, since [`critical`] does not.
    fn enter_critical(&self) -> CriticalToken;

    /// Restores the interrupt mask state captured by a matching
    /// `enter_critical`.
    ///
    /// # Safety
    ///
    /// `token` must be the token most recently returned by
    /// `enter_critical` on this same `Platform` instance that has not yet
    /// been passed to `exit_critical`. Callers should use [`critical`]
    /// rather than calling this directly.
    unsafe fn exit_critical(&self, token: CriticalToken);

    /// Reports an unrecoverable invariant violation. Implementations
    /// typically log the message (if logging is wired up) and reset the
    /// device; this function's return type promises it never returns.
    fn assert_fail(&self, message: &'static str) -> !;

    /// A best-effort 32 bits of entropy, used only for non-cryptographic
    /// jitter (retry backoff). A platform with no hardware RNG can seed
    /// [`crate::rng::Xoshiro128PlusPlus`] once at boot from whatever noisy
    /// inputs it has (an uninitialized SRAM word, ADC floating-pin noise)
    /// and serve every call from that.
    fn entropy(&self) -> u32;
}

/// Opaque proof that [`Platform::enter_critical`] was called. Carries no
/// public fields; the only legal uses are "drop it" (via [`critical`]) or
/// hand it back to `exit_critical`.
#[derive(Debug)]
#[must_use]
pub struct CriticalToken(());

impl CriticalToken {
    /// Constructs a token. Only a `Platform` implementation should call
    /// this, from inside `enter_critical`.
    pub fn new() -> Self {
        Self(())
    }
}

impl Default for CriticalToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A scope-guard wrapper around a platform's critical section, replacing
/// the classic "lock/unlock by hand" pattern with one that can't be
/// mismatched: the mask lifts automatically when the guard drops, even if
/// the body returns early or panics.
pub struct CriticalSection<'p, P: Platform> {
    platform: &'p P,
    token: Option<CriticalToken>,
    _not_send: PhantomData<*const ()>,
}

impl<'p, P: Platform> Drop for CriticalSection<'p, P> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            // SAFETY: `token` was produced by this same platform's
            // `enter_critical` in `critical`, below, and has not been
            // passed to `exit_critical` before (it is only reachable
            // through `self.token`, taken exactly once here).
            unsafe { self.platform.exit_critical(token) };
        }
    }
}

/// Runs `body` with the platform's interrupt mask held, then lifts it.
/// This is the only supported way to enter a critical section in this
/// kernel; nothing outside this function calls `enter_critical` directly.
pub fn critical<P: Platform, R>(platform: &P, body: impl FnOnce() -> R) -> R {
    let guard = CriticalSection {
        platform,
        token: Some(platform.enter_critical()),
        _not_send: PhantomData,
    };
    let result = body();
    drop(guard);
    result
}

#[cfg(any(test, feature = "sim"))]
pub mod sim {
    //! A host-testable `Platform` backed by a plain `Cell`, used by this
    //! crate's own test suite and available to driver crates that want to
    //! exercise their state machines off-target.

    use super::*;
    use core::cell::Cell;

    pub struct SimPlatform {
        ticks: Cell<u32>,
        depth: Cell<u32>,
        rng: Cell<crate::rng::Xoshiro128PlusPlus>,
    }

    impl SimPlatform {
        pub fn new() -> Self {
            Self {
                ticks: Cell::new(0),
                depth: Cell::new(0),
                rng: Cell::new(crate::rng::Xoshiro128PlusPlus::new(0x5EED)),
            }
        }

        /// Advances the simulated tick counter. Tests drive this directly
        /// instead of waiting on real time.
        pub fn advance(&self, ticks: u32) {
            self.ticks.set(self.ticks.get().wrapping_add(ticks));
        }
    }

    impl Default for SimPlatform {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Platform for SimPlatform {
        fn now(&self) -> Timestamp {
            Timestamp::new(self.ticks.get())
        }

        fn idle(&self, max_ticks: u32) {
            // Host tests never actually want to block; treat idle as an
            // instantaneous tick advance so `step()` loops terminate.
            self.advance(max_ticks);
        }

        fn enter_critical(&self) -> CriticalToken {
            self.depth.set(self.depth.get() + 1);
            CriticalToken::new()
        }

        unsafe fn exit_critical(&self, _token: CriticalToken) {
            let d = self.depth.get();
            debug_assert!(d > 0, "exit_critical without a matching enter_critical");
            self.depth.set(d - 1);
        }

        fn assert_fail(&self, message: &'static str) -> ! {
            panic!("kernel assertion failed: {message}");
        }

        fn entropy(&self) -> u32 {
            let mut rng = self.rng.get();
            let v = rng.next_u32();
            self.rng.set(rng);
            v
        }
    }

    #[test]
    fn critical_nests_and_unwinds() {
        let p = SimPlatform::new();
        critical(&p, || {
            critical(&p, || {
                assert_eq!(p.depth.get(), 2);
            });
            assert_eq!(p.depth.get(), 1);
        });
        assert_eq!(p.depth.get(), 0);
    }

    #[test]
    fn idle_advances_clock() {
        let p = SimPlatform::new();
        assert_eq!(p.now(), Timestamp::new(0));
        p.idle(50);
        assert_eq!(p.now(), Timestamp::new(50));
    }
}
