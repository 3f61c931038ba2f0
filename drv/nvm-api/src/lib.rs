// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability trait for a byte-addressable non-volatile medium (component
//! G, the EEPROM/NVM3 back-end variant of the driver contract).
//!
//! `drv-record-store` is generic over [`NvmDevice`] instead of holding an
//! opaque hardware-state pointer and a `void*` config, per the REDESIGN
//! FLAGS guidance to replace that pattern with a capability trait
//! parametric over the driver's own state type. The shape mirrors
//! `drv-flash-driver`'s `FlashBackend`: a synchronous fast path for reads,
//! an issue/poll pair for the one write that may be in flight at a time.

#![no_std]

/// Outcome of a back end's asynchronous write, as reported by
/// [`NvmDevice::poll_write`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NvmOutcome {
    Success,
    /// The back end's own hardware write failed (ECC fault, write-protect
    /// latch, ...); the record store reports this up as
    /// [`abi::RecordError::FatalError`].
    Error,
}

/// What a board support package provides the record store: medium size
/// discovery, a synchronous read (the spec's "fast path"), and an
/// asynchronous write the caller polls to completion.
///
/// Exactly one write may be outstanding at a time; `issue_write` returns
/// `false` if one already is, and the record store never calls it again
/// before `poll_write` has reported the prior one done.
pub trait NvmDevice {
    /// Discovers the medium's usable size in bytes (at most
    /// [`abi::MAX_LOGICAL_SIZE`]) and performs whatever one-time setup the
    /// back end needs. Called once from `RecordStore::init`.
    fn init(&mut self) -> u32;

    /// Synchronous read of `buf.len()` bytes starting at `offset`. Must
    /// not be called with a range outside what `init` reported; the
    /// record store bounds-checks before calling.
    fn read(&mut self, offset: u32, buf: &mut [u8]);

    /// Issues an asynchronous write of `data` at `offset`. Returns `false`
    /// if the back end is still busy with a previously issued write (the
    /// record store never does this; it is here for back ends shared with
    /// other callers).
    fn issue_write(&mut self, offset: u32, data: &[u8]) -> bool;

    /// Polls for completion of the most recently issued write. Returns
    /// `None` while still in flight.
    fn poll_write(&mut self) -> Option<NvmOutcome>;

    /// Periodic housekeeping hook (repack / garbage collection) for back
    /// ends that need it, like the NVM3 variant named in the
    /// specification. The default no-op suits a plain byte-addressable
    /// EEPROM, which has nothing to repack.
    fn housekeeping(&mut self) {}
}

#[cfg(any(test, feature = "sim"))]
pub mod sim {
    //! A host-testable [`NvmDevice`] backed by a plain byte array, used by
    //! `drv-record-store`'s own test suite. Mirrors
    //! `kern::platform::sim::SimPlatform`: synchronous under the hood, but
    //! shaped like the asynchronous contract callers actually use.

    use super::*;

    /// `N` bytes of simulated medium. Writes complete on the poll *after*
    /// the one they were issued on, so tests exercise the same two-step
    /// issue/poll shape a real back end would need.
    pub struct SimNvm<const N: usize> {
        data: [u8; N],
        pending: Option<Pending>,
        pub fail_next_write: bool,
    }

    struct Pending {
        ready: bool,
        outcome: NvmOutcome,
    }

    impl<const N: usize> SimNvm<N> {
        pub fn new() -> Self {
            Self {
                data: [0xff; N],
                pending: None,
                fail_next_write: false,
            }
        }

        /// Direct peek at the backing store, for test assertions.
        pub fn bytes(&self) -> &[u8] {
            &self.data
        }
    }

    impl<const N: usize> Default for SimNvm<N> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<const N: usize> NvmDevice for SimNvm<N> {
        fn init(&mut self) -> u32 {
            N as u32
        }

        fn read(&mut self, offset: u32, buf: &mut [u8]) {
            let start = offset as usize;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
        }

        fn issue_write(&mut self, offset: u32, data: &[u8]) -> bool {
            if self.pending.is_some() {
                return false;
            }
            let outcome = if self.fail_next_write {
                self.fail_next_write = false;
                NvmOutcome::Error
            } else {
                let start = offset as usize;
                self.data[start..start + data.len()].copy_from_slice(data);
                NvmOutcome::Success
            };
            self.pending = Some(Pending {
                ready: false,
                outcome,
            });
            true
        }

        fn poll_write(&mut self) -> Option<NvmOutcome> {
            let pending = self.pending.as_mut()?;
            if !pending.ready {
                pending.ready = true;
                return None;
            }
            let outcome = pending.outcome;
            self.pending = None;
            Some(outcome)
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut dev: SimNvm<64> = SimNvm::new();
        assert_eq!(dev.init(), 64);
        assert!(dev.issue_write(4, &[1, 2, 3]));
        assert_eq!(dev.poll_write(), None);
        assert_eq!(dev.poll_write(), Some(NvmOutcome::Success));
        let mut buf = [0u8; 3];
        dev.read(4, &mut buf);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn second_write_refused_while_one_in_flight() {
        let mut dev: SimNvm<64> = SimNvm::new();
        dev.init();
        assert!(dev.issue_write(0, &[9]));
        assert!(!dev.issue_write(1, &[9]));
    }
}
