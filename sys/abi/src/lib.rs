// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the scheduler, the driver
//! contract, and the record store.
//!
//! This crate carries only the types that cross a module boundary that
//! matters for correctness: the value a task's tick function returns, and
//! the completion event word a driver back end writes from interrupt
//! context. Everything else (queue pointers, buffer internals) stays
//! private to the crate that owns it.

#![no_std]

/// Default fixed-size segment used by the memory pool when a crate doesn't
/// otherwise specify one. Must be a multiple of 4.
pub const DEFAULT_SEGMENT_SIZE: usize = 64;

/// Buffers and streams never exceed this many bytes; the wire formats in
/// this workspace (record lengths, stream capacities) all fit in a `u16`.
pub const MAX_LOGICAL_SIZE: usize = 65535;

/// A task's tick function returns one of these to tell the scheduler what
/// to do with it next. See `kern::sched` for how each variant is handled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum TaskStatus {
    /// Take the task out of every queue. It stays parked until something
    /// calls `task_resume` on it.
    Suspend,
    /// Put the task at the tail of the ready queue; it runs again on this
    /// same `step()` if nothing else is ready, or on the next one.
    RunImmediate,
    /// Schedule the task to become ready no sooner than `delay` ticks from
    /// now. Unlike `RunAfter`, this deadline is allowed to shorten the
    /// platform's next idle duration.
    RunLater(u32),
    /// Schedule the task to become ready no sooner than `delay` ticks from
    /// now, but opportunistically: the scheduler will not idle *for* this
    /// deadline, only notice it if something else wakes the system up
    /// first.
    RunAfter(u32),
    /// Equivalent to `RunAfter(0)` — join the background queue and get
    /// picked up whenever the system happens to be awake.
    RunBackground,
}

impl TaskStatus {
    /// True for the two variants the scheduler treats as "background":
    /// `RunAfter` and `RunBackground`. `RunLater` is "scheduled" instead,
    /// and participates in the computed idle duration.
    pub fn is_background(&self) -> bool {
        matches!(self, TaskStatus::RunAfter(_) | TaskStatus::RunBackground)
    }

    /// The requested delay in ticks, for the two delayed variants. Zero for
    /// every other variant.
    pub fn delay(&self) -> u32 {
        match self {
            TaskStatus::RunLater(d) | TaskStatus::RunAfter(d) => *d,
            _ => 0,
        }
    }
}

/// Outcome of a driver transaction, as packed into the low 8 bits of a
/// [`CompletionEvent`]. Individual driver families (I2C, SPI, flash) may
/// narrow this down to a smaller subset or wrap it in a more specific
/// public enum, but the numeric values are shared so a back end ISR can
/// write one without knowing which higher-level API is listening.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DriverStatus {
    Success = 0,
    /// The target did not acknowledge (I2C NACK, or an analogous SPI/flash
    /// "device not present" condition).
    Nack = 1,
    /// The bus itself faulted (arbitration loss, clock stretch timeout,
    /// electrical bus error) and was reset by the back end.
    BusError = 2,
    /// The back end's own timeout expired waiting for hardware.
    Timeout = 3,
    /// The transfer completed, but its actual size exceeded what the
    /// driver had room to report; the driver clamps and the caller sees
    /// `Overflow` at the API layer.
    Overflow = 4,
    /// A transport-specific fault distinct from the above; the kernel just
    /// passes this through as `DriverError`.
    DriverError = 5,
    /// Write attempted against a flash region whose write-enable latch was
    /// not set.
    WriteLocked = 6,
}

impl DriverStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Success,
            1 => Self::Nack,
            2 => Self::BusError,
            3 => Self::Timeout,
            4 => Self::Overflow,
            5 => Self::DriverError,
            6 => Self::WriteLocked,
            _ => return None,
        })
    }
}

/// The 32-bit word a driver back end writes atomically, from interrupt
/// context, to report that a transaction has completed.
///
/// Layout (bit 0 is least significant):
///
/// ```text
/// 31        30 29       24 23                    8 7        0
/// +-----------+-----------+-----------------------+----------+
/// | complete  | flash wr  |     transfer size      |  status  |
/// +-----------+-----------+-----------------------+----------+
/// ```
///
/// Bits 29/30 (the flash write-enable/write-disable flags) are only
/// meaningful to the flash driver; every other family leaves them clear.
/// This layout must not change: it is the literal boundary a hardware
/// back end's ISR writes across without going through any Rust API.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CompletionEvent(u32);

impl CompletionEvent {
    const STATUS_MASK: u32 = 0xff;
    const SIZE_SHIFT: u32 = 8;
    const SIZE_MASK: u32 = 0xffff;
    const FLASH_WRITE_ENABLED_BIT: u32 = 1 << 29;
    const FLASH_WRITE_DISABLED_BIT: u32 = 1 << 30;
    const COMPLETE_BIT: u32 = 1 << 31;

    /// Builds the word a back end ISR would write for a completed transfer.
    pub fn complete(status: DriverStatus, size: u16) -> Self {
        Self(
            Self::COMPLETE_BIT
                | ((size as u32 & Self::SIZE_MASK) << Self::SIZE_SHIFT)
                | (status as u32 & Self::STATUS_MASK),
        )
    }

    /// Builds a flash-specific completion carrying the write-enable state.
    pub fn complete_flash(
        status: DriverStatus,
        size: u16,
        write_enabled: bool,
    ) -> Self {
        let base = Self::complete(status, size);
        let flag = if write_enabled {
            Self::FLASH_WRITE_ENABLED_BIT
        } else {
            Self::FLASH_WRITE_DISABLED_BIT
        };
        Self(base.0 | flag)
    }

    /// Reinterprets a raw 32-bit word, as read from the ISR-shared event
    /// bits, as a `CompletionEvent`. There is no invalid bit pattern: every
    /// `u32` decodes to *something*, though `status()` may not map to a
    /// known `DriverStatus`.
    pub fn from_raw(word: u32) -> Self {
        Self(word)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_complete(self) -> bool {
        self.0 & Self::COMPLETE_BIT != 0
    }

    pub fn status_raw(self) -> u8 {
        (self.0 & Self::STATUS_MASK) as u8
    }

    pub fn status(self) -> Option<DriverStatus> {
        DriverStatus::from_u8(self.status_raw())
    }

    pub fn size(self) -> u16 {
        ((self.0 >> Self::SIZE_SHIFT) & Self::SIZE_MASK) as u16
    }

    pub fn flash_write_enabled(self) -> bool {
        self.0 & Self::FLASH_WRITE_ENABLED_BIT != 0
    }

    pub fn flash_write_disabled(self) -> bool {
        self.0 & Self::FLASH_WRITE_DISABLED_BIT != 0
    }
}

/// Errors the EEPROM record store (component H) reports back to its
/// caller. `Success` is deliberately absent — operations that succeed
/// return `Ok(())`/`Ok(T)`; this enum only names failure modes, matching
/// the taxonomy in the specification's error handling section.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordError {
    /// The back end reported a failure that isn't one of the more specific
    /// cases below (hardware fault, ECC error, and the like).
    FatalError,
    /// The back end hasn't finished a prior asynchronous operation yet.
    NotReady,
    /// No record exists with the requested tag.
    NoRecord,
    /// There is no room before the device's end to fit a new record.
    OutOfMemory,
    /// `record_create` was called for a tag that already has a record.
    TagExists,
    /// The existing header on the device did not parse as a valid record
    /// stream during `init`.
    FormattingError,
    /// The requested tag collides with a reserved value (the end marker or
    /// the tag reserved for future deletion support).
    InvalidTag,
    /// `record_write`'s size did not match the record's stored length.
    InvalidLength,
    /// `init` was asked to perform a factory reset with the wrong key.
    InvalidResetKey,
}

/// The fixed 32-bit key that must accompany a factory-reset request to
/// `drv_record_store::RecordStore::init`. Chosen to not collide with an
/// all-zero or all-one buffer left over from an erased device.
pub const FACTORY_RESET_KEY: u32 = 0x4652_4B59; // "FRKY"

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_event_round_trips_fields() {
        let ev = CompletionEvent::complete(DriverStatus::Nack, 1234);
        assert!(ev.is_complete());
        assert_eq!(ev.status(), Some(DriverStatus::Nack));
        assert_eq!(ev.size(), 1234);
        assert!(!ev.flash_write_enabled());
        assert!(!ev.flash_write_disabled());
    }

    #[test]
    fn flash_completion_carries_write_flags() {
        let ev = CompletionEvent::complete_flash(
            DriverStatus::Success,
            0,
            true,
        );
        assert!(ev.flash_write_enabled());
        assert!(!ev.flash_write_disabled());
    }

    #[test]
    fn task_status_background_classification() {
        assert!(!TaskStatus::Suspend.is_background());
        assert!(!TaskStatus::RunImmediate.is_background());
        assert!(!TaskStatus::RunLater(10).is_background());
        assert!(TaskStatus::RunAfter(10).is_background());
        assert!(TaskStatus::RunBackground.is_background());
    }

    #[test]
    fn task_status_delay_extraction() {
        assert_eq!(TaskStatus::RunLater(42).delay(), 42);
        assert_eq!(TaskStatus::RunAfter(7).delay(), 7);
        assert_eq!(TaskStatus::RunImmediate.delay(), 0);
        assert_eq!(TaskStatus::Suspend.delay(), 0);
    }
}
