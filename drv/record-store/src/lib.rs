// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The EEPROM record store (component H): a tag/length/value record
//! layer over a byte-addressable [`NvmDevice`].
//!
//! Records sit contiguously from offset 0 as `<tag><length><value>`,
//! terminated by an end-marker record whose tag is all-ones and whose
//! length is zero. Tag width and length width are const generics
//! (`TAG_BYTES`/`LEN_BYTES`), defaulting to 1/1 as the specification
//! requires; a 2/2 instantiation suits NVM3-shaped back ends. `MAX_VALUE`
//! bounds the largest value this instantiation will write — the
//! per-driver buffer size const generic this workspace uses everywhere
//! else a fixed-size scratch buffer stands in for dynamic allocation.
//!
//! Creating or writing a record is asynchronous (it goes through
//! [`NvmDevice::issue_write`]/`poll_write`), so both operations come in
//! two flavors: `record_create`/`record_write` block the caller by
//! busy-polling the worker state machine to completion (the
//! specification's "no callback supplied" default), while
//! `submit_create`/`submit_write` plus [`RecordStore::poll`] let a
//! scheduler-driven task interleave the wait with other work instead of
//! blocking its own tick function.

#![no_std]

use abi::{RecordError, FACTORY_RESET_KEY};
use drv_nvm_api::{NvmDevice, NvmOutcome};
use static_assertions::const_assert;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Created { tag: u32 },
    Written { tag: u32 },
    Scanned { tag: u32, found: bool },
    Fault { error: u8 },
}

ringbuf::ringbuf!(Trace, 32, Trace::None);

/// Maximum width this crate supports for either the tag or the length
/// field. Two bytes covers the specification's two named instantiations
/// (1/1 default, 2/2 for NVM3); a header never needs more than
/// `2 * MAX_FIELD_BYTES` bytes of scratch space.
const MAX_FIELD_BYTES: usize = 2;

fn encode_field(value: u32, width: usize, out: &mut [u8]) {
    out[..width].copy_from_slice(&value.to_le_bytes()[..width]);
}

fn decode_field(buf: &[u8], width: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes[..width].copy_from_slice(&buf[..width]);
    u32::from_le_bytes(bytes)
}

/// State machine driving one outstanding `record_create`/`record_write`
/// through its device writes. Create needs three: the header, the value,
/// and the new end marker; write needs only the one value write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    CreateHeader { tag: u32, length: u16, record_offset: u32 },
    CreateValue { tag: u32, length: u16, value_offset: u32, end_offset: u32 },
    CreateEndMarker { tag: u32, new_end_offset: u32 },
    Write { tag: u32, offset: u32, len: u16 },
}

/// A tag/length/value record store over a byte-addressable non-volatile
/// medium, as described in the specification's component H.
pub struct RecordStore<
    D: NvmDevice,
    const TAG_BYTES: usize = 1,
    const LEN_BYTES: usize = 1,
    const MAX_VALUE: usize = 64,
> {
    device: D,
    size: u32,
    end_offset: u32,
    is_main: bool,
    phase: Phase,
    scratch: [u8; MAX_VALUE],
}

impl<D: NvmDevice, const TAG_BYTES: usize, const LEN_BYTES: usize, const MAX_VALUE: usize>
    RecordStore<D, TAG_BYTES, LEN_BYTES, MAX_VALUE>
{
    const HEADER_SIZE: u32 = (TAG_BYTES + LEN_BYTES) as u32;

    /// The end-of-list sentinel: a tag whose every bit is set, paired
    /// with a zero length.
    pub const END_MARKER_TAG: u32 = Self::all_ones(TAG_BYTES);
    /// Set aside for a future deletion feature; never written by this
    /// implementation, per the specification.
    pub const RESERVED_DELETED_TAG: u32 = Self::END_MARKER_TAG - 1;

    const fn all_ones(width: usize) -> u32 {
        if width >= 4 {
            u32::MAX
        } else {
            (1u32 << (width * 8)) - 1
        }
    }

    pub fn new(device: D) -> Self {
        const_assert!(TAG_BYTES >= 1 && TAG_BYTES <= MAX_FIELD_BYTES);
        const_assert!(LEN_BYTES >= 1 && LEN_BYTES <= MAX_FIELD_BYTES);
        Self {
            device,
            size: 0,
            end_offset: 0,
            is_main: false,
            phase: Phase::Idle,
            scratch: [0u8; MAX_VALUE],
        }
    }

    /// True once `init` has published this instance as the process's main
    /// record store. `RecordStore` itself holds no global singleton (see
    /// the design notes): the caller's own `static` is the singleton, the
    /// way `drv-flash-driver`/`drv-i2c-driver` hold their `Kernel` in a
    /// `StaticCell`. This just remembers the flag for diagnostics.
    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn device_size(&self) -> u32 {
        self.size
    }

    fn header_buf(tag: u32, length: u32) -> [u8; MAX_FIELD_BYTES * 2] {
        let mut buf = [0u8; MAX_FIELD_BYTES * 2];
        encode_field(tag, TAG_BYTES, &mut buf);
        encode_field(length, LEN_BYTES, &mut buf[TAG_BYTES..]);
        buf
    }

    /// Linear scan from offset 0 for `tag`, stopping either when it's
    /// found or when the end marker is reached first.
    fn scan(&mut self, tag: u32) -> Result<ScanResult, RecordError> {
        let mut offset = 0u32;
        loop {
            if offset + Self::HEADER_SIZE > self.size {
                return Err(RecordError::FormattingError);
            }
            let mut header = [0u8; MAX_FIELD_BYTES * 2];
            self.device
                .read(offset, &mut header[..Self::HEADER_SIZE as usize]);
            let found_tag = decode_field(&header, TAG_BYTES);
            let length = decode_field(&header[TAG_BYTES..], LEN_BYTES);
            if found_tag == Self::END_MARKER_TAG && length == 0 {
                ringbuf::ringbuf_entry!(Trace::Scanned { tag, found: false });
                return Ok(ScanResult::EndMarker { offset });
            }
            if found_tag == tag {
                ringbuf::ringbuf_entry!(Trace::Scanned { tag, found: true });
                return Ok(ScanResult::Found {
                    offset,
                    length: length as u16,
                });
            }
            offset += Self::HEADER_SIZE + length;
        }
    }

    /// Validates the existing on-device header by linear scan, or clears
    /// the medium to a fresh end marker if `factory_reset` (after
    /// checking `reset_key`). Sets the "main instance" flag per
    /// `is_main`.
    pub fn init(
        &mut self,
        is_main: bool,
        factory_reset: bool,
        reset_key: u32,
    ) -> Result<(), RecordError> {
        self.size = self.device.init();
        if factory_reset {
            if reset_key != FACTORY_RESET_KEY {
                return Err(RecordError::InvalidResetKey);
            }
            let marker = Self::header_buf(Self::END_MARKER_TAG, 0);
            self.blocking_write(0, &marker[..Self::HEADER_SIZE as usize])?;
            self.end_offset = 0;
        } else {
            // `scan` always checks for the end marker before comparing
            // against its requested tag, so scanning *for* the end
            // marker tag walks the whole existing record list and stops
            // there — exactly the linear-scan header validation `init`
            // needs, with no separate code path required.
            match self.scan(Self::END_MARKER_TAG)? {
                ScanResult::EndMarker { offset } => self.end_offset = offset,
                ScanResult::Found { .. } => unreachable!("scan reports the end marker first"),
            }
        }
        self.is_main = is_main;
        Ok(())
    }

    /// Busy-polls a single device write to completion; used by `init`'s
    /// factory-reset path and by the blocking record operations, matching
    /// the specification's "if no callback is supplied, the call blocks
    /// by busy-polling the worker."
    fn blocking_write(&mut self, offset: u32, data: &[u8]) -> Result<(), RecordError> {
        if !self.device.issue_write(offset, data) {
            return Err(RecordError::NotReady);
        }
        loop {
            match self.device.poll_write() {
                None => continue,
                Some(NvmOutcome::Success) => return Ok(()),
                Some(NvmOutcome::Error) => return Err(RecordError::FatalError),
            }
        }
    }

    /// Creates a new record with the given tag and initial value,
    /// blocking until the write completes.
    pub fn record_create(
        &mut self,
        tag: u32,
        default_value: &[u8],
        length: u16,
    ) -> Result<(), RecordError> {
        self.submit_create(tag, default_value, length)?;
        loop {
            if let Some(result) = self.poll() {
                return result;
            }
        }
    }

    /// Non-blocking create: validates and issues the first of the three
    /// writes `record_create` needs, then returns immediately. Callers
    /// drive it to completion with repeated [`RecordStore::poll`] calls.
    pub fn submit_create(
        &mut self,
        tag: u32,
        default_value: &[u8],
        length: u16,
    ) -> Result<(), RecordError> {
        if self.phase != Phase::Idle {
            return Err(RecordError::NotReady);
        }
        if tag == Self::END_MARKER_TAG || tag == Self::RESERVED_DELETED_TAG {
            return Err(RecordError::InvalidTag);
        }
        if length as usize > MAX_VALUE || default_value.len() != length as usize {
            return Err(RecordError::InvalidLength);
        }
        let record_offset = match self.scan(tag)? {
            ScanResult::Found { .. } => return Err(RecordError::TagExists),
            ScanResult::EndMarker { offset } => offset,
        };
        let needed = Self::HEADER_SIZE + length as u32 + Self::HEADER_SIZE;
        if record_offset + needed > self.size {
            return Err(RecordError::OutOfMemory);
        }
        self.scratch[..length as usize].copy_from_slice(default_value);
        let header = Self::header_buf(tag, length as u32);
        if !self
            .device
            .issue_write(record_offset, &header[..Self::HEADER_SIZE as usize])
        {
            return Err(RecordError::NotReady);
        }
        self.phase = Phase::CreateHeader {
            tag,
            length,
            record_offset,
        };
        Ok(())
    }

    /// Writes a new value into an existing record, blocking until the
    /// write completes.
    pub fn record_write(&mut self, tag: u32, data: &[u8], size: u16) -> Result<(), RecordError> {
        self.submit_write(tag, data, size)?;
        loop {
            if let Some(result) = self.poll() {
                return result;
            }
        }
    }

    /// Non-blocking write: validates, issues the single device write, and
    /// returns. Drive to completion with [`RecordStore::poll`].
    pub fn submit_write(&mut self, tag: u32, data: &[u8], size: u16) -> Result<(), RecordError> {
        if self.phase != Phase::Idle {
            return Err(RecordError::NotReady);
        }
        let (offset, stored_length) = match self.scan(tag)? {
            ScanResult::Found { offset, length } => (offset, length),
            ScanResult::EndMarker { .. } => return Err(RecordError::NoRecord),
        };
        if size != stored_length || size as usize != data.len() || size as usize > MAX_VALUE {
            return Err(RecordError::InvalidLength);
        }
        let value_offset = offset + Self::HEADER_SIZE;
        self.scratch[..size as usize].copy_from_slice(data);
        if !self
            .device
            .issue_write(value_offset, &self.scratch[..size as usize])
        {
            return Err(RecordError::NotReady);
        }
        self.phase = Phase::Write {
            tag,
            offset: value_offset,
            len: size,
        };
        Ok(())
    }

    /// Issues the end-marker write that follows a successful header or
    /// value write in `record_create`, advancing to `CreateEndMarker`.
    fn issue_end_marker(&mut self, tag: u32, end_offset: u32) -> Option<Result<(), RecordError>> {
        let marker = Self::header_buf(Self::END_MARKER_TAG, 0);
        if !self
            .device
            .issue_write(end_offset, &marker[..Self::HEADER_SIZE as usize])
        {
            self.phase = Phase::Idle;
            return Some(Err(RecordError::NotReady));
        }
        self.phase = Phase::CreateEndMarker {
            tag,
            new_end_offset: end_offset,
        };
        None
    }

    /// Advances the in-flight create/write one step. Returns `Some` with
    /// the final outcome once the whole operation (all phases) has
    /// completed; `None` while still busy.
    pub fn poll(&mut self) -> Option<Result<(), RecordError>> {
        match self.phase {
            Phase::Idle => None,
            Phase::Write { tag, .. } => match self.device.poll_write()? {
                NvmOutcome::Success => {
                    self.phase = Phase::Idle;
                    ringbuf::ringbuf_entry!(Trace::Written { tag });
                    Some(Ok(()))
                }
                NvmOutcome::Error => {
                    self.phase = Phase::Idle;
                    ringbuf::ringbuf_entry!(Trace::Fault {
                        error: RecordError::FatalError as u8,
                    });
                    Some(Err(RecordError::FatalError))
                }
            },
            Phase::CreateHeader {
                tag,
                length,
                record_offset,
            } => match self.device.poll_write()? {
                NvmOutcome::Error => {
                    self.phase = Phase::Idle;
                    Some(Err(RecordError::FatalError))
                }
                NvmOutcome::Success => {
                    let value_offset = record_offset + Self::HEADER_SIZE;
                    let end_offset = value_offset + length as u32;
                    if length == 0 {
                        // No payload bytes to write; go straight to the
                        // end-marker write.
                        return self.issue_end_marker(tag, end_offset);
                    }
                    if !self
                        .device
                        .issue_write(value_offset, &self.scratch[..length as usize])
                    {
                        self.phase = Phase::Idle;
                        return Some(Err(RecordError::NotReady));
                    }
                    self.phase = Phase::CreateValue {
                        tag,
                        length,
                        value_offset,
                        end_offset,
                    };
                    None
                }
            },
            Phase::CreateValue { tag, end_offset, .. } => match self.device.poll_write()? {
                NvmOutcome::Error => {
                    self.phase = Phase::Idle;
                    Some(Err(RecordError::FatalError))
                }
                NvmOutcome::Success => self.issue_end_marker(tag, end_offset),
            },
            Phase::CreateEndMarker { tag, new_end_offset } => match self.device.poll_write()? {
                NvmOutcome::Error => {
                    self.phase = Phase::Idle;
                    Some(Err(RecordError::FatalError))
                }
                NvmOutcome::Success => {
                    self.end_offset = new_end_offset;
                    self.phase = Phase::Idle;
                    ringbuf::ringbuf_entry!(Trace::Created { tag });
                    Some(Ok(()))
                }
            },
        }
    }

    /// Synchronous bounded read from inside a record's value region.
    pub fn record_read(&mut self, tag: u32, dst: &mut [u8], offset: u16) -> Result<(), RecordError> {
        let (record_offset, length) = match self.scan(tag)? {
            ScanResult::Found {
                offset: record_offset,
                length,
            } => (record_offset, length),
            ScanResult::EndMarker { .. } => return Err(RecordError::NoRecord),
        };
        let end = offset as u32 + dst.len() as u32;
        if end > length as u32 {
            return Err(RecordError::InvalidLength);
        }
        let value_offset = record_offset + Self::HEADER_SIZE + offset as u32;
        self.device.read(value_offset, dst);
        Ok(())
    }

    /// Synchronous read of an entire record's value, with stored-size
    /// discovery. `dst` must be at least as large as the stored length.
    pub fn record_read_all(
        &mut self,
        tag: u32,
        dst: &mut [u8],
    ) -> Result<u16, RecordError> {
        let (record_offset, length) = match self.scan(tag)? {
            ScanResult::Found {
                offset: record_offset,
                length,
            } => (record_offset, length),
            ScanResult::EndMarker { .. } => return Err(RecordError::NoRecord),
        };
        if length as usize > dst.len() {
            return Err(RecordError::InvalidLength);
        }
        let value_offset = record_offset + Self::HEADER_SIZE;
        self.device.read(value_offset, &mut dst[..length as usize]);
        Ok(length)
    }

    /// Periodic housekeeping hook; wires straight through to the back
    /// end's own `housekeeping`. Intended to be called from the worker's
    /// Idle-state tick on platforms (NVM3) that want periodic repack.
    pub fn housekeeping(&mut self) {
        self.device.housekeeping();
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ScanResult {
    Found { offset: u32, length: u16 },
    EndMarker { offset: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_nvm_api::sim::SimNvm;

    type Store = RecordStore<SimNvm<256>, 1, 1, 64>;

    fn new_store() -> Store {
        let mut s: Store = RecordStore::new(SimNvm::new());
        // A fresh medium reads back as all-`0xff` (erased flash/EEPROM
        // convention, see `SimNvm::new`); it must be factory-reset once
        // before `init` can verify it as a formatted header.
        assert_eq!(s.init(true, true, FACTORY_RESET_KEY), Ok(()));
        s
    }

    #[test]
    fn create_then_read_round_trips() {
        let mut store = new_store();
        assert_eq!(store.record_create(7, &[1, 2, 3, 4], 4), Ok(()));
        let mut buf = [0u8; 4];
        assert_eq!(store.record_read_all(7, &mut buf), Ok(4));
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let mut store = new_store();
        assert_eq!(store.record_create(2, &[0xaa], 1), Ok(()));
        assert_eq!(
            store.record_create(2, &[0xbb], 1),
            Err(RecordError::TagExists)
        );
    }

    #[test]
    fn write_rejects_length_mismatch() {
        let mut store = new_store();
        assert_eq!(store.record_create(5, &[0, 0], 2), Ok(()));
        assert_eq!(
            store.record_write(5, &[1, 2, 3], 3),
            Err(RecordError::InvalidLength)
        );
    }

    #[test]
    fn write_updates_existing_value() {
        let mut store = new_store();
        assert_eq!(store.record_create(9, &[0, 0], 2), Ok(()));
        assert_eq!(store.record_write(9, &[0x11, 0x22], 2), Ok(()));
        let mut buf = [0u8; 2];
        assert_eq!(store.record_read_all(9, &mut buf), Ok(2));
        assert_eq!(buf, [0x11, 0x22]);
    }

    #[test]
    fn missing_tag_reports_no_record() {
        let mut store = new_store();
        let mut buf = [0u8; 1];
        assert_eq!(
            store.record_read_all(99, &mut buf),
            Err(RecordError::NoRecord)
        );
        assert_eq!(
            store.record_write(99, &[1], 1),
            Err(RecordError::NoRecord)
        );
    }

    #[test]
    fn out_of_memory_when_device_is_full() {
        let mut s: RecordStore<SimNvm<6>, 1, 1, 8> = RecordStore::new(SimNvm::new());
        assert_eq!(s.init(true, true, FACTORY_RESET_KEY), Ok(()));
        // Device is 6 bytes; an end marker (2 bytes) is already there,
        // leaving 4 bytes — a 1-byte record needs header(2) + value(1) +
        // new end marker(2) = 5, which does not fit.
        assert_eq!(
            s.record_create(1, &[0xaa], 1),
            Err(RecordError::OutOfMemory)
        );
    }

    #[test]
    fn factory_reset_requires_correct_key() {
        let mut s: Store = RecordStore::new(SimNvm::new());
        assert_eq!(
            s.init(true, true, 0xdead_beef),
            Err(RecordError::InvalidResetKey)
        );
        assert_eq!(s.init(true, true, FACTORY_RESET_KEY), Ok(()));
    }

    #[test]
    fn end_marker_survives_interleaved_creates() {
        // Mirrors the specification's end-to-end scenario 6: create tags
        // 1, 2, 3 in order, confirm a duplicate scan for 2 is rejected,
        // then insert a new tag 4 immediately before the end marker and
        // confirm every record reads back unchanged.
        let mut store = new_store();
        assert_eq!(store.record_create(1, &[0xaa; 4], 4), Ok(()));
        assert_eq!(store.record_create(2, &[0xbb; 2], 2), Ok(()));
        assert_eq!(store.record_create(3, &[0xcc; 8], 8), Ok(()));
        assert_eq!(
            store.record_create(2, &[0; 2], 2),
            Err(RecordError::TagExists)
        );
        assert_eq!(store.record_create(4, &[0xdd; 3], 3), Ok(()));

        let mut buf1 = [0u8; 4];
        assert_eq!(store.record_read_all(1, &mut buf1), Ok(4));
        assert_eq!(buf1, [0xaa; 4]);
        let mut buf2 = [0u8; 2];
        assert_eq!(store.record_read_all(2, &mut buf2), Ok(2));
        assert_eq!(buf2, [0xbb; 2]);
        let mut buf3 = [0u8; 8];
        assert_eq!(store.record_read_all(3, &mut buf3), Ok(8));
        assert_eq!(buf3, [0xcc; 8]);
        let mut buf4 = [0u8; 3];
        assert_eq!(store.record_read_all(4, &mut buf4), Ok(3));
        assert_eq!(buf4, [0xdd; 3]);
    }

    #[test]
    fn reopening_an_existing_device_preserves_records() {
        let mut s1: Store = RecordStore::new(SimNvm::new());
        assert_eq!(s1.init(true, true, FACTORY_RESET_KEY), Ok(()));
        assert_eq!(s1.record_create(1, &[7, 7], 2), Ok(()));

        let dev = s1.device;
        let mut s2: Store = RecordStore::new(dev);
        assert_eq!(s2.init(false, false, 0), Ok(()));
        let mut buf = [0u8; 2];
        assert_eq!(s2.record_read_all(1, &mut buf), Ok(2));
        assert_eq!(buf, [7, 7]);
    }

    #[test]
    fn two_byte_tag_and_length_instantiation_round_trips() {
        let mut s: RecordStore<SimNvm<256>, 2, 2, 64> = RecordStore::new(SimNvm::new());
        assert_eq!(s.init(true, true, FACTORY_RESET_KEY), Ok(()));
        assert_eq!(s.record_create(300, &[1, 2, 3, 4, 5], 5), Ok(()));
        let mut buf = [0u8; 5];
        assert_eq!(s.record_read_all(300, &mut buf), Ok(5));
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn record_read_bounds_checks_offset_and_size() {
        let mut store = new_store();
        assert_eq!(store.record_create(1, &[1, 2, 3, 4], 4), Ok(()));
        let mut buf = [0u8; 2];
        assert_eq!(store.record_read(1, &mut buf, 2), Ok(()));
        assert_eq!(buf, [3, 4]);
        let mut too_far = [0u8; 2];
        assert_eq!(
            store.record_read(1, &mut too_far, 3),
            Err(RecordError::InvalidLength)
        );
    }
}
