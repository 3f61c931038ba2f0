// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-facing API for a shared I2C bus (component G, I2C variant).
//!
//! A [`Device`] is one bus target: a fixed 7-bit address, a transmit
//! stream the bus controller drains requests from, and a receive stream
//! the controller fills with a response. The wire format on both
//! streams is a two-byte header — `(write_size, read_size)` on the
//! transmit side, `(status, size)` on the receive side — followed by
//! however many payload bytes the header names. Everything here is
//! `no_std` and touches only [`kern::stream`]/[`kern::pool`]; the bus
//! controller that drains these streams according to the state machine
//! in the device contract lives in `drv-i2c-driver`.

#![no_std]

use abi::DriverStatus;
use kern::buffer::Buffer;
use kern::pool::Pool;
use kern::sched::Scheduler;
use kern::stream::Stream;
use kern::task::TaskIdx;

/// Size, in bytes, of the request header (`write_size`, `read_size`)
/// and the response header (`status`, `size`).
pub const HEADER_SIZE: u16 = 2;

/// Per-device bookkeeping the client side of the API uses to reject a
/// second request issued before the first one's response has been
/// consumed. The bus controller does not consult this field: it
/// selects devices purely by scanning transmit streams for a pending
/// header (spec component G).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceState {
    Idle,
    Writing,
    Reading,
}

/// Outcome of [`Device::write_complete`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    /// No response has been written to the receive stream yet.
    Writing,
    /// The controller finished the transfer with this status.
    Done(DriverStatus),
}

/// Outcome of [`Device::read_complete`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// No response has been written to the receive stream yet.
    Reading,
    /// The response was larger than the caller's buffer; the excess
    /// payload bytes were drained and discarded.
    Overflow,
    /// The controller finished the transfer with this status; `size`
    /// bytes of `buf` were filled.
    Done(DriverStatus, u16),
}

/// One I2C bus target, with its own transmit/receive streams.
pub struct Device<const SEG: usize = 64> {
    address: u8,
    state: DeviceState,
    tx: Stream<SEG>,
    rx: Stream<SEG>,
}

impl<const SEG: usize> Device<SEG> {
    pub fn new(address: u8, tx_capacity: u16, rx_capacity: u16) -> Self {
        Self {
            address,
            state: DeviceState::Idle,
            tx: Stream::new(tx_capacity),
            rx: Stream::new(rx_capacity),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Binds the task that should be resumed when a request header
    /// lands on this device's transmit stream — the bus controller.
    pub fn bind_controller(&mut self, controller: TaskIdx) {
        self.tx.bind_consumer(controller);
    }

    /// Binds the task that should be resumed when a response lands on
    /// this device's receive stream — the client.
    pub fn bind_client(&mut self, client: TaskIdx) {
        self.rx.bind_consumer(client);
    }

    /// Accessors the bus controller uses while draining a request; not
    /// meant for client code.
    pub fn tx_mut(&mut self) -> &mut Stream<SEG> {
        &mut self.tx
    }

    pub fn rx_mut(&mut self) -> &mut Stream<SEG> {
        &mut self.rx
    }

    pub fn set_state(&mut self, state: DeviceState) {
        self.state = state;
    }

    /// Issues a write-only request: `data` is sent, nothing is read
    /// back beyond the status. Fails without side effects if the
    /// device is mid-transaction or the header plus `data` won't fit.
    pub fn write_request<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        data: &[u8],
    ) -> bool {
        self.indexed_read_request(pool, sched, data, 0)
    }

    /// Issues a read-only request for `read_size` bytes, with no write
    /// payload.
    pub fn read_request<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        read_size: u8,
    ) -> bool {
        self.indexed_read_request(pool, sched, &[], read_size)
    }

    /// Issues a write-then-read request: `data` (commonly a register
    /// index) is written, then `read_size` bytes are read back in the
    /// same transaction.
    pub fn indexed_read_request<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        data: &[u8],
        read_size: u8,
    ) -> bool {
        if self.state != DeviceState::Idle {
            return false;
        }
        let write_size = match u8::try_from(data.len()) {
            Ok(n) => n,
            Err(_) => return false,
        };
        let mut scratch: Buffer<SEG> = Buffer::new();
        if !scratch.append(pool, &[write_size, read_size]) {
            return false;
        }
        if !data.is_empty() && !scratch.append(pool, data) {
            scratch.reset(pool);
            return false;
        }
        if !self.tx.write_buffer(pool, sched, &mut scratch) {
            scratch.reset(pool);
            return false;
        }
        self.state = if read_size == 0 {
            DeviceState::Writing
        } else {
            DeviceState::Reading
        };
        true
    }

    /// Polls for the completion of a [`Device::write_request`]. Returns
    /// `Writing` until the controller has posted a response header.
    pub fn write_complete<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
    ) -> WriteOutcome {
        match self.read_complete(pool, &mut []) {
            ReadOutcome::Reading => WriteOutcome::Writing,
            ReadOutcome::Overflow => {
                // No payload was requested, so a response can never
                // overflow a zero-length buffer; treat a (status, 0)
                // header the same as Done.
                WriteOutcome::Done(DriverStatus::DriverError)
            }
            ReadOutcome::Done(status, _) => WriteOutcome::Done(status),
        }
    }

    /// Polls for the completion of a [`Device::read_request`] or
    /// [`Device::indexed_read_request`], copying up to `buf.len()`
    /// response bytes in.
    pub fn read_complete<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        buf: &mut [u8],
    ) -> ReadOutcome {
        if self.rx.get_read_capacity() < HEADER_SIZE {
            return ReadOutcome::Reading;
        }
        let mut header = [0u8; 2];
        self.rx.read_all(pool, &mut header);
        let status = DriverStatus::from_u8(header[0]).unwrap_or(DriverStatus::DriverError);
        let size = header[1] as u16;
        self.state = DeviceState::Idle;
        if size as usize > buf.len() {
            let mut drained = [0u8; 1];
            for _ in 0..size {
                self.rx.read_all(pool, &mut drained);
            }
            return ReadOutcome::Overflow;
        }
        self.rx.read_all(pool, &mut buf[..size as usize]);
        ReadOutcome::Done(status, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::TaskStatus;
    use kern::task::{TaskBody, TaskRecord};
    use std::boxed::Box;

    struct Idle;
    impl TaskBody for Idle {
        fn tick(&mut self) -> TaskStatus {
            TaskStatus::Suspend
        }
    }

    fn two_task_sched() -> Scheduler<2> {
        let a: &'static mut dyn TaskBody = Box::leak(Box::new(Idle));
        let b: &'static mut dyn TaskBody = Box::leak(Box::new(Idle));
        Scheduler::new([TaskRecord::suspended(a), TaskRecord::suspended(b)])
    }

    #[test]
    fn write_request_blocks_reentry_until_complete() {
        let mut pool: Pool<8, 32> = Pool::new();
        let mut sched = two_task_sched();
        let mut dev: Device<32> = Device::new(0x50, 32, 32);
        assert!(dev.write_request(&mut pool, &mut sched, b"hi"));
        assert_eq!(dev.state(), DeviceState::Writing);
        assert!(!dev.write_request(&mut pool, &mut sched, b"again"));
    }

    #[test]
    fn controller_drains_header_and_payload() {
        let mut pool: Pool<8, 32> = Pool::new();
        let mut sched = two_task_sched();
        let mut dev: Device<32> = Device::new(0x50, 32, 32);
        assert!(dev.indexed_read_request(&mut pool, &mut sched, b"\x10", 4));

        let mut header = [0u8; 2];
        assert!(dev.tx_mut().read_all(&mut pool, &mut header));
        assert_eq!(header, [1, 4]);
        let mut payload = [0u8; 1];
        assert!(dev.tx_mut().read_all(&mut pool, &mut payload));
        assert_eq!(payload, [0x10]);
    }

    #[test]
    fn read_complete_reports_pending_then_payload() {
        let mut pool: Pool<8, 32> = Pool::new();
        let mut sched = two_task_sched();
        let mut dev: Device<32> = Device::new(0x50, 32, 32);
        assert!(dev.read_request(&mut pool, &mut sched, 3));

        let mut buf = [0u8; 8];
        assert_eq!(dev.read_complete(&mut pool, &mut buf), ReadOutcome::Reading);

        assert!(dev.rx_mut().write_all(
            &mut pool,
            &mut sched,
            &[DriverStatus::Success as u8, 3, 0xaa, 0xbb, 0xcc]
        ));
        assert_eq!(
            dev.read_complete(&mut pool, &mut buf),
            ReadOutcome::Done(DriverStatus::Success, 3)
        );
        assert_eq!(&buf[..3], &[0xaa, 0xbb, 0xcc]);
        assert_eq!(dev.state(), DeviceState::Idle);
    }

    #[test]
    fn read_complete_drains_overflow_payload() {
        let mut pool: Pool<8, 32> = Pool::new();
        let mut sched = two_task_sched();
        let mut dev: Device<32> = Device::new(0x50, 32, 32);
        assert!(dev.read_request(&mut pool, &mut sched, 4));
        assert!(dev.rx_mut().write_all(
            &mut pool,
            &mut sched,
            &[DriverStatus::Success as u8, 4, 1, 2, 3, 4]
        ));
        let mut small = [0u8; 2];
        assert_eq!(dev.read_complete(&mut pool, &mut small), ReadOutcome::Overflow);
        assert_eq!(dev.rx_mut().get_read_capacity(), 0);
        assert_eq!(dev.state(), DeviceState::Idle);
    }

    #[test]
    fn write_complete_tracks_status_only() {
        let mut pool: Pool<8, 32> = Pool::new();
        let mut sched = two_task_sched();
        let mut dev: Device<32> = Device::new(0x50, 32, 32);
        assert!(dev.write_request(&mut pool, &mut sched, b"go"));
        assert_eq!(dev.write_complete(&mut pool), WriteOutcome::Writing);
        assert!(dev.rx_mut().write_all(
            &mut pool,
            &mut sched,
            &[DriverStatus::Nack as u8, 0]
        ));
        assert_eq!(
            dev.write_complete(&mut pool),
            WriteOutcome::Done(DriverStatus::Nack)
        );
    }
}
