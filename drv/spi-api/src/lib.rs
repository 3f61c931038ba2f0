// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-facing API for a shared SPI bus (component G, SPI variant).
//!
//! Same shape as `drv-i2c-api`: a [`Device`] is one chip-select line with
//! a transmit stream the bus controller drains a request header and
//! payload from, and a receive stream it fills with a response header
//! and payload. SPI has no bus address to select, only a chip-select
//! line, and a transfer is always full-duplex, so there is no separate
//! write-only/read-only distinction at the wire level the way I2C's API
//! surfaces one — `transfer` covers every case.

#![no_std]

use abi::DriverStatus;
use kern::buffer::Buffer;
use kern::pool::Pool;
use kern::sched::Scheduler;
use kern::stream::Stream;
use kern::task::TaskIdx;

pub const HEADER_SIZE: u16 = 2;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceState {
    Idle,
    Busy,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferOutcome {
    Busy,
    Overflow,
    Done(DriverStatus, u16),
}

/// One chip-select line, with its own transmit/receive streams.
pub struct Device<const SEG: usize = 64> {
    chip_select: u8,
    state: DeviceState,
    tx: Stream<SEG>,
    rx: Stream<SEG>,
}

impl<const SEG: usize> Device<SEG> {
    pub fn new(chip_select: u8, tx_capacity: u16, rx_capacity: u16) -> Self {
        Self {
            chip_select,
            state: DeviceState::Idle,
            tx: Stream::new(tx_capacity),
            rx: Stream::new(rx_capacity),
        }
    }

    pub fn chip_select(&self) -> u8 {
        self.chip_select
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn bind_controller(&mut self, controller: TaskIdx) {
        self.tx.bind_consumer(controller);
    }

    pub fn bind_client(&mut self, client: TaskIdx) {
        self.rx.bind_consumer(client);
    }

    pub fn tx_mut(&mut self) -> &mut Stream<SEG> {
        &mut self.tx
    }

    pub fn rx_mut(&mut self) -> &mut Stream<SEG> {
        &mut self.rx
    }

    /// Issues a full-duplex transfer: `write` is clocked out, and up to
    /// `read_size` bytes are clocked in alongside it. Fails without side
    /// effects if the line is busy or the header plus `write` won't fit.
    pub fn transfer<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        write: &[u8],
        read_size: u8,
    ) -> bool {
        if self.state != DeviceState::Idle {
            return false;
        }
        let write_size = match u8::try_from(write.len()) {
            Ok(n) => n,
            Err(_) => return false,
        };
        let mut scratch: Buffer<SEG> = Buffer::new();
        if !scratch.append(pool, &[write_size, read_size]) {
            return false;
        }
        if !write.is_empty() && !scratch.append(pool, write) {
            scratch.reset(pool);
            return false;
        }
        if !self.tx.write_buffer(pool, sched, &mut scratch) {
            scratch.reset(pool);
            return false;
        }
        self.state = DeviceState::Busy;
        true
    }

    /// Polls for completion, copying up to `buf.len()` response bytes in.
    pub fn poll<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        buf: &mut [u8],
    ) -> TransferOutcome {
        if self.rx.get_read_capacity() < HEADER_SIZE {
            return TransferOutcome::Busy;
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
            return TransferOutcome::Overflow;
        }
        self.rx.read_all(pool, &mut buf[..size as usize]);
        TransferOutcome::Done(status, size)
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

    fn one_task_sched() -> Scheduler<1> {
        let body: &'static mut dyn TaskBody = Box::leak(Box::new(Idle));
        Scheduler::new([TaskRecord::suspended(body)])
    }

    #[test]
    fn transfer_blocks_reentry_until_poll_completes() {
        let mut pool: Pool<8, 32> = Pool::new();
        let mut sched = one_task_sched();
        let mut dev: Device<32> = Device::new(0, 32, 32);
        assert!(dev.transfer(&mut pool, &mut sched, b"\x9f", 2));
        assert!(!dev.transfer(&mut pool, &mut sched, b"\x9f", 2));

        let mut header = [0u8; 2];
        assert!(dev.tx_mut().read_all(&mut pool, &mut header));
        assert_eq!(header, [1, 2]);

        assert!(dev.rx_mut().write_all(
            &mut pool,
            &mut sched,
            &[DriverStatus::Success as u8, 2, 0x10, 0x20]
        ));
        let mut buf = [0u8; 4];
        assert_eq!(
            dev.poll(&mut pool, &mut buf),
            TransferOutcome::Done(DriverStatus::Success, 2)
        );
        assert_eq!(&buf[..2], &[0x10, 0x20]);
        assert_eq!(dev.state(), DeviceState::Idle);
    }
}
