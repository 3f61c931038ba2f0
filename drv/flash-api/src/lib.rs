// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-facing API for a flash back end (component G, flash variant).
//!
//! Reuses the same transmit/receive stream shape as `drv-i2c-api` and
//! `drv-spi-api`, but the payload carries an operation byte and a
//! little-endian 32-bit address ahead of whatever data the operation
//! needs, since unlike a bus device a flash back end has no separate
//! addressing phase. The response carries the same (status, size)
//! header; `Device::poll` additionally surfaces the write-enable state
//! bits `drv-flash-driver` packs into the completion event.

#![no_std]

use abi::DriverStatus;
use kern::buffer::Buffer;
use kern::pool::Pool;
use kern::sched::Scheduler;
use kern::stream::Stream;
use kern::task::TaskIdx;

pub const HEADER_SIZE: u16 = 2;
/// Operation byte + 4-byte little-endian address, ahead of any payload.
pub const REQUEST_PREFIX_SIZE: usize = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FlashOp {
    Erase = 0,
    Program = 1,
    Read = 2,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceState {
    Idle,
    Busy,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashOutcome {
    Busy,
    Overflow,
    Done {
        status: DriverStatus,
        size: u16,
        write_enabled: bool,
        write_disabled: bool,
    },
}

/// One flash device (typically a singleton per back end, unlike I2C/SPI
/// which fan out over several devices on one controller).
pub struct Device<const SEG: usize = 64> {
    state: DeviceState,
    tx: Stream<SEG>,
    rx: Stream<SEG>,
}

impl<const SEG: usize> Device<SEG> {
    pub fn new(tx_capacity: u16, rx_capacity: u16) -> Self {
        Self {
            state: DeviceState::Idle,
            tx: Stream::new(tx_capacity),
            rx: Stream::new(rx_capacity),
        }
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

    fn issue<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        op: FlashOp,
        address: u32,
        data: &[u8],
        read_size: u8,
    ) -> bool {
        if self.state != DeviceState::Idle {
            return false;
        }
        let write_size = match u8::try_from(REQUEST_PREFIX_SIZE + data.len()) {
            Ok(n) => n,
            Err(_) => return false,
        };
        let mut scratch: Buffer<SEG> = Buffer::new();
        let mut prefix = [0u8; 2 + REQUEST_PREFIX_SIZE];
        prefix[0] = write_size;
        prefix[1] = read_size;
        prefix[2] = op as u8;
        prefix[3..7].copy_from_slice(&address.to_le_bytes());
        if !scratch.append(pool, &prefix) {
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
        self.state = DeviceState::Busy;
        true
    }

    pub fn erase<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        address: u32,
    ) -> bool {
        self.issue(pool, sched, FlashOp::Erase, address, &[], 0)
    }

    pub fn program<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        address: u32,
        data: &[u8],
    ) -> bool {
        self.issue(pool, sched, FlashOp::Program, address, data, 0)
    }

    pub fn read_request<const N: usize, const NT: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        sched: &mut Scheduler<NT>,
        address: u32,
        len: u8,
    ) -> bool {
        self.issue(pool, sched, FlashOp::Read, address, &[], len)
    }

    pub fn poll<const N: usize>(
        &mut self,
        pool: &mut Pool<N, SEG>,
        buf: &mut [u8],
    ) -> FlashOutcome {
        if self.rx.get_read_capacity() < HEADER_SIZE {
            return FlashOutcome::Busy;
        }
        let mut header = [0u8; 2];
        self.rx.read_all(pool, &mut header);
        let status = DriverStatus::from_u8(header[0] & 0x3f).unwrap_or(DriverStatus::DriverError);
        let write_enabled = header[0] & 0x40 != 0;
        let write_disabled = header[0] & 0x80 != 0;
        let size = header[1] as u16;
        self.state = DeviceState::Idle;
        if size as usize > buf.len() {
            let mut drained = [0u8; 1];
            for _ in 0..size {
                self.rx.read_all(pool, &mut drained);
            }
            return FlashOutcome::Overflow;
        }
        self.rx.read_all(pool, &mut buf[..size as usize]);
        FlashOutcome::Done {
            status,
            size,
            write_enabled,
            write_disabled,
        }
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
    fn program_request_encodes_op_and_address() {
        let mut pool: Pool<8, 64> = Pool::new();
        let mut sched = one_task_sched();
        let mut dev: Device<64> = Device::new(64, 64);
        assert!(dev.program(&mut pool, &mut sched, 0x0800_1000, &[0xaa, 0xbb]));

        let mut header = [0u8; 2];
        assert!(dev.tx_mut().read_all(&mut pool, &mut header));
        assert_eq!(header, [7, 0]);
        let mut prefix = [0u8; 5];
        assert!(dev.tx_mut().read_all(&mut pool, &mut prefix));
        assert_eq!(prefix[0], FlashOp::Program as u8);
        assert_eq!(u32::from_le_bytes(prefix[1..5].try_into().unwrap()), 0x0800_1000);
        let mut payload = [0u8; 2];
        assert!(dev.tx_mut().read_all(&mut pool, &mut payload));
        assert_eq!(payload, [0xaa, 0xbb]);
    }

    #[test]
    fn poll_surfaces_write_lock_bits() {
        let mut pool: Pool<8, 64> = Pool::new();
        let mut sched = one_task_sched();
        let mut dev: Device<64> = Device::new(64, 64);
        assert!(dev.erase(&mut pool, &mut sched, 0));
        let status_byte = DriverStatus::Success as u8 | 0x40;
        assert!(dev.rx_mut().write_all(&mut pool, &mut sched, &[status_byte, 0]));
        let mut buf = [0u8; 1];
        match dev.poll(&mut pool, &mut buf) {
            FlashOutcome::Done {
                status: DriverStatus::Success,
                size: 0,
                write_enabled: true,
                write_disabled: false,
            } => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
