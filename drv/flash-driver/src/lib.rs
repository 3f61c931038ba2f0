// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash back-end driver task (component G, flash variant).
//!
//! A single [`Device`](drv_flash_api::Device) stands in for the whole
//! flash array — there is no device list to scan the way I2C/SPI
//! controllers have one, since a flash part has one set of pins and one
//! bus controller owns it exclusively for the program's lifetime.
//! [`FlashBackend`] packs the write-enable/write-disable flags named in
//! the completion event's bits 29/30 into the response header's status
//! byte, since the stream wire format only carries one status byte.

#![no_std]

use abi::{CompletionEvent, DriverStatus, TaskStatus};
use drv_flash_api::{Device, FlashOp, HEADER_SIZE, REQUEST_PREFIX_SIZE};
use kern::buffer::Buffer;
use kern::kernel::Kernel;
use kern::platform::Platform;
use kern::task::{TaskBody, TaskIdx};
use ringbuf::{ringbuf, ringbuf_entry};
use static_cell::StaticCell;

/// The capability a hardware back end offers the controller.
pub trait FlashBackend {
    fn issue_erase(&mut self, address: u32);
    fn issue_program(&mut self, address: u32, data: &[u8]);
    fn issue_read(&mut self, address: u32, size: u16);
    fn poll_complete(&mut self) -> Option<CompletionEvent>;
    fn read_into(&mut self, buf: &mut [u8]);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    Busy,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Issued { op: u8, address: u32 },
    Completed { status: u8 },
}

ringbuf!(Trace, 32, Trace::None);

pub struct FlashController<
    B: FlashBackend,
    P: Platform,
    const BUF: usize,
    const NT: usize,
    const NE: usize,
    const NSEG: usize,
    const SEG: usize,
> {
    kernel: &'static StaticCell<Kernel<NT, NE, NSEG, SEG>>,
    platform: &'static P,
    backend: B,
    device: Device<SEG>,
    phase: Phase,
    read_size: u16,
    data: [u8; BUF],
    data_len: usize,
}

impl<
        B: FlashBackend,
        P: Platform,
        const BUF: usize,
        const NT: usize,
        const NE: usize,
        const NSEG: usize,
        const SEG: usize,
    > FlashController<B, P, BUF, NT, NE, NSEG, SEG>
{
    pub fn new(
        kernel: &'static StaticCell<Kernel<NT, NE, NSEG, SEG>>,
        platform: &'static P,
        backend: B,
        self_task: TaskIdx,
        mut device: Device<SEG>,
    ) -> Self {
        device.bind_controller(self_task);
        Self {
            kernel,
            platform,
            backend,
            device,
            phase: Phase::Idle,
            read_size: 0,
            data: [0; BUF],
            data_len: 0,
        }
    }

    pub fn device(&self) -> &Device<SEG> {
        &self.device
    }

    fn poll_idle(&mut self, k: &mut Kernel<NT, NE, NSEG, SEG>) -> TaskStatus {
        if self.device.tx_mut().get_read_capacity() < HEADER_SIZE {
            return TaskStatus::Suspend;
        }
        let mut header = [0u8; 2];
        if !self.device.tx_mut().read_all(&mut k.pool, &mut header) {
            return TaskStatus::Suspend;
        }
        let write_size = header[0] as usize;
        self.read_size = header[1] as u16;
        let mut prefix = [0u8; REQUEST_PREFIX_SIZE];
        if !self.device.tx_mut().read_all(&mut k.pool, &mut prefix) {
            return TaskStatus::Suspend;
        }
        let address = u32::from_le_bytes(prefix[1..5].try_into().unwrap());
        self.data_len = (write_size - REQUEST_PREFIX_SIZE).min(BUF);
        if self.data_len > 0 {
            self.device
                .tx_mut()
                .read_all(&mut k.pool, &mut self.data[..self.data_len]);
        }
        ringbuf_entry!(Trace::Issued {
            op: prefix[0],
            address,
        });
        match prefix[0] {
            x if x == FlashOp::Erase as u8 => self.backend.issue_erase(address),
            x if x == FlashOp::Program as u8 => {
                self.backend.issue_program(address, &self.data[..self.data_len])
            }
            _ => self.backend.issue_read(address, self.read_size),
        }
        self.phase = Phase::Busy;
        k.scheduler.stay_awake();
        TaskStatus::RunImmediate
    }

    fn poll_busy(&mut self, k: &mut Kernel<NT, NE, NSEG, SEG>) -> TaskStatus {
        let Some(event) = self.backend.poll_complete() else {
            return TaskStatus::RunLater(1);
        };
        let status = event.status().unwrap_or(DriverStatus::DriverError);
        ringbuf_entry!(Trace::Completed { status: status as u8 });
        let size = event.size().min(self.read_size);
        self.data_len = size as usize;
        if status == DriverStatus::Success && size > 0 {
            self.backend.read_into(&mut self.data[..self.data_len]);
        }

        let mut status_byte = status as u8;
        if event.flash_write_enabled() {
            status_byte |= 0x40;
        }
        if event.flash_write_disabled() {
            status_byte |= 0x80;
        }
        let mut scratch: Buffer<SEG> = Buffer::new();
        let header_size = u8::try_from(size).unwrap_or(u8::MAX);
        if !scratch.append(&mut k.pool, &[status_byte, header_size]) {
            return TaskStatus::RunLater(1);
        }
        if size > 0 && !scratch.append(&mut k.pool, &self.data[..size as usize]) {
            scratch.reset(&mut k.pool);
            return TaskStatus::RunLater(1);
        }
        if !self
            .device
            .rx_mut()
            .write_buffer(&mut k.pool, &mut k.scheduler, &mut scratch)
        {
            scratch.reset(&mut k.pool);
            return TaskStatus::RunLater(1);
        }
        self.read_size = 0;
        self.data_len = 0;
        self.phase = Phase::Idle;
        k.scheduler.can_sleep(self.platform);
        TaskStatus::RunImmediate
    }
}

impl<
        B: FlashBackend,
        P: Platform,
        const BUF: usize,
        const NT: usize,
        const NE: usize,
        const NSEG: usize,
        const SEG: usize,
    > TaskBody for FlashController<B, P, BUF, NT, NE, NSEG, SEG>
{
    fn tick(&mut self) -> TaskStatus {
        let mut k = self.kernel.borrow_mut();
        match self.phase {
            Phase::Idle => self.poll_idle(&mut k),
            Phase::Busy => self.poll_busy(&mut k),
        }
    }

    fn name(&self) -> Option<&'static str> {
        Some("flash-driver")
    }
}
