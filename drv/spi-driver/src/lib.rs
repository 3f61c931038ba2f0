// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SPI bus controller task (component G, SPI variant).
//!
//! Thinner than `drv-i2c-driver`: SPI has no bus address to arbitrate
//! and a transfer is always a single full-duplex operation, so there is
//! only one in-flight phase (`Busy`) rather than I2C's separate
//! write/read phases. The five-stage driver contract — Select, Issue,
//! PollComplete, Release — still applies, just with one `Issue` call
//! instead of two.

#![no_std]

use abi::{CompletionEvent, DriverStatus, TaskStatus};
use drv_spi_api::{Device, HEADER_SIZE};
use kern::buffer::Buffer;
use kern::kernel::Kernel;
use kern::platform::Platform;
use kern::task::{TaskBody, TaskIdx};
use ringbuf::{ringbuf, ringbuf_entry};
use static_cell::StaticCell;

/// The capability a hardware back end offers the controller.
pub trait SpiBackend {
    fn select(&mut self, chip_select: u8);
    fn issue_transfer(&mut self, write: &[u8], read_size: u16);
    fn poll_complete(&mut self) -> Option<CompletionEvent>;
    fn read_into(&mut self, buf: &mut [u8]);
    fn release(&mut self);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    Busy,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Selected { chip_select: u8 },
    Completed { chip_select: u8, status: u8 },
    Backpressure { chip_select: u8 },
}

ringbuf!(Trace, 32, Trace::None);

pub struct BusController<
    B: SpiBackend,
    P: Platform,
    const NDEV: usize,
    const BUF: usize,
    const NT: usize,
    const NE: usize,
    const NSEG: usize,
    const SEG: usize,
> {
    kernel: &'static StaticCell<Kernel<NT, NE, NSEG, SEG>>,
    platform: &'static P,
    backend: B,
    devices: [Device<SEG>; NDEV],
    phase: Phase,
    current: Option<usize>,
    read_size: u8,
    data: [u8; BUF],
    data_len: usize,
}

impl<
        B: SpiBackend,
        P: Platform,
        const NDEV: usize,
        const BUF: usize,
        const NT: usize,
        const NE: usize,
        const NSEG: usize,
        const SEG: usize,
    > BusController<B, P, NDEV, BUF, NT, NE, NSEG, SEG>
{
    pub fn new(
        kernel: &'static StaticCell<Kernel<NT, NE, NSEG, SEG>>,
        platform: &'static P,
        backend: B,
        self_task: TaskIdx,
        mut devices: [Device<SEG>; NDEV],
    ) -> Self {
        for dev in &mut devices {
            dev.bind_controller(self_task);
        }
        Self {
            kernel,
            platform,
            backend,
            devices,
            phase: Phase::Idle,
            current: None,
            read_size: 0,
            data: [0; BUF],
            data_len: 0,
        }
    }

    pub fn device(&self, index: usize) -> &Device<SEG> {
        &self.devices[index]
    }

    fn poll_idle(&mut self, k: &mut Kernel<NT, NE, NSEG, SEG>) -> TaskStatus {
        for i in 0..NDEV {
            if self.devices[i].tx_mut().get_read_capacity() < HEADER_SIZE {
                continue;
            }
            let mut header = [0u8; 2];
            if !self.devices[i].tx_mut().read_all(&mut k.pool, &mut header) {
                continue;
            }
            let write_size = header[0] as usize;
            self.read_size = header[1];
            self.data_len = write_size.min(BUF);
            if write_size > 0 {
                self.devices[i]
                    .tx_mut()
                    .read_all(&mut k.pool, &mut self.data[..self.data_len]);
            }
            let chip_select = self.devices[i].chip_select();
            ringbuf_entry!(Trace::Selected { chip_select });
            self.backend.select(chip_select);
            self.backend
                .issue_transfer(&self.data[..self.data_len], self.read_size as u16);
            self.current = Some(i);
            self.phase = Phase::Busy;
            k.scheduler.stay_awake();
            return TaskStatus::RunImmediate;
        }
        TaskStatus::Suspend
    }

    fn poll_busy(&mut self, k: &mut Kernel<NT, NE, NSEG, SEG>) -> TaskStatus {
        let Some(event) = self.backend.poll_complete() else {
            return TaskStatus::RunLater(1);
        };
        let status = event.status().unwrap_or(DriverStatus::DriverError);
        let size = event.size().min(self.read_size as u16);
        let i = match self.current {
            Some(i) => i,
            None => return TaskStatus::Suspend,
        };
        ringbuf_entry!(Trace::Completed {
            chip_select: self.devices[i].chip_select(),
            status: status as u8,
        });
        self.data_len = size as usize;
        if status == DriverStatus::Success {
            self.backend.read_into(&mut self.data[..self.data_len]);
        }

        let mut scratch: Buffer<SEG> = Buffer::new();
        let header_size = u8::try_from(size).unwrap_or(u8::MAX);
        if !scratch.append(&mut k.pool, &[status as u8, header_size]) {
            return TaskStatus::RunLater(1);
        }
        if size > 0 && !scratch.append(&mut k.pool, &self.data[..size as usize]) {
            scratch.reset(&mut k.pool);
            return TaskStatus::RunLater(1);
        }
        if !self.devices[i]
            .rx_mut()
            .write_buffer(&mut k.pool, &mut k.scheduler, &mut scratch)
        {
            scratch.reset(&mut k.pool);
            ringbuf_entry!(Trace::Backpressure {
                chip_select: self.devices[i].chip_select(),
            });
            return TaskStatus::RunLater(1);
        }
        self.backend.release();
        self.current = None;
        self.read_size = 0;
        self.data_len = 0;
        self.phase = Phase::Idle;
        k.scheduler.can_sleep(self.platform);
        TaskStatus::RunImmediate
    }
}

impl<
        B: SpiBackend,
        P: Platform,
        const NDEV: usize,
        const BUF: usize,
        const NT: usize,
        const NE: usize,
        const NSEG: usize,
        const SEG: usize,
    > TaskBody for BusController<B, P, NDEV, BUF, NT, NE, NSEG, SEG>
{
    fn tick(&mut self) -> TaskStatus {
        let mut k = self.kernel.borrow_mut();
        match self.phase {
            Phase::Idle => self.poll_idle(&mut k),
            Phase::Busy => self.poll_busy(&mut k),
        }
    }

    fn name(&self) -> Option<&'static str> {
        Some("spi-driver")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_spi_api::{Device, TransferOutcome};
    use kern::platform::sim::SimPlatform;
    use kern::task::TaskRecord;
    use std::boxed::Box;
    use std::vec::Vec;

    struct Idle;
    impl TaskBody for Idle {
        fn tick(&mut self) -> TaskStatus {
            TaskStatus::Suspend
        }
    }

    struct FakeBackend {
        next: Option<CompletionEvent>,
        echo: Vec<u8>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                next: None,
                echo: Vec::new(),
            }
        }
    }

    impl SpiBackend for FakeBackend {
        fn select(&mut self, _chip_select: u8) {}

        fn issue_transfer(&mut self, write: &[u8], read_size: u16) {
            self.echo = write.iter().rev().copied().collect();
            self.echo.resize(read_size as usize, 0xff);
            self.next = Some(CompletionEvent::complete(DriverStatus::Success, read_size));
        }

        fn poll_complete(&mut self) -> Option<CompletionEvent> {
            self.next.take()
        }

        fn read_into(&mut self, buf: &mut [u8]) {
            let n = buf.len().min(self.echo.len());
            buf[..n].copy_from_slice(&self.echo[..n]);
        }

        fn release(&mut self) {}
    }

    type Ctl = BusController<FakeBackend, SimPlatform, 1, 32, 2, 4, 8, 32>;

    fn new_kernel() -> &'static StaticCell<Kernel<2, 4, 8, 32>> {
        let a: &'static mut dyn TaskBody = Box::leak(Box::new(Idle));
        let b: &'static mut dyn TaskBody = Box::leak(Box::new(Idle));
        let sched = kern::sched::Scheduler::new([
            TaskRecord::suspended(a),
            TaskRecord::suspended(b),
        ]);
        Box::leak(Box::new(StaticCell::new(Kernel::new(sched))))
    }

    fn new_controller(kernel: &'static StaticCell<Kernel<2, 4, 8, 32>>) -> Ctl {
        let platform: &'static SimPlatform = Box::leak(Box::new(SimPlatform::new()));
        let self_task = kernel.borrow_mut().scheduler.task_at(1);
        let dev: Device<32> = Device::new(0, 32, 32);
        BusController::new(kernel, platform, FakeBackend::new(), self_task, [dev])
    }

    #[test]
    fn a_transfer_holds_the_scheduler_awake_until_it_completes() {
        let kernel = new_kernel();
        let mut ctl = new_controller(kernel);
        {
            let mut k = kernel.borrow_mut();
            assert!(ctl.devices[0].transfer(&mut k.pool, &mut k.scheduler, b"\x9f", 2));
        }

        assert_eq!(ctl.tick(), TaskStatus::RunImmediate); // select+issue
        assert_eq!(kernel.borrow_mut().scheduler.stay_awake_count(), 1);

        assert_eq!(ctl.tick(), TaskStatus::RunImmediate); // respond
        assert_eq!(kernel.borrow_mut().scheduler.stay_awake_count(), 0);
    }

    #[test]
    fn transfer_round_trips_through_the_backend() {
        let kernel = new_kernel();
        let mut ctl = new_controller(kernel);
        {
            let mut k = kernel.borrow_mut();
            assert!(ctl.devices[0].transfer(&mut k.pool, &mut k.scheduler, b"\x9f", 2));
        }

        assert_eq!(ctl.tick(), TaskStatus::RunImmediate); // select+issue
        assert_eq!(ctl.tick(), TaskStatus::RunImmediate); // respond

        let mut k = kernel.borrow_mut();
        let mut buf = [0u8; 4];
        match ctl.devices[0].poll(&mut k.pool, &mut buf) {
            TransferOutcome::Done(DriverStatus::Success, 2) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
