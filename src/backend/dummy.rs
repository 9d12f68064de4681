// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy accelerator whose only purpose is to let the
//! encoder run so we can test it in isolation.
//!
//! [`DummyDevice`] keeps device memory in host memory and queues the commands
//! pushed to `FIFO_CMD`. Nothing happens until [`DummyDevice::complete_next`]
//! is called: it then decodes the task descriptor, writes a fake slice and the
//! parameter-out block, pushes a status word and raises the interrupt.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::sync::Weak;

use anyhow::anyhow;
use bytes::BytesMut;
use parking_lot::Mutex;

use crate::device::DeviceBuffer;
use crate::device::DeviceError;
use crate::device::DeviceResult;
use crate::device::HvaDevice;
use crate::device::HwFault;
use crate::device::IrqHandler;
use crate::device::ParamOut;
use crate::device::Register;
use crate::device::StatusWord;
use crate::device::TaskStatus;
use crate::device::HVA_H264_ENC;
use crate::encoder::hva::descriptor::Field;
use crate::encoder::hva::descriptor::TaskDescriptor;
use crate::encoder::hva::descriptor::DESCRIPTOR_SIZE;

pub const DRAM_BASE: u32 = 0x4000_0000;
pub const DRAM_SIZE: u32 = 64 << 20;
pub const SRAM_BASE: u32 = 0x0800_0000;
pub const SRAM_SIZE: u32 = 512 << 10;
pub const STATUS_FIFO_SIZE: u32 = 16;
pub const HVA_VERSION: u32 = 0x400;

/// VCL bytes produced for a picture unless scripted otherwise.
pub const DEFAULT_VCL_SIZE: u32 = 4096;
/// Encoder core ticks spent on every task.
const TASK_TICKS: u32 = 1000;
/// Byte filling the fake macroblock data.
const MB_DATA_BYTE: u8 = 0xa5;

/// Outcome of the next completed command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScriptedTask {
    pub status: TaskStatus,
    /// VCL bytes to produce, [`DEFAULT_VCL_SIZE`] when `None`.
    pub bitstream_size: Option<u32>,
    pub stuffing_bits: u32,
    pub fault: Option<HwFault>,
}

impl Default for ScriptedTask {
    fn default() -> Self {
        Self {
            status: TaskStatus::Ok,
            bitstream_size: None,
            stuffing_bits: 0,
            fault: None,
        }
    }
}

struct Memory {
    data: BytesMut,
    /// Start address to size and partition.
    live: BTreeMap<u32, (u32, String)>,
    allocations_left: Option<usize>,
}

impl Memory {
    fn range(&self, addr: u32, len: usize) -> DeviceResult<Range<usize>> {
        let start = addr
            .checked_sub(DRAM_BASE)
            .map(|offset| offset as usize)
            .ok_or(DeviceError::InvalidAccess { addr, len })?;

        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(DeviceError::InvalidAccess { addr, len }),
        }
    }

    /// First fit between the live allocations.
    fn find_space(&self, size: u32, align: u32) -> Option<u32> {
        let align = u64::from(align.max(1));
        let size = u64::from(size);
        let mut candidate = u64::from(DRAM_BASE).next_multiple_of(align);

        for (&start, &(len, _)) in &self.live {
            if candidate + size <= u64::from(start) {
                break;
            }
            candidate = candidate.max((u64::from(start) + u64::from(len)).next_multiple_of(align));
        }

        if candidate + size > u64::from(DRAM_BASE) + u64::from(DRAM_SIZE) {
            return None;
        }

        Some(candidate as u32)
    }
}

#[derive(Default)]
struct Hardware {
    /// Command word waiting for its descriptor address.
    pending_cmd: Option<u32>,
    cmd_fifo: VecDeque<(u32, u32)>,
    status_fifo: VecDeque<u32>,
    lmi_err: u32,
    emi_err: u32,
    /// Value returned by the next `SFL` read.
    sfl_override: Option<u32>,
    script: VecDeque<ScriptedTask>,
    removal_times: HashMap<u8, u32>,
    clock: u32,
    vcl_size: u32,
    it_acks: u32,
    err_it_acks: u32,
}

pub struct DummyDevice {
    memory: Mutex<Memory>,
    hw: Mutex<Hardware>,
    handler: Mutex<Option<Weak<dyn IrqHandler>>>,
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDevice {
    pub fn new() -> Self {
        Self {
            memory: Mutex::new(Memory {
                data: BytesMut::zeroed(DRAM_SIZE as usize),
                live: BTreeMap::new(),
                allocations_left: None,
            }),
            hw: Mutex::new(Hardware {
                vcl_size: DEFAULT_VCL_SIZE,
                ..Default::default()
            }),
            handler: Mutex::new(None),
        }
    }

    /// Makes every allocation after the next `count` ones fail.
    pub fn fail_allocation_after(&self, count: usize) {
        self.memory.lock().allocations_left = Some(count);
    }

    pub fn live_allocations(&self) -> usize {
        self.memory.lock().live.len()
    }

    pub fn set_vcl_size(&self, size: u32) {
        self.hw.lock().vcl_size = size;
    }

    /// Queues the outcome of a future command. Unscripted commands succeed.
    pub fn script(&self, task: ScriptedTask) {
        self.hw.lock().script.push_back(task);
    }

    /// Commands accepted and not completed yet.
    pub fn pending_commands(&self) -> usize {
        self.hw.lock().cmd_fifo.len()
    }

    pub fn interrupt_acks(&self) -> u32 {
        self.hw.lock().it_acks
    }

    pub fn error_interrupt_acks(&self) -> u32 {
        self.hw.lock().err_it_acks
    }

    pub fn has_irq_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn read_vec(&self, addr: u32, len: usize) -> DeviceResult<Vec<u8>> {
        let mut data = vec![0; len];
        self.read(addr, &mut data)?;
        Ok(data)
    }

    fn irq_handler(&self) -> Option<Arc<dyn IrqHandler>> {
        self.handler.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Raises the completion interrupt with an empty status FIFO.
    pub fn raise_spurious_irq(&self) {
        if let Some(handler) = self.irq_handler() {
            handler.on_irq();
        }
    }

    /// Executes the oldest queued command and raises its interrupts. Returns
    /// false if no command was queued.
    pub fn complete_next(&self) -> bool {
        let fault = {
            let mut hw = self.hw.lock();
            let Some((cmd, descriptor_addr)) = hw.cmd_fifo.pop_front() else {
                return false;
            };
            let task = hw.script.pop_front().unwrap_or_default();

            let status = self.execute(&mut hw, cmd, descriptor_addr, &task);
            hw.status_fifo.push_back(status.to_raw());

            match task.fault {
                Some(HwFault::Lmi) => hw.lmi_err = 1,
                Some(HwFault::Emi) => hw.emi_err = 1,
                Some(HwFault::StatusFifoOverflow) => hw.sfl_override = Some(STATUS_FIFO_SIZE),
                None => (),
            }

            task.fault
        };

        if let Some(handler) = self.irq_handler() {
            if fault.is_some() {
                handler.on_error_irq();
            }
            handler.on_irq();
        }

        true
    }

    /// Completes every queued command, returning how many there were.
    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }

        completed
    }

    fn execute(
        &self,
        hw: &mut Hardware,
        cmd: u32,
        descriptor_addr: u32,
        task: &ScriptedTask,
    ) -> StatusWord {
        // Command words share the layout of status words.
        let command = StatusWord::from_raw(cmd);
        let mut status = StatusWord {
            status: task.status as u8,
            ..command
        };

        if u32::from(command.status) != HVA_H264_ENC {
            status.status = TaskStatus::UnknownCommand as u8;
            return status;
        }

        let descriptor = match self
            .read_vec(descriptor_addr, DESCRIPTOR_SIZE)
            .map_err(anyhow::Error::from)
            .and_then(|raw| TaskDescriptor::deserialize(&raw).map_err(anyhow::Error::from))
        {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::warn!("cannot read task descriptor at {:#010x}: {:#}", descriptor_addr, e);
                status.status = TaskStatus::UnknownCommand as u8;
                return status;
            }
        };

        let removal_time = if descriptor.get(Field::FirstPictureInSequence) != 0 {
            initial_removal_time(&descriptor)
        } else {
            hw.removal_times
                .get(&command.client_id)
                .copied()
                .unwrap_or_default()
                + 1
        };
        hw.removal_times.insert(command.client_id, removal_time);

        let mut param_out = ParamOut {
            removal_time,
            hvc_start_time: hw.clock,
            hvc_stop_time: hw.clock.wrapping_add(TASK_TICKS),
            ..Default::default()
        };
        hw.clock = param_out.hvc_stop_time;

        if task.status == TaskStatus::Ok {
            let size = task.bitstream_size.unwrap_or(hw.vcl_size);
            match self.write_slice(&descriptor, size) {
                Ok(()) => {
                    param_out.bitstream_size = size;
                    param_out.stuffing_bits = task.stuffing_bits;
                }
                Err(e) => {
                    log::debug!("slice does not fit: {:#}", e);
                    status.status = TaskStatus::BitstreamOversize as u8;
                }
            }
        }

        if let Err(e) = self.write(descriptor.get(Field::AddrParamInout), &param_out.to_bytes()) {
            log::warn!("cannot write parameter-out block: {:#}", e);
        }

        status
    }

    /// Writes the slice header template followed by fake macroblock data.
    fn write_slice(&self, descriptor: &TaskDescriptor, size: u32) -> anyhow::Result<()> {
        let start = descriptor.get(Field::AddrOutputBitstreamStart)
            + descriptor.get(Field::BitstreamOffset) / 8;
        let end = descriptor.get(Field::AddrOutputBitstreamEnd);
        if u64::from(start) + u64::from(size) > u64::from(end) {
            return Err(anyhow!(
                "{} bytes at {:#010x} overrun the end at {:#010x}",
                size,
                start,
                end
            ));
        }

        let header_len = (descriptor.get(Field::SliceHeaderSizeInBits) as usize)
            .div_ceil(8)
            .min(size as usize);
        let mut slice = self.read_vec(descriptor.get(Field::AddrSliceHeader), header_len)?;
        slice.resize(size as usize, MB_DATA_BYTE);

        self.write(start, &slice)?;
        Ok(())
    }
}

/// Removal time of the first picture: the initial CPB delay, in frame periods,
/// rounded up.
fn initial_removal_time(descriptor: &TaskDescriptor) -> u32 {
    let delay_ms = u64::from(descriptor.get(Field::Delay));
    let num = u64::from(descriptor.get(Field::FramerateNum));
    let den = u64::from(descriptor.get(Field::FramerateDen).max(1));

    (delay_ms * num).div_ceil(den * 1000) as u32
}

impl HvaDevice for DummyDevice {
    fn read_register(&self, reg: Register) -> u32 {
        let mut hw = self.hw.lock();

        match reg {
            Register::Cfl => hw.cmd_fifo.len() as u32 + u32::from(hw.pending_cmd.is_some()),
            Register::FifoSts => hw.status_fifo.pop_front().unwrap_or(0),
            Register::Sfl => hw
                .sfl_override
                .take()
                .unwrap_or(hw.status_fifo.len() as u32),
            Register::LmiErr => hw.lmi_err,
            Register::EmiErr => hw.emi_err,
            Register::Version => HVA_VERSION,
            Register::FifoCmd | Register::ItAck | Register::ErrItAck => 0,
        }
    }

    fn write_register(&self, reg: Register, value: u32) {
        let mut hw = self.hw.lock();

        match reg {
            Register::FifoCmd => match hw.pending_cmd.take() {
                None => hw.pending_cmd = Some(value),
                Some(cmd) => hw.cmd_fifo.push_back((cmd, value)),
            },
            Register::ItAck => hw.it_acks += 1,
            Register::ErrItAck => {
                hw.err_it_acks += 1;
                hw.lmi_err = 0;
                hw.emi_err = 0;
            }
            _ => log::trace!("ignoring write of {:#x} to {:?}", value, reg),
        }
    }

    fn alloc(&self, partition: &str, size: u32, align: u32) -> DeviceResult<DeviceBuffer> {
        let mut memory = self.memory.lock();
        let out_of_memory = || DeviceError::OutOfMemory {
            partition: partition.to_string(),
            size,
        };

        match memory.allocations_left.as_mut() {
            Some(0) => return Err(out_of_memory()),
            Some(left) => *left -= 1,
            None => (),
        }

        let phys = memory.find_space(size, align).ok_or_else(out_of_memory)?;
        memory.live.insert(phys, (size, partition.to_string()));

        Ok(DeviceBuffer { phys, size })
    }

    fn free(&self, buffer: DeviceBuffer) {
        if self.memory.lock().live.remove(&buffer.phys).is_none() {
            log::warn!("freeing unknown buffer at {:#010x}", buffer.phys);
        }
    }

    fn read(&self, addr: u32, data: &mut [u8]) -> DeviceResult<()> {
        let memory = self.memory.lock();
        let range = memory.range(addr, data.len())?;
        data.copy_from_slice(&memory.data[range]);
        Ok(())
    }

    fn write(&self, addr: u32, data: &[u8]) -> DeviceResult<()> {
        let mut memory = self.memory.lock();
        let range = memory.range(addr, data.len())?;
        memory.data[range].copy_from_slice(data);
        Ok(())
    }

    fn fill(&self, addr: u32, len: u32, value: u8) -> DeviceResult<()> {
        let mut memory = self.memory.lock();
        let range = memory.range(addr, len as usize)?;
        memory.data[range].fill(value);
        Ok(())
    }

    fn copy_within(&self, src: u32, dst: u32, len: u32) -> DeviceResult<()> {
        let mut memory = self.memory.lock();
        let src = memory.range(src, len as usize)?;
        let dst = memory.range(dst, len as usize)?;
        memory.data.copy_within(src, dst.start);
        Ok(())
    }

    fn flush_cache(&self, addr: u32, len: u32) {
        log::trace!("flush {} bytes at {:#010x}", len, addr);
    }

    fn invalidate_cache(&self, addr: u32, len: u32) {
        log::trace!("invalidate {} bytes at {:#010x}", len, addr);
    }

    fn sram_region(&self) -> DeviceBuffer {
        DeviceBuffer {
            phys: SRAM_BASE,
            size: SRAM_SIZE,
        }
    }

    fn register_irq_handler(&self, handler: Weak<dyn IrqHandler>) -> DeviceResult<()> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            return Err(DeviceError::Irq(anyhow!("interrupt handler already installed")));
        }

        *slot = Some(handler);
        Ok(())
    }

    fn unregister_irq_handler(&self) {
        self.handler.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_reuse_freed_space() {
        let device = DummyDevice::new();

        let a = device.alloc("p", 1000, 256).unwrap();
        let b = device.alloc("p", 1000, 256).unwrap();
        assert_eq!(a.phys, DRAM_BASE);
        assert_eq!(b.phys, DRAM_BASE + 1024);

        device.free(a);
        let c = device.alloc("p", 512, 256).unwrap();
        assert_eq!(c.phys, DRAM_BASE);
        assert_eq!(device.live_allocations(), 2);

        assert!(matches!(
            device.alloc("p", DRAM_SIZE, 256),
            Err(DeviceError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn memory_access_is_bounded() {
        let device = DummyDevice::new();
        let buffer = device.alloc("p", 16, 16).unwrap();

        device.write(buffer.phys, &[1, 2, 3, 4]).unwrap();
        device.copy_within(buffer.phys, buffer.phys + 2, 4).unwrap();
        assert_eq!(device.read_vec(buffer.phys, 6).unwrap(), [1, 2, 1, 2, 3, 4]);

        assert!(device.read_vec(0x10, 4).is_err());
        assert!(device.write(DRAM_BASE + DRAM_SIZE - 2, &[0; 4]).is_err());
    }

    #[test]
    fn command_fifo_pairs_words() {
        let device = DummyDevice::new();

        device.write_register(Register::FifoCmd, 0x0001_0002);
        assert_eq!(device.read_register(Register::Cfl), 1);
        device.write_register(Register::FifoCmd, DRAM_BASE);
        assert_eq!(device.pending_commands(), 1);
        assert_eq!(device.read_register(Register::Sfl), 0);
    }

    #[test]
    fn unknown_commands_are_reported() {
        let device = DummyDevice::new();

        device.write_register(Register::FifoCmd, 0x0007_0309);
        device.write_register(Register::FifoCmd, DRAM_BASE);
        assert!(device.complete_next());
        assert!(!device.complete_next());

        assert_eq!(device.read_register(Register::Sfl), 1);
        let status = StatusWord::from_raw(device.read_register(Register::FifoSts));
        assert_eq!(status.status, TaskStatus::UnknownCommand as u8);
        assert_eq!(status.client_id, 3);
        assert_eq!(status.task_id, 7);
    }

    #[test]
    fn first_removal_time_covers_initial_delay() {
        let mut descriptor = TaskDescriptor::default();
        descriptor.set(Field::Delay, 1000);
        descriptor.set(Field::FramerateNum, 25);
        descriptor.set(Field::FramerateDen, 1);
        assert_eq!(initial_removal_time(&descriptor), 25);

        descriptor.set(Field::Delay, 500);
        descriptor.set(Field::FramerateNum, 30000);
        descriptor.set(Field::FramerateDen, 1001);
        assert_eq!(initial_removal_time(&descriptor), 15);
    }
}
