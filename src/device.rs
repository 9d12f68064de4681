// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware collaborator of the encoder.
//!
//! [`HvaDevice`] is everything the encoder needs from the platform: word
//! access to the host interface registers, physically addressed buffers taken
//! from named partitions, cache maintenance, and delivery of the two
//! interrupt lines to an [`IrqHandler`].

use std::io::Cursor;
use std::sync::Weak;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use enumn::N;
use thiserror::Error;

/// Registers of the HVA host interface.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Register {
    /// Command FIFO fill level.
    Cfl = 0x110,
    FifoCmd = 0x114,
    FifoSts = 0x118,
    /// Status FIFO fill level.
    Sfl = 0x11c,
    ItAck = 0x120,
    ErrItAck = 0x124,
    LmiErr = 0x128,
    EmiErr = 0x12c,
    Version = 0x14c,
}

impl Register {
    pub fn offset(self) -> u32 {
        self as u32
    }
}

/// Command type of an H.264 encode task.
pub const HVA_H264_ENC: u32 = 0x02;

/// Mask of the fill level in `CFL` and `SFL`.
pub const FIFO_LEVEL_MASK: u32 = 0xf;

/// Builds the command word pushed to `FIFO_CMD` ahead of the task descriptor
/// address.
pub fn command_word(cmd_type: u32, client_id: u8, task_id: u16) -> u32 {
    (cmd_type & 0xff) | (u32::from(client_id) << 8) | (u32::from(task_id) << 16)
}

/// Entry of the status FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusWord {
    pub status: u8,
    pub client_id: u8,
    pub task_id: u16,
}

impl StatusWord {
    pub fn from_raw(raw: u32) -> Self {
        Self {
            status: (raw & 0xff) as u8,
            client_id: ((raw >> 8) & 0xff) as u8,
            task_id: (raw >> 16) as u16,
        }
    }

    pub fn to_raw(self) -> u32 {
        command_word(u32::from(self.status), self.client_id, self.task_id)
    }
}

/// Task status codes reported by the accelerator.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Ok = 0x00,
    BitstreamOversize = 0x02,
    FrameSkipped = 0x04,
    SliceLimitSize = 0x05,
    MaxSliceNumber = 0x07,
    SliceReady = 0x08,
    TaskListFull = 0xf0,
    UnknownCommand = 0xf1,
    WrongCodecOrResolution = 0xf4,
}

/// Errors raised on the error interrupt line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwFault {
    /// Local memory interface error.
    Lmi,
    /// External memory interface error.
    Emi,
    StatusFifoOverflow,
}

/// Size of the picture level part of the parameter-out block.
pub const PARAM_OUT_HEADER_SIZE: u32 = 32;
/// Size of the per-macroblock part of the parameter-out block.
pub const PARAM_OUT_MB_SIZE: u32 = 16;

/// Picture level results written by the accelerator in the parameter-out
/// block of the instance. Eight little endian words, the last three unused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParamOut {
    /// VCL bytes written.
    pub bitstream_size: u32,
    /// Removal time of the picture, in frame periods.
    pub removal_time: u32,
    pub stuffing_bits: u32,
    /// Encoder core clock at task start and end.
    pub hvc_start_time: u32,
    pub hvc_stop_time: u32,
}

impl ParamOut {
    pub fn parse(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);

        Ok(Self {
            bitstream_size: cursor.read_u32::<LittleEndian>()?,
            removal_time: cursor.read_u32::<LittleEndian>()?,
            stuffing_bits: cursor.read_u32::<LittleEndian>()?,
            hvc_start_time: cursor.read_u32::<LittleEndian>()?,
            hvc_stop_time: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let words = [
            self.bitstream_size,
            self.removal_time,
            self.stuffing_bits,
            self.hvc_start_time,
            self.hvc_stop_time,
            0,
            0,
            0,
        ];
        let mut out = vec![0u8; PARAM_OUT_HEADER_SIZE as usize];
        LittleEndian::write_u32_into(&words, &mut out);

        out
    }

    /// Encoder core ticks spent on the task.
    pub fn hvc_duration(&self) -> u32 {
        self.hvc_stop_time.wrapping_sub(self.hvc_start_time)
    }
}

/// A physically contiguous buffer in device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    pub phys: u32,
    pub size: u32,
}

impl DeviceBuffer {
    pub fn end(&self) -> u32 {
        self.phys + self.size
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot allocate {size} bytes in partition {partition}")]
    OutOfMemory { partition: String, size: u32 },
    #[error("access of {len} bytes at {addr:#010x} is outside device memory")]
    InvalidAccess { addr: u32, len: usize },
    #[error("cannot install interrupt handler")]
    Irq(#[source] anyhow::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Receiver of the accelerator interrupts. Handlers run in interrupt context:
/// they must not block on anything but the hardware lock.
pub trait IrqHandler: Send + Sync {
    /// A task completed and its status is in the status FIFO.
    fn on_irq(&self);
    /// The memory interfaces or the status FIFO reported an error.
    fn on_error_irq(&self);
}

pub trait HvaDevice: Send + Sync + 'static {
    fn read_register(&self, reg: Register) -> u32;
    fn write_register(&self, reg: Register, value: u32);

    /// Allocates `size` bytes aligned on `align` from `partition`.
    fn alloc(&self, partition: &str, size: u32, align: u32) -> DeviceResult<DeviceBuffer>;
    fn free(&self, buffer: DeviceBuffer);

    fn read(&self, addr: u32, data: &mut [u8]) -> DeviceResult<()>;
    fn write(&self, addr: u32, data: &[u8]) -> DeviceResult<()>;
    fn fill(&self, addr: u32, len: u32, value: u8) -> DeviceResult<()>;
    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    fn copy_within(&self, src: u32, dst: u32, len: u32) -> DeviceResult<()>;

    fn flush_cache(&self, addr: u32, len: u32);
    fn invalidate_cache(&self, addr: u32, len: u32);

    /// Embedded SRAM reserved for the accelerator.
    fn sram_region(&self) -> DeviceBuffer;

    fn register_irq_handler(&self, handler: Weak<dyn IrqHandler>) -> DeviceResult<()>;
    fn unregister_irq_handler(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_word_layout() {
        assert_eq!(command_word(HVA_H264_ENC, 3, 0x1234), 0x1234_0302);
        // Only the low byte of the command type is kept.
        assert_eq!(command_word(0x1ff, 0, 0), 0xff);
    }

    #[test]
    fn status_word_decoding() {
        let status = StatusWord::from_raw(0xbeef_0504);
        assert_eq!(status.status, TaskStatus::FrameSkipped as u8);
        assert_eq!(status.client_id, 5);
        assert_eq!(status.task_id, 0xbeef);
        assert_eq!(status.to_raw(), 0xbeef_0504);

        assert_eq!(TaskStatus::n(status.status), Some(TaskStatus::FrameSkipped));
        assert_eq!(TaskStatus::n(0x03), None);
    }

    #[test]
    fn param_out_layout() {
        let param_out = ParamOut {
            bitstream_size: 0x1234,
            removal_time: 26,
            stuffing_bits: 64,
            hvc_start_time: 0xffff_fff0,
            hvc_stop_time: 0x10,
        };

        let bytes = param_out.to_bytes();
        assert_eq!(bytes.len(), PARAM_OUT_HEADER_SIZE as usize);
        assert_eq!(&bytes[..8], &[0x34, 0x12, 0, 0, 26, 0, 0, 0]);
        assert_eq!(ParamOut::parse(&bytes).unwrap(), param_out);
        assert_eq!(param_out.hvc_duration(), 0x20);

        assert!(ParamOut::parse(&bytes[..12]).is_err());
    }
}
