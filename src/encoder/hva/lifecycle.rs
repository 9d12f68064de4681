// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device memory owned by encoder instances.
//!
//! Every instance holds an [`InstanceBuffers`] group sized for its maximum
//! resolution. The group is acquired as a whole: if any allocation fails, the
//! buffers already obtained are released before the error is returned. The
//! scratch buffers shared by all instances live in the accelerator SRAM and
//! are handed out by [`ScratchBuffers`].

use std::sync::Arc;

use thiserror::Error;

use crate::codec::h264::slice_header::SLICE_HEADER_BUFFER_SIZE;
use crate::device::DeviceBuffer;
use crate::device::DeviceError;
use crate::device::HvaDevice;
use crate::device::PARAM_OUT_HEADER_SIZE;
use crate::device::PARAM_OUT_MB_SIZE;
use crate::encoder::hva::descriptor::DESCRIPTOR_SIZE;
use crate::Resolution;

/// Alignment of the per-instance buffers.
pub const ENCODE_BUFFER_ALIGNMENT: u32 = 256;
/// Alignment of the scratch buffers in SRAM.
pub const SRAM_ALIGNMENT: u32 = 256;

/// Bytes of rate control state kept by the accelerator.
pub const BRC_DATA_SIZE: u32 = 5 * 16;
/// Bytes of spatial and temporal context per macroblock.
pub const CONTEXT_DATA_PER_MB: u32 = 16;

/// Resolution the shared scratch buffers are sized for.
pub const SCRATCH_RESOLUTION: Resolution = Resolution {
    width: 1920,
    height: 1088,
};

fn mb_width(resolution: Resolution) -> u32 {
    resolution.macroblocks().0
}

fn mb_count(resolution: Resolution) -> u32 {
    let (width, height) = resolution.macroblocks();
    width * height
}

/// Role of a buffer in the group of an instance, in allocation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferRole {
    Reference,
    SpatialContext,
    TemporalContext,
    Brc,
    ParamOut,
    TaskDescriptor,
    Reconstructed,
    SliceHeader,
}

impl BufferRole {
    pub const ALL: [BufferRole; 8] = [
        BufferRole::Reference,
        BufferRole::SpatialContext,
        BufferRole::TemporalContext,
        BufferRole::Brc,
        BufferRole::ParamOut,
        BufferRole::TaskDescriptor,
        BufferRole::Reconstructed,
        BufferRole::SliceHeader,
    ];

    /// Size of the buffer for pictures up to `max`.
    pub fn size(self, max: Resolution) -> u32 {
        match self {
            // 4:2:0 frame.
            BufferRole::Reference | BufferRole::Reconstructed => max.width * max.height * 3 / 2,
            BufferRole::SpatialContext | BufferRole::TemporalContext => {
                mb_count(max) * CONTEXT_DATA_PER_MB
            }
            BufferRole::Brc => BRC_DATA_SIZE,
            BufferRole::ParamOut => PARAM_OUT_HEADER_SIZE + PARAM_OUT_MB_SIZE * mb_count(max),
            BufferRole::TaskDescriptor => DESCRIPTOR_SIZE as u32,
            BufferRole::SliceHeader => SLICE_HEADER_BUFFER_SIZE as u32,
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("not enough SDRAM for the {role:?} buffer")]
    NoSdramMemory {
        role: BufferRole,
        #[source]
        source: DeviceError,
    },
    #[error("not enough SRAM: {needed} bytes needed, {available} available")]
    NoEramMemory { needed: u32, available: u32 },
    #[error("cannot clear the {role:?} buffer")]
    Clear {
        role: BufferRole,
        #[source]
        source: DeviceError,
    },
}

pub type AllocResult<T> = Result<T, AllocError>;

/// Physical addresses of the buffers of one instance, as loaded in its task
/// descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstanceAddresses {
    pub reference: u32,
    pub reconstructed: u32,
    pub spatial_context: u32,
    pub temporal_context: u32,
    pub brc: u32,
    pub param_out: u32,
    pub task_descriptor: u32,
    pub slice_header: u32,
}

/// Buffers of one instance. Released when dropped.
pub struct InstanceBuffers<D: HvaDevice> {
    device: Arc<D>,
    buffers: Vec<(BufferRole, DeviceBuffer)>,
}

impl<D: HvaDevice> InstanceBuffers<D> {
    /// Allocates and clears the whole group in `partition`.
    pub fn allocate(device: Arc<D>, partition: &str, max: Resolution) -> AllocResult<Self> {
        let mut group = Self {
            device,
            buffers: Vec::with_capacity(BufferRole::ALL.len()),
        };

        for role in BufferRole::ALL {
            let size = role.size(max);
            let buffer = group
                .device
                .alloc(partition, size, ENCODE_BUFFER_ALIGNMENT)
                .map_err(|source| {
                    log::error!("{:?} buffer allocation of {} bytes failed", role, size);
                    AllocError::NoSdramMemory { role, source }
                })?;
            group.buffers.push((role, buffer));

            group
                .device
                .fill(buffer.phys, buffer.size, 0)
                .map_err(|source| AllocError::Clear { role, source })?;

            log::debug!(
                "{:?} buffer: {} bytes at {:#010x} in {}",
                role,
                size,
                buffer.phys,
                partition
            );
        }

        Ok(group)
    }

    pub fn buffer(&self, role: BufferRole) -> DeviceBuffer {
        // The group always holds every role, in allocation order.
        self.buffers[role as usize].1
    }

    pub fn addresses(&self) -> InstanceAddresses {
        InstanceAddresses {
            reference: self.buffer(BufferRole::Reference).phys,
            reconstructed: self.buffer(BufferRole::Reconstructed).phys,
            spatial_context: self.buffer(BufferRole::SpatialContext).phys,
            temporal_context: self.buffer(BufferRole::TemporalContext).phys,
            brc: self.buffer(BufferRole::Brc).phys,
            param_out: self.buffer(BufferRole::ParamOut).phys,
            task_descriptor: self.buffer(BufferRole::TaskDescriptor).phys,
            slice_header: self.buffer(BufferRole::SliceHeader).phys,
        }
    }
}

impl<D: HvaDevice> Drop for InstanceBuffers<D> {
    fn drop(&mut self) {
        while let Some((role, buffer)) = self.buffers.pop() {
            log::trace!("freeing {:?} buffer at {:#010x}", role, buffer.phys);
            self.device.free(buffer);
        }
    }
}

/// Physical addresses of the buffers shared by all instances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScratchAddresses {
    pub search_window: u32,
    pub local_rec: u32,
    pub context_mb: u32,
    pub cabac_context: u32,
}

/// Scratch buffers carved out of the accelerator SRAM. SRAM is never returned
/// piecewise: dropping the set makes the whole region available again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScratchBuffers {
    region: DeviceBuffer,
    next_free: u32,
    addresses: ScratchAddresses,
}

impl ScratchBuffers {
    /// Search window in the reference picture, MB tiled 4:2:0.
    pub fn search_window_size(resolution: Resolution) -> u32 {
        (4 * mb_width(resolution) + 6) * 256 * 3 / 2
    }

    /// Four lines of the top macroblocks, kept for deblocking.
    pub fn local_rec_size(resolution: Resolution) -> u32 {
        4 * 16 * mb_width(resolution) * 2
    }

    pub fn context_mb_size(resolution: Resolution) -> u32 {
        mb_width(resolution) * 16 * 8
    }

    pub fn cabac_context_size(resolution: Resolution) -> u32 {
        mb_width(resolution) * 16
    }

    pub fn allocate(region: DeviceBuffer) -> AllocResult<Self> {
        let mut scratch = Self {
            region,
            next_free: region.phys,
            addresses: Default::default(),
        };

        scratch.addresses = ScratchAddresses {
            search_window: scratch.carve(Self::search_window_size(SCRATCH_RESOLUTION))?,
            local_rec: scratch.carve(Self::local_rec_size(SCRATCH_RESOLUTION))?,
            context_mb: scratch.carve(Self::context_mb_size(SCRATCH_RESOLUTION))?,
            cabac_context: scratch.carve(Self::cabac_context_size(SCRATCH_RESOLUTION))?,
        };

        log::debug!(
            "scratch buffers use {} of {} SRAM bytes: {:x?}",
            scratch.used(),
            region.size,
            scratch.addresses
        );

        Ok(scratch)
    }

    fn carve(&mut self, size: u32) -> AllocResult<u32> {
        let start = self.next_free.next_multiple_of(SRAM_ALIGNMENT);
        let end = u64::from(start) + u64::from(size);

        if end > u64::from(self.region.end()) {
            let available = self.region.end().saturating_sub(start);
            log::error!("SRAM overflow: {} bytes needed, {} available", size, available);
            return Err(AllocError::NoEramMemory {
                needed: size,
                available,
            });
        }

        self.next_free = end as u32;
        Ok(start)
    }

    pub fn addresses(&self) -> &ScratchAddresses {
        &self.addresses
    }

    /// SRAM bytes consumed, alignment included.
    pub fn used(&self) -> u32 {
        self.next_free - self.region.phys
    }
}
