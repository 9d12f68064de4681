// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware task descriptor.
//!
//! The accelerator reads one descriptor per command from device memory. Each
//! field has a storage size in the serialized layout and a narrower declared
//! bit width; values are masked to that width when set. The layout is the
//! fields of [`FIELDS`] in order, little endian, without padding.

use std::io::Cursor;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Storage {
    U8,
    U16,
    U32,
}

impl Storage {
    pub const fn size(self) -> usize {
        match self {
            Storage::U8 => 1,
            Storage::U16 => 2,
            Storage::U32 => 4,
        }
    }
}

/// When a field is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldClass {
    /// Once, when the instance is created.
    Static,
    /// When sequence parameters are applied.
    Sequence,
    /// For every frame.
    Frame,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    FrameWidth,
    FrameHeight,
    WindowWidth,
    WindowHeight,
    WindowHorizontalOffset,
    WindowVerticalOffset,
    PictureCodingType,
    PicOrderCntType,
    FirstPictureInSequence,
    UseConstrainedIntraFlag,
    SliceSizeType,
    SliceByteSize,
    SliceMbSize,
    IntraRefreshType,
    IrParamOption,
    DisableDeblockingFilterIdc,
    SliceAlphaC0OffsetDiv2,
    SliceBetaOffsetDiv2,
    BrcType,
    NonVclNaluSize,
    CpbBufferSize,
    BitRate,
    SamplingMode,
    TransformMode,
    EncoderComplexity,
    Quant,
    FramerateNum,
    FramerateDen,
    Delay,
    StrictHrdCompliancy,
    QpMin,
    QpMax,
    AddrSourceBuffer,
    AddrFwdRefBuffer,
    AddrRecBuffer,
    AddrOutputBitstreamStart,
    AddrOutputBitstreamEnd,
    BitstreamOffset,
    AddrLctx,
    AddrParamInout,
    AddrExternalSw,
    AddrLocalRecBuffer,
    AddrSpatialContext,
    AddrTemporalContext,
    AddrBrcInOutParameter,
    ChromaQpIndexOffset,
    EntropyCodingMode,
    AddrCabacContextBuffer,
    GmvX,
    GmvY,
    AddrSliceHeader,
    SliceHeaderSizeInBits,
    SliceHeaderOffset0,
    SliceHeaderOffset1,
    SliceHeaderOffset2,
    SliceSynchroEnable,
    MaxSliceNumber,
    MaxAirIntraMbNb,
    BrcNoSkip,
}

#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    pub field: Field,
    pub name: &'static str,
    pub storage: Storage,
    /// Declared bit width, at most the storage width.
    pub width: u32,
    /// Two's complement field.
    pub signed: bool,
    pub class: FieldClass,
}

const fn entry(
    field: Field,
    name: &'static str,
    storage: Storage,
    width: u32,
    signed: bool,
    class: FieldClass,
) -> FieldSpec {
    FieldSpec {
        field,
        name,
        storage,
        width,
        signed,
        class,
    }
}

use FieldClass::Frame;
use FieldClass::Sequence;
use FieldClass::Static;
use Storage::U16;
use Storage::U32;
use Storage::U8;

/// Descriptor layout, indexed by [`Field`].
#[rustfmt::skip]
pub const FIELDS: [FieldSpec; FIELD_COUNT] = [
    entry(Field::FrameWidth, "frameWidth", U16, 16, false, Sequence),
    entry(Field::FrameHeight, "frameHeight", U16, 16, false, Sequence),
    entry(Field::WindowWidth, "windowWidth", U16, 16, false, Sequence),
    entry(Field::WindowHeight, "windowHeight", U16, 16, false, Sequence),
    entry(Field::WindowHorizontalOffset, "windowHorizontalOffset", U16, 16, false, Sequence),
    entry(Field::WindowVerticalOffset, "windowVerticalOffset", U16, 16, false, Sequence),
    entry(Field::PictureCodingType, "pictureCodingType", U8, 2, false, Frame),
    entry(Field::PicOrderCntType, "picOrderCntType", U8, 2, false, Sequence),
    entry(Field::FirstPictureInSequence, "firstPictureInSequence", U8, 1, false, Frame),
    entry(Field::UseConstrainedIntraFlag, "useConstrainedIntraFlag", U8, 1, false, Sequence),
    entry(Field::SliceSizeType, "sliceSizeType", U8, 2, false, Sequence),
    entry(Field::SliceByteSize, "sliceByteSize", U16, 16, false, Sequence),
    entry(Field::SliceMbSize, "sliceMbSize", U16, 16, false, Sequence),
    entry(Field::IntraRefreshType, "intraRefreshType", U8, 2, false, Sequence),
    entry(Field::IrParamOption, "irParamOption", U16, 16, false, Sequence),
    entry(Field::DisableDeblockingFilterIdc, "disableDeblockingFilterIdc", U8, 2, false, Frame),
    entry(Field::SliceAlphaC0OffsetDiv2, "sliceAlphaC0OffsetDiv2", U8, 4, true, Frame),
    entry(Field::SliceBetaOffsetDiv2, "sliceBetaOffsetDiv2", U8, 4, true, Frame),
    entry(Field::BrcType, "brcType", U8, 2, false, Sequence),
    entry(Field::NonVclNaluSize, "nonVCLNALUSize", U32, 32, false, Frame),
    entry(Field::CpbBufferSize, "cpbBufferSize", U32, 32, false, Sequence),
    entry(Field::BitRate, "bitRate", U32, 32, false, Sequence),
    entry(Field::SamplingMode, "samplingMode", U8, 2, false, Sequence),
    entry(Field::TransformMode, "transformMode", U8, 1, false, Sequence),
    entry(Field::EncoderComplexity, "encoderComplexity", U8, 3, false, Sequence),
    entry(Field::Quant, "quant", U8, 6, false, Sequence),
    entry(Field::FramerateNum, "framerateNum", U16, 16, false, Frame),
    entry(Field::FramerateDen, "framerateDen", U16, 16, false, Frame),
    entry(Field::Delay, "delay", U16, 16, false, Sequence),
    entry(Field::StrictHrdCompliancy, "strictHRDCompliancy", U8, 1, false, Sequence),
    entry(Field::QpMin, "qpmin", U8, 6, false, Sequence),
    entry(Field::QpMax, "qpmax", U8, 6, false, Sequence),
    entry(Field::AddrSourceBuffer, "addrSourceBuffer", U32, 32, false, Frame),
    entry(Field::AddrFwdRefBuffer, "addrFwdRefBuffer", U32, 32, false, Sequence),
    entry(Field::AddrRecBuffer, "addrRecBuffer", U32, 32, false, Sequence),
    entry(Field::AddrOutputBitstreamStart, "addrOutputBitstreamStart", U32, 32, false, Frame),
    entry(Field::AddrOutputBitstreamEnd, "addrOutputBitstreamEnd", U32, 32, false, Frame),
    entry(Field::BitstreamOffset, "bitstreamOffset", U8, 7, false, Frame),
    entry(Field::AddrLctx, "addrLctx", U32, 32, false, Static),
    entry(Field::AddrParamInout, "addrParamInout", U32, 32, false, Sequence),
    entry(Field::AddrExternalSw, "addrExternalSw", U32, 32, false, Static),
    entry(Field::AddrLocalRecBuffer, "addrLocalRecBuffer", U32, 32, false, Static),
    entry(Field::AddrSpatialContext, "addrSpatialContext", U32, 32, false, Frame),
    entry(Field::AddrTemporalContext, "addrTemporalContext", U32, 32, false, Frame),
    entry(Field::AddrBrcInOutParameter, "addrBrcInOutParameter", U32, 32, false, Sequence),
    entry(Field::ChromaQpIndexOffset, "chromaQpIndexOffset", U8, 5, true, Frame),
    entry(Field::EntropyCodingMode, "entropyCodingMode", U8, 1, false, Frame),
    entry(Field::AddrCabacContextBuffer, "addrCabacContextBuffer", U32, 32, false, Static),
    entry(Field::GmvX, "GmvX", U16, 16, true, Frame),
    entry(Field::GmvY, "GmvY", U16, 16, true, Frame),
    entry(Field::AddrSliceHeader, "addrSliceHeader", U32, 32, false, Sequence),
    entry(Field::SliceHeaderSizeInBits, "sliceHeaderSizeInBits", U16, 16, false, Frame),
    entry(Field::SliceHeaderOffset0, "sliceHeaderOffset0", U16, 16, false, Frame),
    entry(Field::SliceHeaderOffset1, "sliceHeaderOffset1", U16, 16, false, Frame),
    entry(Field::SliceHeaderOffset2, "sliceHeaderOffset2", U16, 16, false, Frame),
    entry(Field::SliceSynchroEnable, "sliceSynchroEnable", U8, 1, false, Sequence),
    entry(Field::MaxSliceNumber, "maxSliceNumber", U8, 8, false, Sequence),
    entry(Field::MaxAirIntraMbNb, "maxAirIntraMbNb", U16, 16, false, Sequence),
    entry(Field::BrcNoSkip, "brcNoSkip", U8, 1, false, Sequence),
];

pub const FIELD_COUNT: usize = 59;

/// Serialized size of a descriptor, in bytes.
pub const DESCRIPTOR_SIZE: usize = {
    let mut size = 0;
    let mut i = 0;
    while i < FIELD_COUNT {
        size += FIELDS[i].storage.size();
        i += 1;
    }
    size
};

impl Field {
    pub fn entry(self) -> &'static FieldSpec {
        &FIELDS[self as usize]
    }
}

fn mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor needs {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

pub type DescriptorResult<T> = Result<T, DescriptorError>;

/// Host copy of one task descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDescriptor {
    values: [u32; FIELD_COUNT],
}

impl Default for TaskDescriptor {
    fn default() -> Self {
        Self {
            values: [0; FIELD_COUNT],
        }
    }
}

impl TaskDescriptor {
    /// Stores `value` truncated to the field width.
    pub fn set(&mut self, field: Field, value: u32) {
        self.values[field as usize] = value & mask(field.entry().width);
    }

    /// Stores `value` as two's complement truncated to the field width.
    pub fn set_signed(&mut self, field: Field, value: i32) {
        self.set(field, value as u32);
    }

    pub fn set_flag(&mut self, field: Field, value: bool) {
        self.set(field, u32::from(value));
    }

    pub fn get(&self, field: Field) -> u32 {
        self.values[field as usize]
    }

    /// Reads a field, sign extending signed ones.
    pub fn get_signed(&self, field: Field) -> i32 {
        let spec = field.entry();
        let raw = self.get(field);
        if !spec.signed || spec.width >= 32 {
            return raw as i32;
        }

        let shift = 32 - spec.width;
        ((raw << shift) as i32) >> shift
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; DESCRIPTOR_SIZE];
        let mut pos = 0;
        for spec in FIELDS.iter() {
            let value = self.values[spec.field as usize];
            let bytes = &mut out[pos..pos + spec.storage.size()];
            match spec.storage {
                Storage::U8 => bytes[0] = value as u8,
                Storage::U16 => LittleEndian::write_u16(bytes, value as u16),
                Storage::U32 => LittleEndian::write_u32(bytes, value),
            }
            pos += spec.storage.size();
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> DescriptorResult<Self> {
        if data.len() < DESCRIPTOR_SIZE {
            return Err(DescriptorError::TooShort {
                expected: DESCRIPTOR_SIZE,
                actual: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let mut descriptor = Self::default();
        for spec in FIELDS.iter() {
            let value = match spec.storage {
                Storage::U8 => cursor.read_u8().map(u32::from),
                Storage::U16 => cursor.read_u16::<LittleEndian>().map(u32::from),
                Storage::U32 => cursor.read_u32::<LittleEndian>(),
            }
            .map_err(|_| DescriptorError::TooShort {
                expected: DESCRIPTOR_SIZE,
                actual: data.len(),
            })?;
            descriptor.set(spec.field, value);
        }

        Ok(descriptor)
    }

    /// Logs every field, one per line.
    pub fn dump(&self) {
        for spec in FIELDS.iter() {
            log::trace!(
                "| {:<28}| {:<8?} | {:#010x}",
                spec.name,
                spec.class,
                self.values[spec.field as usize]
            );
        }
    }
}
