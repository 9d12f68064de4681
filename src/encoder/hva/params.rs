// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameters the host hands to the accelerator: once per instance
//! ([`InitParams`]), once per sequence ([`SequenceParams`]) and once per
//! frame ([`FrameParams`]).

use enumn::N;
use thiserror::Error;

use crate::codec::h264::syntax::Level;
use crate::codec::h264::syntax::Profile;
use crate::Resolution;

/// Largest `log2_max_frame_num_minus4` allowed by H.264 7.4.2.1.1.
pub const MAX_LOG2_MAX_FRAME_NUM_MINUS4: u8 = 12;
/// Largest luma quantization parameter.
pub const MAX_QP: u8 = 51;

/// Memory reserved for an instance, bounding the resolutions it can encode.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryProfile {
    Cif = 0,
    Sd = 1,
    Hd720p = 2,
    #[default]
    Hd = 3,
}

impl MemoryProfile {
    pub fn max_resolution(self) -> Resolution {
        let (width, height) = match self {
            MemoryProfile::Cif => (352, 288),
            MemoryProfile::Sd => (720, 576),
            MemoryProfile::Hd720p => (1280, 720),
            MemoryProfile::Hd => (1920, 1088),
        };

        Resolution { width, height }
    }
}

/// Capabilities requested when an instance is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InitParams {
    pub memory_profile: MemoryProfile,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum BrcType {
    NoBrc = 0,
    Cbr = 1,
    #[default]
    Vbr = 2,
}

/// Coding type of a picture. The values double as the access unit
/// delimiter's `primary_pic_type`.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum PictureCodingType {
    #[default]
    I = 0,
    P = 1,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum IntraRefreshType {
    #[default]
    Disabled = 0,
    Adaptive = 1,
    Cyclic = 2,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum TransformMode {
    NoT8x8 = 0,
    #[default]
    T8x8Allowed = 1,
}

/// Layout of the source pictures in memory.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum SamplingMode {
    /// 4:2:0 semi-planar, as NV12.
    #[default]
    Semiplanar420 = 0,
    /// 4:2:2 raster, as YUYV.
    Raster422 = 1,
}

/// Colour standard of the source, written to the VUI colour description.
/// The values are the H.264 Table E-3 `colour_primaries` codes.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ColorStandard {
    #[default]
    Unspecified = 0,
    Bt709 = 1,
    Bt470M = 4,
    Bt470Bg = 5,
    Smpte170M = 6,
    Smpte240M = 7,
}

impl ColorStandard {
    /// Code used for the colour primaries, transfer characteristics and
    /// matrix coefficients.
    pub fn vui_code(self) -> u8 {
        match self {
            // 2 means "unspecified" in all three tables.
            ColorStandard::Unspecified => 2,
            other => other as u8,
        }
    }
}

/// Video usability settings copied into the SPS when
/// [`SequenceParams::vui_parameters_present`] is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiSettings {
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub video_format: u8,
    pub video_full_range: bool,
    pub color_standard: ColorStandard,
}

impl Default for VuiSettings {
    fn default() -> Self {
        Self {
            // 1:1 square samples.
            aspect_ratio_idc: 1,
            sar_width: 1,
            sar_height: 1,
            // Unspecified video format.
            video_format: 5,
            video_full_range: false,
            color_standard: ColorStandard::Unspecified,
        }
    }
}

/// Stream-wide parameters, changed rarely. Applying them starts a new group of
/// pictures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceParams {
    pub frame_width: u16,
    pub frame_height: u16,

    pub profile: Profile,
    pub level: Level,

    pub log2_max_frame_num_minus4: u8,
    /// Picture order count type. Only 0 and 2 are supported.
    pub pic_order_cnt_type: u8,

    pub use_constrained_intra: bool,
    pub intra_refresh_type: IntraRefreshType,
    /// Refresh period or macroblock count, depending on `intra_refresh_type`.
    pub intra_refresh_param: u16,

    pub brc_type: BrcType,
    /// Target bit rate, in bits per second.
    pub bitrate: u32,
    /// Coded picture buffer size, in bits.
    pub cpb_buffer_size: u32,
    pub framerate_num: u16,
    pub framerate_den: u16,
    /// Initial CPB removal delay, in milliseconds.
    pub delay: u16,
    pub strict_hrd_compliancy: bool,

    pub transform_mode: TransformMode,
    pub sampling_mode: SamplingMode,
    /// Motion search effort, 0 being the fastest.
    pub encoder_complexity: u8,
    /// Quantization parameter used without rate control.
    pub quant: u8,
    pub qp_min: u8,
    pub qp_max: u8,

    pub vui_parameters_present: bool,
    pub vui: VuiSettings,

    pub sei_buffering_period_present: bool,
    pub sei_pic_timing_present: bool,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            frame_width: 1280,
            frame_height: 720,
            profile: Profile::High,
            level: Level::L4,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 2,
            use_constrained_intra: false,
            intra_refresh_type: IntraRefreshType::Disabled,
            intra_refresh_param: 0,
            brc_type: BrcType::Vbr,
            bitrate: 4_000_000,
            cpb_buffer_size: 4_000_000,
            framerate_num: 25,
            framerate_den: 1,
            delay: 1000,
            strict_hrd_compliancy: true,
            transform_mode: TransformMode::T8x8Allowed,
            sampling_mode: SamplingMode::Semiplanar420,
            encoder_complexity: 0,
            quant: 28,
            qp_min: 10,
            qp_max: MAX_QP,
            vui_parameters_present: true,
            vui: Default::default(),
            sei_buffering_period_present: true,
            sei_pic_timing_present: true,
        }
    }
}

impl SequenceParams {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: u32::from(self.frame_width),
            height: u32::from(self.frame_height),
        }
    }

    pub fn sei_present(&self) -> bool {
        self.sei_buffering_period_present || self.sei_pic_timing_present
    }

    /// Checks the parameters against what an instance allocated for
    /// `max_resolution` can encode.
    pub fn validate(&self, max_resolution: Resolution) -> Result<(), ParamError> {
        let resolution = self.resolution();
        if resolution.width == 0
            || resolution.height == 0
            || resolution.width > max_resolution.width
            || resolution.height > max_resolution.height
        {
            return Err(ParamError::Resolution {
                resolution,
                max: max_resolution,
            });
        }

        if self.framerate_num == 0 || self.framerate_den == 0 {
            return Err(ParamError::Framerate(
                self.framerate_num,
                self.framerate_den,
            ));
        }

        if self.log2_max_frame_num_minus4 > MAX_LOG2_MAX_FRAME_NUM_MINUS4 {
            return Err(ParamError::Log2MaxFrameNum(self.log2_max_frame_num_minus4));
        }

        if !matches!(self.pic_order_cnt_type, 0 | 2) {
            return Err(ParamError::PicOrderCntType(self.pic_order_cnt_type));
        }

        if self.qp_min > self.qp_max || self.qp_max > MAX_QP || self.quant > MAX_QP {
            return Err(ParamError::QpRange {
                min: self.qp_min,
                max: self.qp_max,
            });
        }

        // The timing model divides by bitrate / 16.
        if self.brc_type != BrcType::NoBrc && self.bitrate < 16 {
            return Err(ParamError::Bitrate(self.bitrate));
        }

        if self.brc_type != BrcType::NoBrc && self.cpb_buffer_size == 0 {
            return Err(ParamError::CpbSize(self.cpb_buffer_size));
        }

        Ok(())
    }
}

/// Per picture parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameParams {
    pub picture_coding_type: PictureCodingType,
    pub idr: bool,
    pub first_picture_in_sequence: bool,

    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    /// Device address of the source picture.
    pub addr_source_buffer: u32,
    /// Device address where the access unit starts.
    pub addr_output_bitstream_start: u32,
    /// Device address one past the end of the output buffer.
    pub addr_output_bitstream_end: u32,
    /// Bit offset of the access unit from `addr_output_bitstream_start`. Must
    /// be byte aligned.
    pub bitstream_offset: u32,
}

impl FrameParams {
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.disable_deblocking_filter_idc > 2
            || !(-6..=6).contains(&self.slice_alpha_c0_offset_div2)
            || !(-6..=6).contains(&self.slice_beta_offset_div2)
        {
            return Err(ParamError::Deblocking {
                idc: self.disable_deblocking_filter_idc,
                alpha: self.slice_alpha_c0_offset_div2,
                beta: self.slice_beta_offset_div2,
            });
        }

        if self.idr && self.picture_coding_type != PictureCodingType::I {
            return Err(ParamError::IdrNotIntra);
        }

        if self.bitstream_offset % 8 != 0 {
            return Err(ParamError::BitstreamOffset(self.bitstream_offset));
        }

        let start = u64::from(self.addr_output_bitstream_start)
            + u64::from(self.bitstream_offset / 8);
        if start >= u64::from(self.addr_output_bitstream_end) {
            return Err(ParamError::OutputBuffer {
                start: self.addr_output_bitstream_start,
                end: self.addr_output_bitstream_end,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("resolution {resolution:?} exceeds the instance maximum {max:?}")]
    Resolution {
        resolution: Resolution,
        max: Resolution,
    },
    #[error("invalid framerate {0}/{1}")]
    Framerate(u16, u16),
    #[error("log2_max_frame_num_minus4 {0} out of range")]
    Log2MaxFrameNum(u8),
    #[error("unsupported picture order count type {0}")]
    PicOrderCntType(u8),
    #[error("invalid QP range {min}..={max}")]
    QpRange { min: u8, max: u8 },
    #[error("bitrate {0} too low for rate control")]
    Bitrate(u32),
    #[error("CPB size {0} too low for rate control")]
    CpbSize(u32),
    #[error("invalid deblocking parameters idc {idc} alpha {alpha} beta {beta}")]
    Deblocking { idc: u8, alpha: i8, beta: i8 },
    #[error("IDR pictures must be intra coded")]
    IdrNotIntra,
    #[error("bitstream offset {0} is not byte aligned")]
    BitstreamOffset(u32),
    #[error("empty output buffer {start:#x}..{end:#x}")]
    OutputBuffer { start: u32, end: u32 },
    #[error("no sequence parameters were set")]
    NoSequence,
}

pub type ParamResult<T> = Result<T, ParamError>;
