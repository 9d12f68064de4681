// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The subset of H.264 header syntax the accelerator host emits: one SPS, one
//! PPS, buffering-period and picture-timing SEI, and the access unit delimiter.

use enumn::N;

/// Extended Sample Aspect Ratio - H.264 Table E-1
pub const EXTENDED_SAR: u8 = 255;

/// SEI payload types, H.264 Annex D.
pub const SEI_BUFFERING_PERIOD: u8 = 0;
pub const SEI_PICTURE_TIMING: u8 = 1;

/// Number of clock timestamps per `pic_struct` value, H.264 Table D-1.
pub const PIC_STRUCT_NUM_CLOCK_TS: [usize; 9] = [1, 1, 1, 2, 2, 3, 3, 2, 3];

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    #[default]
    High = 100,
    High10 = 110,
    High422P = 122,
    High444 = 144,
}

impl Profile {
    /// Whether the SPS carries the chroma format and bit depth fields.
    pub fn is_high(self) -> bool {
        matches!(
            self,
            Profile::High | Profile::High10 | Profile::High422P | Profile::High444
        )
    }

    /// Baseline and Extended streams are CAVLC coded, everything else uses CABAC.
    pub fn entropy_coding_mode(self) -> EntropyCodingMode {
        match self {
            Profile::Baseline | Profile::Extended => EntropyCodingMode::Cavlc,
            _ => EntropyCodingMode::Cabac,
        }
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    #[default]
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
}

impl Level {
    /// Returns the `level_idc` and `constraint_set3_flag` signalling this level
    /// for `profile`. Level 1b is coded as 1.1 plus the constraint flag outside
    /// the High profiles.
    pub fn signalled(self, profile: Profile) -> (u8, bool) {
        match self {
            Level::L1B if !profile.is_high() => (Level::L1_1 as u8, true),
            Level::L1B => (9, false),
            level => (level as u8, false),
        }
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum EntropyCodingMode {
    #[default]
    Cavlc = 0,
    Cabac = 1,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub bit_rate_value_minus1: u32,
    pub cpb_size_value_minus1: u32,
    pub cbr_flag: bool,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,
    pub bitstream_restriction_flag: bool,
}

/// A H264 Sequence Parameter Set restricted to progressive, single reference,
/// 4:2:0 streams without scaling matrices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub level_idc: u8,

    /// High profiles only.
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub seq_scaling_matrix_present_flag: bool,

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub frame_mbs_only_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    pub fn is_high_profile(&self) -> bool {
        Profile::n(self.profile_idc).map(Profile::is_high).unwrap_or(false)
    }
}

/// A H264 Picture Parameter Set with a single slice group and no scaling
/// matrices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    /// Written only when the SPS is High profile.
    pub transform_8x8_mode_flag: bool,
    pub second_chroma_qp_index_offset: i8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferingPeriod {
    pub seq_parameter_set_id: u8,
    pub nal_initial_cpb_removal_delay: u32,
    pub nal_initial_cpb_removal_delay_offset: u32,
    pub vcl_initial_cpb_removal_delay: u32,
    pub vcl_initial_cpb_removal_delay_offset: u32,
}

/// One clock timestamp of a picture timing message, H.264 D.1.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockTimestamp {
    pub clock_timestamp_flag: bool,
    pub ct_type: u8,
    pub nuit_field_based_flag: bool,
    pub counting_type: u8,
    pub full_timestamp_flag: bool,
    pub discontinuity_flag: bool,
    pub cnt_dropped_flag: bool,
    pub n_frames: u8,
    pub seconds_flag: bool,
    pub seconds_value: u8,
    pub minutes_flag: bool,
    pub minutes_value: u8,
    pub hours_flag: bool,
    pub hours_value: u8,
    pub time_offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PicTiming {
    pub cpb_removal_delay: u32,
    pub dpb_output_delay: u32,
    pub pic_struct: u8,
    pub clock_timestamps: [ClockTimestamp; 3],
}

/// Field lengths shared by the HRD parameters and the SEI payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HrdLengths {
    pub initial_cpb_removal_delay_length: u8,
    pub cpb_removal_delay_length: u8,
    pub dpb_output_delay_length: u8,
    pub time_offset_length: u8,
}

/// The SEI messages of one access unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sei {
    pub lengths: HrdLengths,
    pub pic_struct_present_flag: bool,
    pub buffering_period: Option<BufferingPeriod>,
    pub pic_timing: Option<PicTiming>,
}

impl Sei {
    pub fn is_empty(&self) -> bool {
        self.buffering_period.is_none() && self.pic_timing.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_1b_signalling() {
        assert_eq!(Level::L1B.signalled(Profile::Baseline), (11, true));
        assert_eq!(Level::L1B.signalled(Profile::Main), (11, true));
        assert_eq!(Level::L1B.signalled(Profile::High), (9, false));
        assert_eq!(Level::L3_1.signalled(Profile::Main), (31, false));
    }

    #[test]
    fn entropy_mode_follows_profile() {
        assert_eq!(
            Profile::Baseline.entropy_coding_mode(),
            EntropyCodingMode::Cavlc
        );
        assert_eq!(
            Profile::Extended.entropy_coding_mode(),
            EntropyCodingMode::Cavlc
        );
        assert_eq!(Profile::Main.entropy_coding_mode(), EntropyCodingMode::Cabac);
        assert_eq!(Profile::High.entropy_coding_mode(), EntropyCodingMode::Cabac);
    }
}
