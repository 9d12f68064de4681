// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Non-VCL NAL units of a stream.
//!
//! The accelerator only produces slice data. [`NvclContext`] keeps the SPS,
//! PPS and SEI state of one instance and writes the access unit delimiter,
//! parameter sets, SEI and filler data around it. Each structure is
//! initialised once per sequence, updated per frame and then synthesized.

use crate::codec::h264::synthesizer::AccessUnitDelimiter;
use crate::codec::h264::synthesizer::FillerData;
use crate::codec::h264::synthesizer::Synthesizer;
use crate::codec::h264::synthesizer::SynthesizerResult;
use crate::codec::h264::syntax::BufferingPeriod;
use crate::codec::h264::syntax::ClockTimestamp;
use crate::codec::h264::syntax::EntropyCodingMode;
use crate::codec::h264::syntax::HrdLengths;
use crate::codec::h264::syntax::HrdParams;
use crate::codec::h264::syntax::PicTiming;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::Profile;
use crate::codec::h264::syntax::Sei;
use crate::codec::h264::syntax::Sps;
use crate::codec::h264::syntax::VuiParams;
use crate::encoder::hva::brc::deconstruct_value;
use crate::encoder::hva::brc::reconstruct_value;
use crate::encoder::hva::brc::BITRATE_SCALE_OFFSET;
use crate::encoder::hva::brc::CPB_SIZE_SCALE_OFFSET;
use crate::encoder::hva::params::BrcType;
use crate::encoder::hva::params::FrameParams;
use crate::encoder::hva::params::PictureCodingType;
use crate::encoder::hva::params::SequenceParams;
use crate::encoder::hva::params::TransformMode;

pub const INITIAL_CPB_REMOVAL_DELAY_LENGTH: u8 = 18;
pub const CPB_REMOVAL_DELAY_LENGTH: u8 = 18;
pub const DPB_OUTPUT_DELAY_LENGTH: u8 = 6;
pub const TIME_OFFSET_LENGTH: u8 = 0;

/// Clock of the HRD timestamps and of the VUI timing info.
pub const SEI_TIME_SCALE: u32 = 90000;
/// Fractional bits kept on the HRD timestamps.
pub const TIMING_PRECISION: u32 = 16;
/// Start code, NAL header and trailing byte of a filler data NAL unit.
pub const FILLER_DATA_HEADER_SIZE: u32 = 6;
pub const CHROMA_QP_INDEX_OFFSET: i8 = 2;

/// Framerate assumed when none is known.
pub const DEFAULT_FRAMERATE_NUM: u32 = 25;
pub const DEFAULT_FRAMERATE_DEN: u32 = 1;

/// Start code, NAL header and RBSP trailing byte, in bits.
const NALU_OVERHEAD_BITS: u32 = (4 + 1 + 1) * 8;

fn field_mask(length: u8) -> u32 {
    ((1u64 << length) - 1) as u32
}

/// Recognisable pattern for fields written before their first update.
fn unset_pattern(length: u8) -> u32 {
    0xaaaa_aaaa & field_mask(length)
}

/// Length of `ue(v)` coding `value`, in bits.
fn ue_len(value: u32) -> u32 {
    let bits = u64::BITS - (u64::from(value) + 1).leading_zeros();
    2 * bits - 1
}

/// `a * b / c` without intermediate overflow, saturating the result.
fn mul_div(a: u64, b: u64, c: u64) -> u64 {
    let value = u128::from(a) * u128::from(b) / u128::from(c.max(1));
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// HRD timestamps, in units of 1/90000 s with [`TIMING_PRECISION`] fractional
/// bits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdTiming {
    pub nal_last_bp_removal_time: u64,
    pub vcl_last_bp_removal_time: u64,
    pub nal_final_arrival_time: u64,
    pub vcl_final_arrival_time: u64,
    /// Removal time of the current access unit, in frame periods.
    pub curr_au_ts: u32,
    /// Removal time of the last access unit carrying a buffering period.
    pub last_bp_au_ts: u32,
    /// Send a buffering period with the next access unit.
    pub force_bp: bool,
}

/// Encoder output needed to finalise the SEI of a picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HrdReport {
    /// Removal time of the picture, in frame periods.
    pub removal_time: u32,
    /// VCL bytes written by the accelerator.
    pub bitstream_size: u32,
    pub stuffing_bits: u32,
}

pub struct NvclContext {
    sps: Sps,
    pps: Pps,
    sei: Sei,
    /// Buffering period and picture timing contents, kept across pictures.
    buffering_period: BufferingPeriod,
    pic_timing: PicTiming,
    timing: HrdTiming,
    lengths: HrdLengths,

    seq_parameter_set_id: u8,
    entropy_coding_mode: EntropyCodingMode,
    chroma_qp_index_offset: i8,

    brc_type: BrcType,
    /// Bit rate used for the arrival times.
    bitrate: u32,
    pic_struct_present: bool,
    sei_buffering_period_present: bool,
    sei_pic_timing_present: bool,
    constrained_intra_pred: bool,
    transform_8x8_mode: bool,

    /// Bytes of non-VCL NAL units in the current access unit.
    nvcl_nalu_size: u32,
}

impl NvclContext {
    /// Initialises the NAL state for a new sequence.
    pub fn new(params: &SequenceParams) -> Self {
        let lengths = HrdLengths {
            initial_cpb_removal_delay_length: INITIAL_CPB_REMOVAL_DELAY_LENGTH,
            cpb_removal_delay_length: CPB_REMOVAL_DELAY_LENGTH,
            dpb_output_delay_length: DPB_OUTPUT_DELAY_LENGTH,
            time_offset_length: TIME_OFFSET_LENGTH,
        };

        let initial_delay = unset_pattern(lengths.initial_cpb_removal_delay_length);
        let clock_timestamp = ClockTimestamp {
            n_frames: 0xaa,
            seconds_value: 0xaa,
            minutes_value: 0xaa,
            hours_value: 0xaa,
            time_offset: 0xaa,
            ..Default::default()
        };

        let mut context = Self {
            sps: Default::default(),
            pps: Default::default(),
            sei: Default::default(),
            buffering_period: BufferingPeriod {
                seq_parameter_set_id: 0,
                nal_initial_cpb_removal_delay: initial_delay,
                nal_initial_cpb_removal_delay_offset: initial_delay,
                vcl_initial_cpb_removal_delay: initial_delay,
                vcl_initial_cpb_removal_delay_offset: initial_delay,
            },
            pic_timing: PicTiming {
                cpb_removal_delay: unset_pattern(lengths.cpb_removal_delay_length),
                dpb_output_delay: unset_pattern(lengths.dpb_output_delay_length),
                // Progressive frame.
                pic_struct: 0,
                clock_timestamps: [
                    clock_timestamp.clone(),
                    clock_timestamp.clone(),
                    clock_timestamp,
                ],
            },
            timing: Default::default(),
            lengths,
            seq_parameter_set_id: 0,
            entropy_coding_mode: params.profile.entropy_coding_mode(),
            chroma_qp_index_offset: CHROMA_QP_INDEX_OFFSET,
            brc_type: params.brc_type,
            bitrate: params.bitrate,
            pic_struct_present: false,
            sei_buffering_period_present: params.sei_buffering_period_present,
            sei_pic_timing_present: params.sei_pic_timing_present,
            constrained_intra_pred: params.use_constrained_intra,
            transform_8x8_mode: params.transform_mode == TransformMode::T8x8Allowed,
            nvcl_nalu_size: 0,
        };

        context.update_sequence(params);
        context
    }

    /// Starts a new access unit.
    pub fn begin_access_unit(&mut self, profile: Profile) {
        self.nvcl_nalu_size = 0;
        self.entropy_coding_mode = profile.entropy_coding_mode();
        self.chroma_qp_index_offset = CHROMA_QP_INDEX_OFFSET;
    }

    pub fn sps(&self) -> &Sps {
        &self.sps
    }

    pub fn pps(&self) -> &Pps {
        &self.pps
    }

    /// SEI messages of the last generated SEI NAL unit.
    pub fn sei(&self) -> &Sei {
        &self.sei
    }

    pub fn timing(&self) -> &HrdTiming {
        &self.timing
    }

    pub fn entropy_coding_mode(&self) -> EntropyCodingMode {
        self.entropy_coding_mode
    }

    pub fn chroma_qp_index_offset(&self) -> i8 {
        self.chroma_qp_index_offset
    }

    /// Bit rate the arrival times are computed with.
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Non-VCL bytes of the current access unit.
    pub fn nvcl_nalu_size(&self) -> u32 {
        self.nvcl_nalu_size
    }

    /// Refreshes the SPS and the stream state it carries.
    pub fn update_sequence(&mut self, params: &SequenceParams) {
        let (level_idc, constraint_set3_flag) = params.level.signalled(params.profile);

        let (width_mbs, height_mbs) = params.resolution().macroblocks();
        let crop_right = match params.frame_width & 0xf {
            0 => 0,
            rem => u32::from(16 - rem) >> 1,
        };
        let crop_bottom = match params.frame_height & 0xf {
            0 => 0,
            rem => u32::from(16 - rem) >> 1,
        };

        self.sps = Sps {
            seq_parameter_set_id: self.seq_parameter_set_id,
            profile_idc: params.profile as u8,
            constraint_set3_flag,
            level_idc,
            chroma_format_idc: 1,
            log2_max_frame_num_minus4: params.log2_max_frame_num_minus4,
            pic_order_cnt_type: params.pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            max_num_ref_frames: 1,
            pic_width_in_mbs_minus1: (width_mbs - 1) as u16,
            pic_height_in_map_units_minus1: (height_mbs - 1) as u16,
            frame_mbs_only_flag: true,
            direct_8x8_inference_flag: true,
            frame_cropping_flag: crop_right != 0 || crop_bottom != 0,
            frame_crop_right_offset: crop_right,
            frame_crop_bottom_offset: crop_bottom,
            vui_parameters_present_flag: params.vui_parameters_present,
            vui_parameters: if params.vui_parameters_present {
                self.vui_parameters(params)
            } else {
                Default::default()
            },
            ..Default::default()
        };

        self.brc_type = params.brc_type;
        if params.vui_parameters_present {
            let hrd = &self.sps.vui_parameters.nal_hrd_parameters;
            self.bitrate = reconstruct_value(
                hrd.bit_rate_value_minus1 + 1,
                u32::from(hrd.bit_rate_scale),
                BITRATE_SCALE_OFFSET,
            );
            self.pic_struct_present = self.sps.vui_parameters.pic_struct_present_flag;
        } else {
            self.bitrate = params.bitrate;
            self.pic_struct_present = false;
        }

        self.sei_buffering_period_present = params.sei_buffering_period_present;
        self.sei_pic_timing_present = params.sei_pic_timing_present;
        self.constrained_intra_pred = params.use_constrained_intra;
        self.transform_8x8_mode = params.transform_mode == TransformMode::T8x8Allowed;
    }

    fn vui_parameters(&self, params: &SequenceParams) -> VuiParams {
        let (num, den) = match (params.framerate_num, params.framerate_den) {
            (0, _) | (_, 0) => (DEFAULT_FRAMERATE_NUM, DEFAULT_FRAMERATE_DEN),
            (num, den) => (u32::from(num), u32::from(den)),
        };
        let color = params.vui.color_standard.vui_code();
        // Ticks are fields. Slow rates need more than 32 bits on the way.
        let num_units_in_tick = u64::from(den) * u64::from(SEI_TIME_SCALE) / 2 / u64::from(num);
        let num_units_in_tick = u32::try_from(num_units_in_tick).unwrap_or(u32::MAX);

        VuiParams {
            aspect_ratio_info_present_flag: true,
            aspect_ratio_idc: params.vui.aspect_ratio_idc,
            sar_width: params.vui.sar_width,
            sar_height: params.vui.sar_height,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: true,
            video_format: params.vui.video_format,
            video_full_range_flag: params.vui.video_full_range,
            colour_description_present_flag: true,
            colour_primaries: color,
            transfer_characteristics: color,
            matrix_coefficients: color,
            chroma_loc_info_present_flag: false,
            timing_info_present_flag: true,
            num_units_in_tick,
            time_scale: SEI_TIME_SCALE,
            // Frames may be skipped.
            fixed_frame_rate_flag: false,
            nal_hrd_parameters_present_flag: true,
            nal_hrd_parameters: self.hrd_parameters(params),
            vcl_hrd_parameters_present_flag: true,
            vcl_hrd_parameters: self.hrd_parameters(params),
            low_delay_hrd_flag: true,
            pic_struct_present_flag: false,
            bitstream_restriction_flag: false,
        }
    }

    fn hrd_parameters(&self, params: &SequenceParams) -> HrdParams {
        let bitrate = deconstruct_value(params.bitrate, BITRATE_SCALE_OFFSET);
        let cpb = deconstruct_value(params.cpb_buffer_size, CPB_SIZE_SCALE_OFFSET);

        HrdParams {
            bit_rate_scale: bitrate.scale as u8,
            cpb_size_scale: cpb.scale as u8,
            bit_rate_value_minus1: bitrate.value - 1,
            cpb_size_value_minus1: cpb.value - 1,
            // The hardware rate control never lets the CPB underflow.
            cbr_flag: true,
            initial_cpb_removal_delay_length_minus1: self.lengths.initial_cpb_removal_delay_length - 1,
            cpb_removal_delay_length_minus1: self.lengths.cpb_removal_delay_length - 1,
            dpb_output_delay_length_minus1: self.lengths.dpb_output_delay_length - 1,
            time_offset_length: self.lengths.time_offset_length,
        }
    }

    fn update_pps(&mut self) {
        self.pps = Pps {
            pic_parameter_set_id: self.entropy_coding_mode as u8,
            seq_parameter_set_id: self.seq_parameter_set_id,
            entropy_coding_mode_flag: self.entropy_coding_mode == EntropyCodingMode::Cabac,
            chroma_qp_index_offset: self.chroma_qp_index_offset,
            deblocking_filter_control_present_flag: true,
            constrained_intra_pred_flag: self.constrained_intra_pred,
            transform_8x8_mode_flag: self.transform_8x8_mode,
            second_chroma_qp_index_offset: self.chroma_qp_index_offset,
            ..Default::default()
        };
    }

    /// Appends an access unit delimiter and returns its size in bits.
    pub fn write_aud(
        &mut self,
        picture_coding_type: PictureCodingType,
        out: &mut Vec<u8>,
    ) -> SynthesizerResult<u32> {
        let aud = AccessUnitDelimiter {
            primary_pic_type: picture_coding_type as u8,
        };
        let size = Synthesizer::<AccessUnitDelimiter, _>::synthesize(&aud, &mut *out)? as u32;
        self.nvcl_nalu_size += size;
        log::trace!("access unit delimiter: {} bytes", size);

        Ok(size * 8)
    }

    /// Appends the SPS for `params` and returns its size in bits.
    pub fn write_sps(
        &mut self,
        params: &SequenceParams,
        out: &mut Vec<u8>,
    ) -> SynthesizerResult<u32> {
        self.update_sequence(params);

        let size = Synthesizer::<Sps, _>::synthesize(&self.sps, &mut *out)? as u32;
        self.nvcl_nalu_size += size;
        log::trace!("sequence parameter set: {} bytes", size);

        Ok(size * 8)
    }

    /// Appends the PPS and returns its size in bits.
    pub fn write_pps(&mut self, out: &mut Vec<u8>) -> SynthesizerResult<u32> {
        self.update_pps();

        let high_profile = self.sps.is_high_profile();
        let size = Synthesizer::<Pps, _>::synthesize(&self.pps, high_profile, &mut *out)? as u32;
        self.nvcl_nalu_size += size;
        log::trace!("picture parameter set: {} bytes", size);

        Ok(size * 8)
    }

    fn sends_buffering_period(&self, frame: &FrameParams) -> bool {
        self.sei_buffering_period_present
            && (self.timing.force_bp || frame.idr || frame.first_picture_in_sequence)
    }

    /// Upper bound of the SEI NAL unit that [`Self::write_sei`] will produce
    /// for `frame`, emulation prevention aside, in bits. 0 when no message
    /// is due.
    pub fn estimate_sei_size(&self, frame: &FrameParams) -> u32 {
        // One size byte per started 255 bytes of payload.
        let message_bits = |payload_bits: u32| {
            let payload = payload_bits.next_multiple_of(8);
            payload + 8 + (((payload >> (3 + 8)) + 1) << 3)
        };

        let mut total = 0;

        if self.sends_buffering_period(frame) {
            let delay_bits = u32::from(self.lengths.initial_cpb_removal_delay_length);
            // NAL and VCL delay and offset.
            total += message_bits(ue_len(self.seq_parameter_set_id.into()) + 4 * delay_bits);
        }

        if self.sei_pic_timing_present {
            let mut bits = u32::from(self.lengths.cpb_removal_delay_length)
                + u32::from(self.lengths.dpb_output_delay_length);
            if self.pic_struct_present {
                bits += 4;
            }
            total += message_bits(bits);
        }

        if total == 0 {
            return 0;
        }

        total + NALU_OVERHEAD_BITS
    }

    /// Updates the SEI contents ahead of generation. Returns whether a
    /// buffering period is sent.
    fn update_sei(&mut self, frame: &FrameParams, removal_time: u32) -> bool {
        let send_bp = self.sends_buffering_period(frame);
        let timing = &mut self.timing;
        timing.curr_au_ts = removal_time;

        let delta_ts = u64::from(timing.curr_au_ts.saturating_sub(timing.last_bp_au_ts));
        let vui = &self.sps.vui_parameters;
        // Frame periods, except for the first CBR picture whose removal time is
        // in 90 kHz ticks.
        let delta_time = if self.brc_type == BrcType::Vbr || !frame.first_picture_in_sequence {
            mul_div(
                (delta_ts * 2).saturating_mul(u64::from(vui.num_units_in_tick)),
                u64::from(SEI_TIME_SCALE) << TIMING_PRECISION,
                u64::from(vui.time_scale),
            )
        } else {
            mul_div(
                delta_ts * 2,
                1 << TIMING_PRECISION,
                u64::from(SEI_TIME_SCALE),
            )
        };

        if send_bp {
            timing.nal_last_bp_removal_time =
                timing.nal_last_bp_removal_time.saturating_add(delta_time);
            timing.vcl_last_bp_removal_time =
                timing.vcl_last_bp_removal_time.saturating_add(delta_time);

            let max_delay = u64::from(field_mask(self.lengths.initial_cpb_removal_delay_length));
            let bp = &mut self.buffering_period;
            bp.seq_parameter_set_id = self.seq_parameter_set_id;
            bp.nal_initial_cpb_removal_delay = timing
                .nal_last_bp_removal_time
                .checked_sub(timing.nal_final_arrival_time)
                .map_or(0, |d| (d >> TIMING_PRECISION).min(max_delay) as u32);
            bp.vcl_initial_cpb_removal_delay = timing
                .vcl_last_bp_removal_time
                .checked_sub(timing.vcl_final_arrival_time)
                .map_or(0, |d| (d >> TIMING_PRECISION).min(max_delay) as u32);

            log::debug!(
                "buffering period at {}: initial removal delay nal {} vcl {}",
                timing.curr_au_ts,
                bp.nal_initial_cpb_removal_delay,
                bp.vcl_initial_cpb_removal_delay
            );
        }

        if self.sei_pic_timing_present {
            let pt = &mut self.pic_timing;
            if frame.first_picture_in_sequence {
                pt.cpb_removal_delay = 0;
                pt.dpb_output_delay = 0;
            } else {
                // Ticks are fields: one frame to fill the CPB since the last
                // buffering period, then one frame before output.
                pt.cpb_removal_delay = (delta_ts * 2) as u32;
                pt.dpb_output_delay = 2;
            }
        }

        self.sei = Sei {
            lengths: self.lengths,
            pic_struct_present_flag: self.pic_struct_present,
            buffering_period: send_bp.then(|| self.buffering_period.clone()),
            pic_timing: self
                .sei_pic_timing_present
                .then(|| self.pic_timing.clone()),
        };

        send_bp
    }

    /// Advances the arrival times once the access unit is complete.
    fn update_sei_post(&mut self, report: &HrdReport, bp_sent: bool) {
        let fill_len = if report.stuffing_bits > 0 {
            report.stuffing_bits / 8 + FILLER_DATA_HEADER_SIZE
        } else {
            0
        };

        if self.bitrate >> 4 == 0 {
            log::error!("bitrate {} too low to time access units", self.bitrate);
            return;
        }

        let bytes_per_second = u64::from(self.bitrate / 8);
        let scale = u64::from(SEI_TIME_SCALE) << TIMING_PRECISION;
        let timing = &mut self.timing;

        let au_bytes = u64::from(self.nvcl_nalu_size)
            + u64::from(report.bitstream_size)
            + u64::from(fill_len);
        timing.nal_final_arrival_time = timing
            .nal_final_arrival_time
            .saturating_add(mul_div(au_bytes, scale, bytes_per_second));
        timing.vcl_final_arrival_time = timing.vcl_final_arrival_time.saturating_add(mul_div(
            report.bitstream_size.into(),
            scale,
            bytes_per_second,
        ));

        if bp_sent {
            timing.last_bp_au_ts = timing.curr_au_ts;
            timing.force_bp = false;
        }

        // Removal delays since the last buffering period must stay codable.
        let length = self
            .lengths
            .cpb_removal_delay_length
            .min(self.lengths.dpb_output_delay_length);
        let limit = 1u32 << (length - 1);
        if timing.curr_au_ts.saturating_sub(timing.last_bp_au_ts) > limit {
            timing.force_bp = true;
        }

        log::trace!(
            "final arrival nal {} vcl {}, force bp {}",
            timing.nal_final_arrival_time >> TIMING_PRECISION,
            timing.vcl_final_arrival_time >> TIMING_PRECISION,
            timing.force_bp
        );
    }

    /// Updates the SEI for a completed picture and appends the SEI NAL unit.
    /// Returns its size in bits, 0 when no message was due.
    pub fn write_sei(
        &mut self,
        frame: &FrameParams,
        report: &HrdReport,
        out: &mut Vec<u8>,
    ) -> SynthesizerResult<u32> {
        let bp_sent = self.update_sei(frame, report.removal_time);

        let size = if self.sei.is_empty() {
            0
        } else {
            Synthesizer::<Sei, _>::synthesize(&self.sei, &mut *out)? as u32
        };
        self.nvcl_nalu_size += size;

        self.update_sei_post(report, bp_sent);
        log::trace!("SEI: {} bytes", size);

        Ok(size * 8)
    }

    /// Appends a filler data NAL unit carrying `stuffing_bits` and returns its
    /// size in bits.
    pub fn write_filler(&mut self, stuffing_bits: u32, out: &mut Vec<u8>) -> SynthesizerResult<u32> {
        let filler = FillerData {
            ff_byte_count: (stuffing_bits / 8) as usize,
        };
        let size = Synthesizer::<FillerData, _>::synthesize(&filler, &mut *out)? as u32;
        self.nvcl_nalu_size += size;
        log::trace!("filler data: {} bytes for {} stuffing bits", size, stuffing_bits);

        Ok(size * 8)
    }
}
