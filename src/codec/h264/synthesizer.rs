// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.
use std::io::Write;

use thiserror::Error;

use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::nalu_writer::NaluWriterError;
use crate::codec::h264::syntax::BufferingPeriod;
use crate::codec::h264::syntax::HrdLengths;
use crate::codec::h264::syntax::HrdParams;
use crate::codec::h264::syntax::PicTiming;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::Sei;
use crate::codec::h264::syntax::Sps;
use crate::codec::h264::syntax::EXTENDED_SAR;
use crate::codec::h264::syntax::PIC_STRUCT_NUM_CLOCK_TS;
use crate::codec::h264::syntax::SEI_BUFFERING_PERIOD;
use crate::codec::h264::syntax::SEI_PICTURE_TIMING;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for Sei {}

impl private::NaluStruct for AccessUnitDelimiter {}

impl private::NaluStruct for FillerData {}

/// Access unit delimiter payload, H.264 7.3.2.4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessUnitDelimiter {
    pub primary_pic_type: u8,
}

/// Filler data payload, H.264 7.3.2.7.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillerData {
    /// Number of `0xff` bytes before the trailing bits.
    pub ff_byte_count: usize,
}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error("SEI payload of {0} bytes does not fit the message size field")]
    SeiPayloadTooLarge(usize),
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
/// Every `synthesize` returns the number of bytes emitted, start code included.
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn finish(mut self) -> SynthesizerResult<usize> {
        self.writer.rbsp_trailing_bits()?;
        Ok(self.writer.flush()?)
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(sps: &'n Sps, writer: W) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: sps,
        };

        s.writer.write_header(NaluHeader::new(NaluType::Sps))?;
        s.seq_parameter_set_data()?;
        s.finish()
    }

    fn hrd_parameters(&mut self, hrd_params: &HrdParams) -> SynthesizerResult<()> {
        // H.264 E.1.2, a single CPB specification.
        self.ue(/* cpb_cnt_minus1 */ 0u32)?;
        self.u(4, hrd_params.bit_rate_scale)?;
        self.u(4, hrd_params.cpb_size_scale)?;

        self.ue(hrd_params.bit_rate_value_minus1)?;
        self.ue(hrd_params.cpb_size_value_minus1)?;
        self.u(1, hrd_params.cbr_flag)?;

        self.u(5, hrd_params.initial_cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.dpb_output_delay_length_minus1)?;
        self.u(5, hrd_params.time_offset_length)?;

        Ok(())
    }

    fn vui_parameters(&mut self) -> SynthesizerResult<()> {
        // H.264 E.1.1
        let vui_params = &self.nalu.vui_parameters;

        self.u(1, vui_params.aspect_ratio_info_present_flag)?;
        if vui_params.aspect_ratio_info_present_flag {
            self.u(8, vui_params.aspect_ratio_idc)?;
            if vui_params.aspect_ratio_idc == EXTENDED_SAR {
                self.u(16, vui_params.sar_width)?;
                self.u(16, vui_params.sar_height)?;
            }
        }

        self.u(1, vui_params.overscan_info_present_flag)?;
        if vui_params.overscan_info_present_flag {
            self.u(1, vui_params.overscan_appropriate_flag)?;
        }

        self.u(1, vui_params.video_signal_type_present_flag)?;
        if vui_params.video_signal_type_present_flag {
            self.u(3, vui_params.video_format)?;
            self.u(1, vui_params.video_full_range_flag)?;

            self.u(1, vui_params.colour_description_present_flag)?;
            if vui_params.colour_description_present_flag {
                self.u(8, vui_params.colour_primaries)?;
                self.u(8, vui_params.transfer_characteristics)?;
                self.u(8, vui_params.matrix_coefficients)?;
            }
        }

        self.u(1, vui_params.chroma_loc_info_present_flag)?;
        if vui_params.chroma_loc_info_present_flag {
            self.ue(/* chroma_sample_loc_type_top_field */ 0u32)?;
            self.ue(/* chroma_sample_loc_type_bottom_field */ 0u32)?;
        }

        self.u(1, vui_params.timing_info_present_flag)?;
        if vui_params.timing_info_present_flag {
            self.u(32, vui_params.num_units_in_tick)?;
            self.u(32, vui_params.time_scale)?;
            self.u(1, vui_params.fixed_frame_rate_flag)?;
        }

        self.u(1, vui_params.nal_hrd_parameters_present_flag)?;
        if vui_params.nal_hrd_parameters_present_flag {
            self.hrd_parameters(&vui_params.nal_hrd_parameters)?;
        }
        self.u(1, vui_params.vcl_hrd_parameters_present_flag)?;
        if vui_params.vcl_hrd_parameters_present_flag {
            self.hrd_parameters(&vui_params.vcl_hrd_parameters)?;
        }

        if vui_params.nal_hrd_parameters_present_flag || vui_params.vcl_hrd_parameters_present_flag
        {
            self.u(1, vui_params.low_delay_hrd_flag)?;
        }

        self.u(1, vui_params.pic_struct_present_flag)?;

        if vui_params.bitstream_restriction_flag {
            return Err(SynthesizerError::Unsupported);
        }
        self.u(1, vui_params.bitstream_restriction_flag)?;

        Ok(())
    }

    fn seq_parameter_set_data(&mut self) -> SynthesizerResult<()> {
        // H.264 7.3.2.1.1
        self.u(8, self.nalu.profile_idc)?;
        self.u(1, self.nalu.constraint_set0_flag)?;
        self.u(1, self.nalu.constraint_set1_flag)?;
        self.u(1, self.nalu.constraint_set2_flag)?;
        self.u(1, self.nalu.constraint_set3_flag)?;
        self.u(4, /* constraint_set4_flag, constraint_set5_flag, reserved_zero_2bits */ 0u32)?;
        self.u(8, self.nalu.level_idc)?;
        self.ue(self.nalu.seq_parameter_set_id)?;

        if self.nalu.is_high_profile() {
            self.ue(self.nalu.chroma_format_idc)?;
            if self.nalu.chroma_format_idc == 3 {
                self.u(1, /* separate_colour_plane_flag */ false)?;
            }

            self.ue(self.nalu.bit_depth_luma_minus8)?;
            self.ue(self.nalu.bit_depth_chroma_minus8)?;
            self.u(1, self.nalu.qpprime_y_zero_transform_bypass_flag)?;

            if self.nalu.seq_scaling_matrix_present_flag {
                return Err(SynthesizerError::Unsupported);
            }
            self.u(1, self.nalu.seq_scaling_matrix_present_flag)?;
        }

        self.ue(self.nalu.log2_max_frame_num_minus4)?;
        self.ue(self.nalu.pic_order_cnt_type)?;

        match self.nalu.pic_order_cnt_type {
            0 => self.ue(self.nalu.log2_max_pic_order_cnt_lsb_minus4)?,
            2 => (),
            _ => return Err(SynthesizerError::Unsupported),
        }

        self.ue(self.nalu.max_num_ref_frames)?;
        self.u(1, self.nalu.gaps_in_frame_num_value_allowed_flag)?;
        self.ue(self.nalu.pic_width_in_mbs_minus1)?;
        self.ue(self.nalu.pic_height_in_map_units_minus1)?;

        if !self.nalu.frame_mbs_only_flag {
            return Err(SynthesizerError::Unsupported);
        }
        self.u(1, self.nalu.frame_mbs_only_flag)?;
        self.u(1, self.nalu.direct_8x8_inference_flag)?;

        self.u(1, self.nalu.frame_cropping_flag)?;
        if self.nalu.frame_cropping_flag {
            self.ue(self.nalu.frame_crop_left_offset)?;
            self.ue(self.nalu.frame_crop_right_offset)?;
            self.ue(self.nalu.frame_crop_top_offset)?;
            self.ue(self.nalu.frame_crop_bottom_offset)?;
        }

        self.u(1, self.nalu.vui_parameters_present_flag)?;
        if self.nalu.vui_parameters_present_flag {
            self.vui_parameters()?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    /// The High profile extension is written when `high_profile` is set.
    pub fn synthesize(pps: &'n Pps, high_profile: bool, writer: W) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: pps,
        };

        s.writer.write_header(NaluHeader::new(NaluType::Pps))?;
        s.pic_parameter_set_rbsp(high_profile)?;
        s.finish()
    }

    fn pic_parameter_set_rbsp(&mut self, high_profile: bool) -> SynthesizerResult<()> {
        // H.264 7.3.2.2
        self.ue(self.nalu.pic_parameter_set_id)?;
        self.ue(self.nalu.seq_parameter_set_id)?;
        self.u(1, self.nalu.entropy_coding_mode_flag)?;
        self.u(1, self.nalu.bottom_field_pic_order_in_frame_present_flag)?;
        self.ue(/* num_slice_groups_minus1 */ 0u32)?;
        self.ue(self.nalu.num_ref_idx_l0_default_active_minus1)?;
        self.ue(self.nalu.num_ref_idx_l1_default_active_minus1)?;
        self.u(1, self.nalu.weighted_pred_flag)?;
        self.u(2, self.nalu.weighted_bipred_idc)?;
        self.se(self.nalu.pic_init_qp_minus26)?;
        self.se(self.nalu.pic_init_qs_minus26)?;
        self.se(self.nalu.chroma_qp_index_offset)?;
        self.u(1, self.nalu.deblocking_filter_control_present_flag)?;
        self.u(1, self.nalu.constrained_intra_pred_flag)?;
        self.u(1, self.nalu.redundant_pic_cnt_present_flag)?;

        if high_profile {
            self.u(1, self.nalu.transform_8x8_mode_flag)?;
            self.u(1, /* pic_scaling_matrix_present_flag */ false)?;
            self.se(self.nalu.second_chroma_qp_index_offset)?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, AccessUnitDelimiter, W> {
    pub fn synthesize(aud: &'n AccessUnitDelimiter, writer: W) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: aud,
        };

        s.writer.write_header(NaluHeader::new(NaluType::AuDelimiter))?;
        s.u(3, s.nalu.primary_pic_type)?;
        s.finish()
    }
}

impl<'n, W: Write> Synthesizer<'n, FillerData, W> {
    pub fn synthesize(filler: &'n FillerData, writer: W) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: filler,
        };

        s.writer.write_header(NaluHeader::new(NaluType::FillerData))?;
        for _ in 0..s.nalu.ff_byte_count {
            s.u(8, 0xffu32)?;
        }
        s.finish()
    }
}

/// Writes a SEI payload into a scratch buffer, returning it with its size in
/// bits before the alignment padding.
fn sei_payload(
    lengths: &HrdLengths,
    build: impl FnOnce(&mut NaluWriter<&mut Vec<u8>>, &HrdLengths) -> SynthesizerResult<()>,
) -> SynthesizerResult<Vec<u8>> {
    let mut payload = Vec::new();
    {
        let mut writer = NaluWriter::new(&mut payload, false);
        build(&mut writer, lengths)?;

        // H.264 D.1.1: bit_equal_to_one followed by bit_equal_to_zero until aligned.
        if !writer.aligned() {
            writer.write_f(1, true)?;
            while !writer.aligned() {
                writer.write_f(1, false)?;
            }
        }
        writer.flush()?;
    }

    Ok(payload)
}

fn buffering_period_payload(
    bp: &BufferingPeriod,
    lengths: &HrdLengths,
) -> SynthesizerResult<Vec<u8>> {
    sei_payload(lengths, |w, l| {
        let len = l.initial_cpb_removal_delay_length as usize;

        w.write_ue(bp.seq_parameter_set_id)?;
        // NAL HRD
        w.write_u(len, bp.nal_initial_cpb_removal_delay)?;
        w.write_u(len, bp.nal_initial_cpb_removal_delay_offset)?;
        // VCL HRD
        w.write_u(len, bp.vcl_initial_cpb_removal_delay)?;
        w.write_u(len, bp.vcl_initial_cpb_removal_delay_offset)?;
        Ok(())
    })
}

fn pic_timing_payload(
    pt: &PicTiming,
    lengths: &HrdLengths,
    pic_struct_present: bool,
) -> SynthesizerResult<Vec<u8>> {
    sei_payload(lengths, |w, l| {
        w.write_u(l.cpb_removal_delay_length as usize, pt.cpb_removal_delay)?;
        w.write_u(l.dpb_output_delay_length as usize, pt.dpb_output_delay)?;

        if !pic_struct_present {
            return Ok(());
        }

        w.write_u(4, pt.pic_struct)?;
        let num_clock_ts = PIC_STRUCT_NUM_CLOCK_TS
            .get(pt.pic_struct as usize)
            .copied()
            .ok_or(SynthesizerError::Unsupported)?;

        for ts in pt.clock_timestamps.iter().take(num_clock_ts) {
            w.write_u(1, ts.clock_timestamp_flag)?;
            if !ts.clock_timestamp_flag {
                continue;
            }

            w.write_u(2, ts.ct_type)?;
            w.write_u(1, ts.nuit_field_based_flag)?;
            w.write_u(5, ts.counting_type)?;
            w.write_u(1, ts.full_timestamp_flag)?;
            w.write_u(1, ts.discontinuity_flag)?;
            w.write_u(1, ts.cnt_dropped_flag)?;
            w.write_u(8, ts.n_frames)?;

            if ts.full_timestamp_flag {
                w.write_u(6, ts.seconds_value)?;
                w.write_u(6, ts.minutes_value)?;
                w.write_u(5, ts.hours_value)?;
            } else if ts.seconds_flag {
                w.write_u(6, ts.seconds_value)?;
                w.write_u(1, ts.minutes_flag)?;
                if ts.minutes_flag {
                    w.write_u(6, ts.minutes_value)?;
                    w.write_u(1, ts.hours_flag)?;
                    if ts.hours_flag {
                        w.write_u(5, ts.hours_value)?;
                    }
                }
            }

            if l.time_offset_length > 0 {
                w.write_u(l.time_offset_length as usize, ts.time_offset)?;
            }
        }

        Ok(())
    })
}

impl<'n, W: Write> Synthesizer<'n, Sei, W> {
    pub fn synthesize(sei: &'n Sei, writer: W) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: sei,
        };

        s.writer.write_header(NaluHeader::new(NaluType::Sei))?;

        if let Some(bp) = &s.nalu.buffering_period {
            let payload = buffering_period_payload(bp, &s.nalu.lengths)?;
            s.sei_message(SEI_BUFFERING_PERIOD, &payload)?;
        }

        if let Some(pt) = &s.nalu.pic_timing {
            let payload = pic_timing_payload(pt, &s.nalu.lengths, s.nalu.pic_struct_present_flag)?;
            s.sei_message(SEI_PICTURE_TIMING, &payload)?;
        }

        s.finish()
    }

    fn sei_message(&mut self, payload_type: u8, payload: &[u8]) -> SynthesizerResult<()> {
        // Payloads are bounded by the HRD field lengths, far below 255 bytes.
        if payload.len() > 255 {
            return Err(SynthesizerError::SeiPayloadTooLarge(payload.len()));
        }

        self.u(8, payload_type)?;
        self.u(8, payload.len() as u32)?;
        for byte in payload {
            self.u(8, *byte)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::BitReader;
    use crate::codec::h264::syntax::Profile;
    use crate::codec::h264::syntax::VuiParams;

    fn lengths() -> HrdLengths {
        HrdLengths {
            initial_cpb_removal_delay_length: 18,
            cpb_removal_delay_length: 18,
            dpb_output_delay_length: 6,
            time_offset_length: 0,
        }
    }

    #[test]
    fn aud() {
        let mut buf = Vec::new();
        let len = Synthesizer::<AccessUnitDelimiter, _>::synthesize(
            &AccessUnitDelimiter {
                primary_pic_type: 1,
            },
            &mut buf,
        )
        .unwrap();

        assert_eq!(len, 6);
        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x01, 0x09, 0x30]);
    }

    #[test]
    fn filler() {
        let mut buf = Vec::new();
        let len =
            Synthesizer::<FillerData, _>::synthesize(&FillerData { ff_byte_count: 3 }, &mut buf)
                .unwrap();

        assert_eq!(len, 9);
        assert_eq!(
            buf,
            vec![0x00, 0x00, 0x00, 0x01, 0x0c, 0xff, 0xff, 0xff, 0x80]
        );
    }

    #[test]
    fn sps_decodes_back() {
        let sps = Sps {
            profile_idc: Profile::Main as u8,
            level_idc: 30,
            log2_max_frame_num_minus4: 4,
            pic_order_cnt_type: 2,
            max_num_ref_frames: 1,
            pic_width_in_mbs_minus1: 44,
            pic_height_in_map_units_minus1: 35,
            frame_mbs_only_flag: true,
            direct_8x8_inference_flag: true,
            vui_parameters_present_flag: true,
            vui_parameters: VuiParams {
                timing_info_present_flag: true,
                num_units_in_tick: 1800,
                time_scale: 90000,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut buf = Vec::new();
        let len = Synthesizer::<Sps, _>::synthesize(&sps, &mut buf).unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(&buf[..5], &[0x00, 0x00, 0x00, 0x01, 0x67]);

        let mut r = BitReader::new(&buf[5..], true);
        assert_eq!(r.read_bits::<u8>(8).unwrap(), 77);
        assert_eq!(r.read_bits::<u8>(8).unwrap(), 0);
        assert_eq!(r.read_bits::<u8>(8).unwrap(), 30);
        assert_eq!(r.read_ue::<u32>().unwrap(), 0);
        assert_eq!(r.read_ue::<u32>().unwrap(), 4);
        assert_eq!(r.read_ue::<u32>().unwrap(), 2);
        assert_eq!(r.read_ue::<u32>().unwrap(), 1);
        assert!(!r.read_bit().unwrap());
        assert_eq!(r.read_ue::<u32>().unwrap(), 44);
        assert_eq!(r.read_ue::<u32>().unwrap(), 35);
        assert!(r.read_bit().unwrap());
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert!(r.read_bit().unwrap());
        // aspect, overscan, video signal, chroma loc
        for _ in 0..4 {
            assert!(!r.read_bit().unwrap());
        }
        assert!(r.read_bit().unwrap());
        assert_eq!(r.read_bits::<u32>(16).unwrap(), 0);
        assert_eq!(r.read_bits::<u32>(16).unwrap(), 1800);
        assert_eq!(r.read_bits::<u32>(16).unwrap(), 1);
        assert_eq!(r.read_bits::<u32>(16).unwrap(), 90000 - 65536);
    }

    #[test]
    fn high_profile_pps_has_extension() {
        let pps = Pps {
            pic_parameter_set_id: 1,
            entropy_coding_mode_flag: true,
            chroma_qp_index_offset: 2,
            deblocking_filter_control_present_flag: true,
            transform_8x8_mode_flag: true,
            second_chroma_qp_index_offset: 2,
            ..Default::default()
        };

        let mut base = Vec::new();
        Synthesizer::<Pps, _>::synthesize(&pps, false, &mut base).unwrap();
        let mut high = Vec::new();
        Synthesizer::<Pps, _>::synthesize(&pps, true, &mut high).unwrap();
        assert!(high.len() > base.len());

        let mut r = BitReader::new(&high[5..], true);
        assert_eq!(r.read_ue::<u32>().unwrap(), 1);
        assert_eq!(r.read_ue::<u32>().unwrap(), 0);
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert_eq!(r.read_ue::<u32>().unwrap(), 0);
        assert_eq!(r.read_ue::<u32>().unwrap(), 0);
        assert_eq!(r.read_ue::<u32>().unwrap(), 0);
        assert!(!r.read_bit().unwrap());
        assert_eq!(r.read_bits::<u32>(2).unwrap(), 0);
        assert_eq!(r.read_se::<i32>().unwrap(), 0);
        assert_eq!(r.read_se::<i32>().unwrap(), 0);
        assert_eq!(r.read_se::<i32>().unwrap(), 2);
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert_eq!(r.read_se::<i32>().unwrap(), 2);
    }

    #[test]
    fn sei_messages() {
        let sei = Sei {
            lengths: lengths(),
            pic_struct_present_flag: false,
            buffering_period: Some(BufferingPeriod {
                seq_parameter_set_id: 0,
                nal_initial_cpb_removal_delay: 90000,
                nal_initial_cpb_removal_delay_offset: 0,
                vcl_initial_cpb_removal_delay: 90000,
                vcl_initial_cpb_removal_delay_offset: 0,
            }),
            pic_timing: Some(PicTiming {
                cpb_removal_delay: 2,
                dpb_output_delay: 2,
                ..Default::default()
            }),
        };

        let mut buf = Vec::new();
        let len = Synthesizer::<Sei, _>::synthesize(&sei, &mut buf).unwrap();
        assert_eq!(len, buf.len());

        let mut r = BitReader::new(&buf[5..], true);
        assert_eq!(r.read_bits::<u8>(8).unwrap(), SEI_BUFFERING_PERIOD);
        // 1 + 4 * 18 bits, aligned up.
        assert_eq!(r.read_bits::<u8>(8).unwrap(), 10);
        assert!(r.read_bit().unwrap());
        assert_eq!(r.read_bits::<u32>(18).unwrap(), 90000);
        assert_eq!(r.read_bits::<u32>(18).unwrap(), 0);
        assert_eq!(r.read_bits::<u32>(18).unwrap(), 90000);
        assert_eq!(r.read_bits::<u32>(18).unwrap(), 0);
        assert!(r.read_bit().unwrap());
        assert_eq!(r.read_bits::<u32>(6).unwrap(), 0);

        assert_eq!(r.read_bits::<u8>(8).unwrap(), SEI_PICTURE_TIMING);
        // 18 + 6 bits.
        assert_eq!(r.read_bits::<u8>(8).unwrap(), 3);
        assert_eq!(r.read_bits::<u32>(18).unwrap(), 2);
        assert_eq!(r.read_bits::<u32>(6).unwrap(), 2);
        assert_eq!(r.read_bits::<u8>(8).unwrap(), 0x80);
    }
}
