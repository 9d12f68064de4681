// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Flexible slice header: the host writes everything but `first_mb_in_slice`
//! and `slice_qp_delta`, which the accelerator inserts at the recorded bit
//! offsets while encoding.

use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu::NALU_PREFIX_BITS;
use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::nalu_writer::NaluWriterResult;
use crate::codec::h264::syntax::EntropyCodingMode;

/// Size of the hardware slice header buffer.
pub const SLICE_HEADER_BUFFER_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceType {
    P,
    I,
}

impl SliceType {
    /// `slice_type` values 5 and 7 state that every slice of the picture has
    /// the same type.
    fn all_slices_value(self) -> u32 {
        match self {
            SliceType::P => 5,
            SliceType::I => 7,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeaderParams {
    pub slice_type: SliceType,
    pub idr: bool,
    pub idr_pic_id: u16,
    pub frame_num: u32,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub pic_order_cnt_lsb: u8,
    pub entropy_coding_mode: EntropyCodingMode,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
}

/// Slice header bytes as handed to the accelerator together with the sizes
/// it needs to splice in its own fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeaderTemplate {
    pub bytes: [u8; SLICE_HEADER_BUFFER_SIZE],
    /// Bits of meaningful header data, start code included, padding excluded.
    pub header_bitsize: u32,
    /// Insertion point of `first_mb_in_slice`.
    pub offset0: u32,
    /// Position of `slice_qp_delta`, counted from `offset0`.
    pub offset1: u32,
    pub offset2: u32,
}

impl SliceHeaderTemplate {
    pub fn build(params: &SliceHeaderParams) -> NaluWriterResult<Self> {
        let mut buf = Vec::with_capacity(SLICE_HEADER_BUFFER_SIZE);

        let (fields_bits, qp_delta_bits) = {
            let mut w = NaluWriter::new(&mut buf, false);

            let type_ = if params.idr {
                NaluType::SliceIdr
            } else {
                NaluType::Slice
            };
            w.write_header(NaluHeader::new(type_))?;

            w.write_ue(params.slice_type.all_slices_value())?;
            w.write_ue(params.entropy_coding_mode as u32)?;
            w.write_u(
                usize::from(params.log2_max_frame_num_minus4) + 4,
                params.frame_num,
            )?;

            if params.idr {
                w.write_ue(params.idr_pic_id)?;
            }

            if params.pic_order_cnt_type == 0 {
                // log2_max_pic_order_cnt_lsb_minus4 is always 0.
                w.write_u(4, params.pic_order_cnt_lsb & 0xf)?;
            }

            if params.slice_type == SliceType::P {
                // num_ref_idx_active_override_flag, one reference.
                w.write_u(1, false)?;
                // ref_pic_list_modification_flag_l0
                w.write_u(1, false)?;
            }

            // dec_ref_pic_marking()
            if params.idr {
                // no_output_of_prior_pics_flag, long_term_reference_flag
                w.write_u(1, false)?;
                w.write_u(1, false)?;
            } else {
                // adaptive_ref_pic_marking_mode_flag
                w.write_u(1, false)?;
            }

            if params.slice_type != SliceType::I
                && params.entropy_coding_mode == EntropyCodingMode::Cabac
            {
                // cabac_init_idc
                w.write_ue(0u32)?;
            }

            let qp_delta_bits = w.rbsp_bits() as u32;

            w.write_ue(params.disable_deblocking_filter_idc)?;
            if params.disable_deblocking_filter_idc != 1 {
                w.write_se(params.slice_alpha_c0_offset_div2)?;
                w.write_se(params.slice_beta_offset_div2)?;
            }

            let fields_bits = w.rbsp_bits() as u32;
            w.flush()?;

            (fields_bits, qp_delta_bits)
        };

        let mut bytes = [0u8; SLICE_HEADER_BUFFER_SIZE];
        let len = buf.len().min(SLICE_HEADER_BUFFER_SIZE);
        bytes[..len].copy_from_slice(&buf[..len]);

        let template = Self {
            bytes,
            header_bitsize: NALU_PREFIX_BITS + fields_bits,
            offset0: NALU_PREFIX_BITS,
            offset1: qp_delta_bits,
            offset2: 0,
        };

        log::trace!(
            "slice header: {} bits, offset0 {}, offset1 {}",
            template.header_bitsize,
            template.offset0,
            template.offset1
        );

        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::BitReader;

    fn idr_params() -> SliceHeaderParams {
        SliceHeaderParams {
            slice_type: SliceType::I,
            idr: true,
            idr_pic_id: 1,
            frame_num: 0,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 2,
            pic_order_cnt_lsb: 0,
            entropy_coding_mode: EntropyCodingMode::Cabac,
            disable_deblocking_filter_idc: 0,
            slice_alpha_c0_offset_div2: 0,
            slice_beta_offset_div2: 0,
        }
    }

    #[test]
    fn idr_slice_header() {
        let template = SliceHeaderTemplate::build(&idr_params()).unwrap();

        assert_eq!(template.offset0, 40);
        assert_eq!(&template.bytes[..5], &[0x00, 0x00, 0x00, 0x01, 0x65]);

        // ue(7) = 7 bits, ue(1) = 3 bits, u(4) frame_num, ue(1) idr_pic_id = 3
        // bits, two marking bits.
        assert_eq!(template.offset1, 7 + 3 + 4 + 3 + 2);
        // ue(0) deblocking idc, se(0) alpha, se(0) beta.
        assert_eq!(template.header_bitsize, 40 + template.offset1 + 3);
        // Zero padded past the last header byte.
        assert!(template.bytes[8..].iter().all(|&b| b == 0));

        let mut r = BitReader::new(&template.bytes[5..], false);
        assert_eq!(r.read_ue::<u32>().unwrap(), 7);
        assert_eq!(r.read_ue::<u32>().unwrap(), 1);
        assert_eq!(r.read_bits::<u32>(4).unwrap(), 0);
        assert_eq!(r.read_ue::<u32>().unwrap(), 1);
        assert_eq!(r.read_bits::<u32>(2).unwrap(), 0);
        assert_eq!(r.read_ue::<u32>().unwrap(), 0);
        assert_eq!(r.read_se::<i32>().unwrap(), 0);
        assert_eq!(r.read_se::<i32>().unwrap(), 0);
    }

    #[test]
    fn p_slice_header_with_cabac() {
        let params = SliceHeaderParams {
            slice_type: SliceType::P,
            idr: false,
            frame_num: 3,
            disable_deblocking_filter_idc: 1,
            ..idr_params()
        };
        let template = SliceHeaderTemplate::build(&params).unwrap();

        assert_eq!(template.bytes[4], 0x41);
        // ue(5) = 5 bits, ue(1) = 3, u(4), override, list modification,
        // marking, cabac_init_idc.
        assert_eq!(template.offset1, 5 + 3 + 4 + 1 + 1 + 1 + 1);
        // ue(1) deblocking idc only.
        assert_eq!(template.header_bitsize, 40 + template.offset1 + 3);

        let mut r = BitReader::new(&template.bytes[5..], false);
        assert_eq!(r.read_ue::<u32>().unwrap(), 5);
        assert_eq!(r.read_ue::<u32>().unwrap(), 1);
        assert_eq!(r.read_bits::<u32>(4).unwrap(), 3);
    }

    #[test]
    fn cavlc_header_has_no_cabac_init() {
        let params = SliceHeaderParams {
            slice_type: SliceType::P,
            idr: false,
            frame_num: 1,
            entropy_coding_mode: EntropyCodingMode::Cavlc,
            ..idr_params()
        };
        let template = SliceHeaderTemplate::build(&params).unwrap();

        // ue(5), ue(0), u(4), three flag bits.
        assert_eq!(template.offset1, 5 + 1 + 4 + 3);
    }
}
