// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Renders host parameters into the task descriptor of one instance.

use crate::codec::h264::slice_header::SliceHeaderTemplate;
use crate::codec::h264::syntax::EntropyCodingMode;
use crate::encoder::hva::brc::deconstruct_value;
use crate::encoder::hva::brc::reconstruct_value;
use crate::encoder::hva::brc::BITRATE_SCALE_OFFSET;
use crate::encoder::hva::brc::CPB_SIZE_SCALE_OFFSET;
use crate::encoder::hva::descriptor::Field;
use crate::encoder::hva::descriptor::TaskDescriptor;
use crate::encoder::hva::lifecycle::InstanceAddresses;
use crate::encoder::hva::lifecycle::ScratchAddresses;
use crate::encoder::hva::params::FrameParams;
use crate::encoder::hva::params::IntraRefreshType;
use crate::encoder::hva::params::ParamError;
use crate::encoder::hva::params::ParamResult;
use crate::encoder::hva::params::PictureCodingType;
use crate::encoder::hva::params::SequenceParams;
use crate::Resolution;

/// Bit width bounding `bitrate * framerate_den`.
pub const OVERFLOW_LIMIT_DEN: u32 = 32;
/// Bit width bounding `bitstream_size * framerate_num`.
pub const OVERFLOW_LIMIT_NUM: u32 = 32;

/// Number of completed pictures whose size is remembered.
pub const PAST_BITSTREAM_SIZES: usize = 4;

/// Identifiers of the picture being prepared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PictureIds {
    pub frame_num: u32,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u8,
}

/// Where the host placed its NAL units in the output buffer, and how the
/// slice header was built.
#[derive(Clone, Copy, Debug)]
pub struct FrameLayout<'a> {
    /// End of the AUD, SPS and PPS, in bits from `addr_output_bitstream_start`.
    pub headers_end_bits: u32,
    /// Estimated size of the SEI NAL unit, in bits.
    pub sei_estimate_bits: u32,
    /// Space left for the SEI NAL unit ahead of the VCL data, in bits.
    pub sei_reserved_bits: u32,
    pub slice_header: &'a SliceHeaderTemplate,
    pub entropy_coding_mode: EntropyCodingMode,
    pub chroma_qp_index_offset: i8,
}

/// Per instance parameter state.
pub struct ParameterTranslator {
    max_resolution: Resolution,
    descriptor: TaskDescriptor,
    addresses: InstanceAddresses,

    /// Parameters in effect, after bitrate, CPB size and framerate
    /// adjustments.
    params: Option<SequenceParams>,
    framerate_num_ref: u16,
    framerate_den_ref: u16,
    bitrate_ref: u32,
    cpb_buffer_size_ref: u32,

    past_bitstream_sizes: [u32; PAST_BITSTREAM_SIZES],
    mv_toggle: bool,
    idr_toggle: bool,
    /// Toggles of the picture being prepared, applied once it is submitted.
    pending_toggles: Option<(bool, bool)>,
    last_idr_pic_id: Option<bool>,
    next_frame_num: u32,
    pending_frame_num: u32,
    nal_templates_stale: bool,
}

impl ParameterTranslator {
    /// Creates the translator of a new instance and loads the addresses that
    /// never change into its descriptor.
    pub fn new(
        max_resolution: Resolution,
        addresses: InstanceAddresses,
        scratch: &ScratchAddresses,
    ) -> Self {
        let mut descriptor = TaskDescriptor::default();
        descriptor.set(Field::AddrExternalSw, scratch.search_window);
        descriptor.set(Field::AddrLocalRecBuffer, scratch.local_rec);
        descriptor.set(Field::AddrLctx, scratch.context_mb);
        descriptor.set(Field::AddrCabacContextBuffer, scratch.cabac_context);

        Self {
            max_resolution,
            descriptor,
            addresses,
            params: None,
            framerate_num_ref: 0,
            framerate_den_ref: 0,
            bitrate_ref: 0,
            cpb_buffer_size_ref: 0,
            past_bitstream_sizes: [0; PAST_BITSTREAM_SIZES],
            mv_toggle: true,
            idr_toggle: true,
            pending_toggles: None,
            last_idr_pic_id: None,
            next_frame_num: 0,
            pending_frame_num: 0,
            nal_templates_stale: true,
        }
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    pub fn addresses(&self) -> &InstanceAddresses {
        &self.addresses
    }

    /// Sequence parameters in effect.
    pub fn sequence(&self) -> Option<&SequenceParams> {
        self.params.as_ref()
    }

    pub fn past_bitstream_sizes(&self) -> &[u32; PAST_BITSTREAM_SIZES] {
        &self.past_bitstream_sizes
    }

    /// Returns whether the NAL templates must be rebuilt, clearing the flag.
    pub fn take_stale(&mut self) -> bool {
        std::mem::replace(&mut self.nal_templates_stale, false)
    }

    /// Validates and stores new sequence parameters. The next picture starts a
    /// new group of pictures.
    pub fn apply_sequence_params(&mut self, params: &SequenceParams) -> ParamResult<()> {
        params.validate(self.max_resolution)?;

        self.framerate_num_ref = params.framerate_num;
        self.framerate_den_ref = params.framerate_den;
        self.bitrate_ref = params.bitrate;
        self.cpb_buffer_size_ref = params.cpb_buffer_size;

        let mut effective = params.clone();
        if params.vui_parameters_present {
            self.check_bitrate_and_cpb(&mut effective);
        }

        log::debug!(
            "sequence {}x{} {:?} {:?}, {:?} {} bps, cpb {} bits, {}/{} fps",
            effective.frame_width,
            effective.frame_height,
            effective.profile,
            effective.level,
            effective.brc_type,
            effective.bitrate,
            effective.cpb_buffer_size,
            effective.framerate_num,
            effective.framerate_den
        );

        self.params = Some(effective);
        self.mv_toggle = true;
        self.idr_toggle = true;
        self.pending_toggles = None;
        self.last_idr_pic_id = None;
        self.next_frame_num = 0;
        self.nal_templates_stale = true;

        self.load_stream_context()
    }

    /// Replaces bitrate and CPB size with the values the HRD syntax can
    /// express, so the rate control and the signalled HRD agree.
    fn check_bitrate_and_cpb(&self, params: &mut SequenceParams) {
        let bitrate = deconstruct_value(self.bitrate_ref, BITRATE_SCALE_OFFSET);
        let bitrate = reconstruct_value(bitrate.value, bitrate.scale, BITRATE_SCALE_OFFSET);
        if bitrate != self.bitrate_ref {
            log::debug!(
                "bitrate {} bps reconstructed as {} bps",
                self.bitrate_ref,
                bitrate
            );
            params.bitrate = bitrate;
        }

        let cpb = deconstruct_value(self.cpb_buffer_size_ref, CPB_SIZE_SCALE_OFFSET);
        let cpb = reconstruct_value(cpb.value, cpb.scale, CPB_SIZE_SCALE_OFFSET);
        if cpb != self.cpb_buffer_size_ref {
            log::debug!(
                "CPB size {} bits reconstructed as {} bits",
                self.cpb_buffer_size_ref,
                cpb
            );
            params.cpb_buffer_size = cpb;
        }
    }

    /// Writes the sequence fields of the descriptor from the parameters in
    /// effect and the current buffer roles.
    pub fn load_stream_context(&mut self) -> ParamResult<()> {
        self.check_framerate()?;

        let params = self.params.as_ref().ok_or(ParamError::NoSequence)?;
        let d = &mut self.descriptor;

        let width = u32::from(params.frame_width).next_multiple_of(16);
        let height = u32::from(params.frame_height).next_multiple_of(16);
        d.set(Field::FrameWidth, width);
        d.set(Field::FrameHeight, height);
        d.set(Field::WindowWidth, width);
        d.set(Field::WindowHeight, height);
        d.set(Field::WindowHorizontalOffset, 0);
        d.set(Field::WindowVerticalOffset, 0);

        d.set(Field::PicOrderCntType, params.pic_order_cnt_type.into());
        d.set_flag(Field::UseConstrainedIntraFlag, params.use_constrained_intra);
        // Single slice pictures only.
        d.set(Field::SliceSizeType, 0);
        d.set(Field::SliceByteSize, 0);
        d.set(Field::SliceMbSize, 0);
        d.set(Field::MaxSliceNumber, 1);
        d.set_flag(Field::SliceSynchroEnable, false);

        d.set(Field::IntraRefreshType, params.intra_refresh_type as u32);
        d.set(Field::IrParamOption, params.intra_refresh_param.into());
        // Adaptive refresh counts macroblocks per frame, cyclic refresh counts
        // frames.
        let max_air_mbs = match params.intra_refresh_type {
            IntraRefreshType::Adaptive => params.intra_refresh_param,
            IntraRefreshType::Disabled | IntraRefreshType::Cyclic => 0,
        };
        d.set(Field::MaxAirIntraMbNb, max_air_mbs.into());
        d.set(Field::BrcType, params.brc_type as u32);
        d.set(Field::CpbBufferSize, params.cpb_buffer_size);
        d.set(Field::BitRate, params.bitrate);
        d.set(Field::SamplingMode, params.sampling_mode as u32);
        d.set(Field::TransformMode, params.transform_mode as u32);
        d.set(Field::EncoderComplexity, params.encoder_complexity.into());
        d.set(Field::Quant, params.quant.into());
        d.set(Field::FramerateNum, params.framerate_num.into());
        d.set(Field::FramerateDen, params.framerate_den.into());
        d.set(Field::Delay, params.delay.into());
        d.set_flag(Field::StrictHrdCompliancy, params.strict_hrd_compliancy);
        d.set(Field::QpMin, params.qp_min.into());
        d.set(Field::QpMax, params.qp_max.into());
        d.set_flag(Field::BrcNoSkip, false);

        let a = &self.addresses;
        d.set(Field::AddrFwdRefBuffer, a.reference);
        d.set(Field::AddrRecBuffer, a.reconstructed);
        d.set(Field::AddrParamInout, a.param_out);
        d.set(Field::AddrBrcInOutParameter, a.brc);
        d.set(Field::AddrSliceHeader, a.slice_header);

        if self.mv_toggle {
            d.set(Field::AddrSpatialContext, a.temporal_context);
            d.set(Field::AddrTemporalContext, a.spatial_context);
        } else {
            d.set(Field::AddrSpatialContext, a.spatial_context);
            d.set(Field::AddrTemporalContext, a.temporal_context);
        }

        Ok(())
    }

    /// Rescales the framerate in effect so that `bitrate * den` and
    /// `max_picture_bytes * num` fit their hardware registers. The ratio of
    /// the reference framerate is kept, rounding to nearest.
    pub fn check_framerate(&mut self) -> ParamResult<()> {
        let num_ref = u64::from(self.framerate_num_ref);
        let den_ref = u64::from(self.framerate_den_ref);
        let max_bitstream_size = self.past_bitstream_sizes.iter().copied().max().unwrap_or(0);
        let params = self.params.as_mut().ok_or(ParamError::NoSequence)?;

        let mut num = u64::from(params.framerate_num);
        let mut den = u64::from(params.framerate_den);
        let bitrate = u64::from(params.bitrate);

        let max_bitrate_den = (1u64 << OVERFLOW_LIMIT_DEN) - 1;
        if bitrate * den >= max_bitrate_den {
            log::debug!(
                "bitrate {} * framerate den {} overflows {} bits",
                bitrate,
                den,
                OVERFLOW_LIMIT_DEN
            );
            den = (max_bitrate_den / bitrate.max(1)).max(1);
            num = (num_ref * den + den_ref / 2) / den_ref.max(1);
        }

        let max_bitrate_num = (1u64 << OVERFLOW_LIMIT_NUM) - 1;
        if u64::from(max_bitstream_size) * num >= max_bitrate_num {
            let size_bits = u32::BITS - max_bitstream_size.leading_zeros();
            let max_framerate_num = (1u64 << OVERFLOW_LIMIT_NUM.saturating_sub(size_bits)) - 1;
            log::debug!(
                "picture size {} * framerate num {} overflows {} bits, num limited to {}",
                max_bitstream_size,
                num,
                OVERFLOW_LIMIT_NUM,
                max_framerate_num
            );

            den = ((den_ref * max_framerate_num) / num_ref.max(1)).max(1);
            num = (num_ref * den + den_ref / 2) / den_ref.max(1);
        }

        let num = u16::try_from(num).unwrap_or(u16::MAX);
        let den = u16::try_from(den).unwrap_or(u16::MAX);
        if (num, den) != (params.framerate_num, params.framerate_den) {
            log::debug!(
                "framerate {}/{} renormalized to {}/{}",
                params.framerate_num,
                params.framerate_den,
                num,
                den
            );
            params.framerate_num = num;
            params.framerate_den = den;
        }

        self.descriptor.set(Field::FramerateNum, num.into());
        self.descriptor.set(Field::FramerateDen, den.into());

        Ok(())
    }

    /// Starts a new picture: reloads the stream context and picks the
    /// picture identifiers. The context toggles only advance on
    /// [`Self::commit_picture`], so a picture that is never submitted leaves
    /// no trace.
    pub fn next_picture(&mut self, frame: &FrameParams) -> ParamResult<PictureIds> {
        frame.validate()?;
        self.load_stream_context()?;

        let params = self.params.as_ref().ok_or(ParamError::NoSequence)?;

        let mut idr_toggle = !self.idr_toggle;
        if frame.picture_coding_type == PictureCodingType::I
            && frame.idr
            && self.last_idr_pic_id == Some(idr_toggle)
        {
            idr_toggle = !idr_toggle;
        }
        self.pending_toggles = Some((!self.mv_toggle, idr_toggle));

        let frame_num = if frame.idr { 0 } else { self.next_frame_num };
        let max_frame_num = 1u32 << (params.log2_max_frame_num_minus4 + 4);
        let frame_num = frame_num & (max_frame_num - 1);
        self.pending_frame_num = frame_num;

        Ok(PictureIds {
            frame_num,
            idr_pic_id: u16::from(idr_toggle),
            // log2_max_pic_order_cnt_lsb is 4, two counts per frame.
            pic_order_cnt_lsb: ((frame_num * 2) & 0xf) as u8,
        })
    }

    /// Fills the frame fields of the descriptor.
    pub fn build_frame_descriptor(
        &mut self,
        frame: &FrameParams,
        layout: &FrameLayout,
    ) -> &TaskDescriptor {
        let d = &mut self.descriptor;

        d.set(Field::PictureCodingType, frame.picture_coding_type as u32);
        d.set_flag(Field::FirstPictureInSequence, frame.first_picture_in_sequence);
        d.set(
            Field::DisableDeblockingFilterIdc,
            frame.disable_deblocking_filter_idc.into(),
        );
        d.set_signed(
            Field::SliceAlphaC0OffsetDiv2,
            frame.slice_alpha_c0_offset_div2.into(),
        );
        d.set_signed(
            Field::SliceBetaOffsetDiv2,
            frame.slice_beta_offset_div2.into(),
        );

        d.set(
            Field::NonVclNaluSize,
            layout.headers_end_bits - frame.bitstream_offset + layout.sei_estimate_bits,
        );

        // The accelerator starts writing on a 16 byte boundary, the remainder
        // goes to the bit offset.
        let vcl_start = frame
            .addr_output_bitstream_start
            .wrapping_add((layout.headers_end_bits + layout.sei_reserved_bits) >> 3);
        d.set(Field::AddrSourceBuffer, frame.addr_source_buffer);
        d.set(Field::AddrOutputBitstreamStart, vcl_start & !0xf);
        d.set(Field::AddrOutputBitstreamEnd, frame.addr_output_bitstream_end);
        d.set(Field::BitstreamOffset, (vcl_start & 0xf) << 3);

        d.set(Field::SliceHeaderSizeInBits, layout.slice_header.header_bitsize);
        d.set(Field::SliceHeaderOffset0, layout.slice_header.offset0);
        d.set(Field::SliceHeaderOffset1, layout.slice_header.offset1);
        d.set(Field::SliceHeaderOffset2, layout.slice_header.offset2);
        d.set(Field::EntropyCodingMode, layout.entropy_coding_mode as u32);
        d.set_signed(
            Field::ChromaQpIndexOffset,
            layout.chroma_qp_index_offset.into(),
        );
        d.set_signed(Field::GmvX, 0);
        d.set_signed(Field::GmvY, 0);

        log::trace!(
            "frame {:?}: non-VCL {} bits, VCL at {:#x} + {} bits",
            frame.picture_coding_type,
            d.get(Field::NonVclNaluSize),
            d.get(Field::AddrOutputBitstreamStart),
            d.get(Field::BitstreamOffset)
        );

        &self.descriptor
    }

    /// Marks the picture from the last [`Self::next_picture`] as submitted.
    pub fn commit_picture(&mut self) {
        if let Some((mv_toggle, idr_toggle)) = self.pending_toggles.take() {
            self.mv_toggle = mv_toggle;
            self.idr_toggle = idr_toggle;
        }
    }

    /// Updates the picture state once the accelerator is done. `encoded` is
    /// false for skipped or failed pictures.
    pub fn complete_picture(
        &mut self,
        picture_coding_type: PictureCodingType,
        encoded: bool,
        bitstream_size: u32,
    ) {
        if encoded {
            self.last_idr_pic_id = match picture_coding_type {
                PictureCodingType::I => Some(self.idr_toggle),
                PictureCodingType::P => None,
            };

            // The reconstructed picture is the next reference.
            std::mem::swap(
                &mut self.addresses.reference,
                &mut self.addresses.reconstructed,
            );
            self.descriptor
                .set(Field::AddrFwdRefBuffer, self.addresses.reference);
            self.descriptor
                .set(Field::AddrRecBuffer, self.addresses.reconstructed);

            if let Some(params) = &self.params {
                let max_frame_num = 1u32 << (params.log2_max_frame_num_minus4 + 4);
                self.next_frame_num = (self.pending_frame_num + 1) & (max_frame_num - 1);
            }
        }

        self.past_bitstream_sizes.rotate_right(1);
        self.past_bitstream_sizes[0] = bitstream_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::slice_header::SliceHeaderParams;
    use crate::codec::h264::slice_header::SliceType;
    use crate::encoder::hva::params::BrcType;
    use crate::encoder::hva::params::MemoryProfile;

    fn addresses() -> InstanceAddresses {
        InstanceAddresses {
            reference: 0x10_0000,
            reconstructed: 0x20_0000,
            spatial_context: 0x30_0000,
            temporal_context: 0x31_0000,
            brc: 0x32_0000,
            param_out: 0x33_0000,
            task_descriptor: 0x34_0000,
            slice_header: 0x35_0000,
        }
    }

    fn scratch() -> ScratchAddresses {
        ScratchAddresses {
            search_window: 0x100,
            local_rec: 0x200,
            context_mb: 0x300,
            cabac_context: 0x400,
        }
    }

    fn translator() -> ParameterTranslator {
        ParameterTranslator::new(
            MemoryProfile::Sd.max_resolution(),
            addresses(),
            &scratch(),
        )
    }

    fn sd_params() -> SequenceParams {
        SequenceParams {
            frame_width: 720,
            frame_height: 576,
            bitrate: 2_000_000,
            cpb_buffer_size: 4_000_000,
            framerate_num: 25,
            framerate_den: 1,
            brc_type: BrcType::Vbr,
            ..Default::default()
        }
    }

    fn idr_frame() -> FrameParams {
        FrameParams {
            picture_coding_type: PictureCodingType::I,
            idr: true,
            first_picture_in_sequence: true,
            addr_source_buffer: 0x40_0000,
            addr_output_bitstream_start: 0x50_0000,
            addr_output_bitstream_end: 0x58_0000,
            ..Default::default()
        }
    }

    fn template(ids: &PictureIds) -> SliceHeaderTemplate {
        SliceHeaderTemplate::build(&SliceHeaderParams {
            slice_type: SliceType::I,
            idr: true,
            idr_pic_id: ids.idr_pic_id,
            frame_num: ids.frame_num,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 2,
            pic_order_cnt_lsb: 0,
            entropy_coding_mode: EntropyCodingMode::Cabac,
            disable_deblocking_filter_idc: 0,
            slice_alpha_c0_offset_div2: 0,
            slice_beta_offset_div2: 0,
        })
        .unwrap()
    }

    #[test]
    fn static_addresses_are_loaded_once() {
        let t = translator();
        let d = t.descriptor();
        assert_eq!(d.get(Field::AddrExternalSw), 0x100);
        assert_eq!(d.get(Field::AddrLocalRecBuffer), 0x200);
        assert_eq!(d.get(Field::AddrLctx), 0x300);
        assert_eq!(d.get(Field::AddrCabacContextBuffer), 0x400);
    }

    #[test]
    fn descriptor_matches_masked_parameters() {
        let mut t = translator();
        let params = SequenceParams {
            encoder_complexity: 9,
            intra_refresh_param: 300,
            qp_min: 12,
            qp_max: 40,
            delay: 500,
            ..sd_params()
        };
        t.apply_sequence_params(&params).unwrap();
        assert!(t.take_stale());
        assert!(!t.take_stale());

        let frame = FrameParams {
            disable_deblocking_filter_idc: 2,
            slice_alpha_c0_offset_div2: -3,
            slice_beta_offset_div2: 5,
            ..idr_frame()
        };
        let ids = t.next_picture(&frame).unwrap();
        let header = template(&ids);
        let layout = FrameLayout {
            headers_end_bits: 400,
            sei_estimate_bits: 200,
            sei_reserved_bits: 275,
            slice_header: &header,
            entropy_coding_mode: EntropyCodingMode::Cabac,
            chroma_qp_index_offset: 2,
        };
        let d = t.build_frame_descriptor(&frame, &layout).clone();

        assert_eq!(d.get(Field::FrameWidth), 720);
        assert_eq!(d.get(Field::FrameHeight), 576);
        assert_eq!(d.get(Field::EncoderComplexity), 9 & 0x7);
        assert_eq!(d.get(Field::IrParamOption), 300);
        assert_eq!(d.get(Field::MaxAirIntraMbNb), 0);
        assert_eq!(d.get(Field::QpMin), 12);
        assert_eq!(d.get(Field::QpMax), 40);
        assert_eq!(d.get(Field::Delay), 500);
        assert_eq!(d.get(Field::BitRate), 2_000_000);
        assert_eq!(d.get(Field::CpbBufferSize), 4_000_000);
        assert_eq!(d.get(Field::BrcType), BrcType::Vbr as u32);
        assert_eq!(d.get(Field::FramerateNum), 25);
        assert_eq!(d.get(Field::FramerateDen), 1);
        assert_eq!(d.get(Field::PicOrderCntType), 2);
        assert_eq!(d.get(Field::MaxSliceNumber), 1);

        assert_eq!(d.get(Field::PictureCodingType), 0);
        assert_eq!(d.get(Field::FirstPictureInSequence), 1);
        assert_eq!(d.get(Field::DisableDeblockingFilterIdc), 2);
        assert_eq!(d.get_signed(Field::SliceAlphaC0OffsetDiv2), -3);
        assert_eq!(d.get_signed(Field::SliceBetaOffsetDiv2), 5);
        assert_eq!(d.get_signed(Field::ChromaQpIndexOffset), 2);
        assert_eq!(d.get(Field::EntropyCodingMode), 1);
        assert_eq!(d.get(Field::NonVclNaluSize), 600);
        assert_eq!(d.get(Field::AddrSourceBuffer), 0x40_0000);
        assert_eq!(d.get(Field::AddrOutputBitstreamEnd), 0x58_0000);

        // (400 + 275) / 8 = 84 bytes past the start.
        assert_eq!(d.get(Field::AddrOutputBitstreamStart), 0x50_0000 + 80);
        assert_eq!(d.get(Field::BitstreamOffset), 4 * 8);

        assert_eq!(d.get(Field::SliceHeaderOffset0), 40);
        assert_eq!(d.get(Field::SliceHeaderOffset1), header.offset1);
        assert_eq!(d.get(Field::SliceHeaderSizeInBits), header.header_bitsize);
    }

    #[test]
    fn frame_dimensions_are_rounded_to_macroblocks() {
        let mut t = ParameterTranslator::new(
            MemoryProfile::Hd.max_resolution(),
            addresses(),
            &scratch(),
        );
        let params = SequenceParams {
            frame_width: 1920,
            frame_height: 1080,
            ..Default::default()
        };
        t.apply_sequence_params(&params).unwrap();
        assert_eq!(t.descriptor().get(Field::FrameHeight), 1088);
        assert_eq!(t.descriptor().get(Field::WindowHeight), 1088);
    }

    #[test]
    fn bitrate_is_reconstructed_with_vui() {
        let mut t = translator();
        let params = SequenceParams {
            bitrate: 1_500_001,
            cpb_buffer_size: 3_000_001,
            ..sd_params()
        };
        t.apply_sequence_params(&params).unwrap();
        let effective = t.sequence().unwrap();
        // 23437 << 6
        assert_eq!(effective.bitrate, 1_499_968);
        assert!(effective.cpb_buffer_size <= 3_000_001);

        let params = SequenceParams {
            vui_parameters_present: false,
            ..params
        };
        t.apply_sequence_params(&params).unwrap();
        assert_eq!(t.sequence().unwrap().bitrate, 1_500_001);
    }

    #[test]
    fn framerate_renormalization() {
        let mut t = ParameterTranslator::new(
            MemoryProfile::Hd.max_resolution(),
            addresses(),
            &scratch(),
        );
        let params = SequenceParams {
            bitrate: 100_000_000,
            framerate_num: 30000,
            framerate_den: 1001,
            vui_parameters_present: false,
            ..Default::default()
        };
        t.apply_sequence_params(&params).unwrap();

        let d = t.descriptor();
        assert_eq!(d.get(Field::FramerateDen), 42);
        assert_eq!(d.get(Field::FramerateNum), 1259);
        let ratio = 1259.0 / 42.0;
        assert!((ratio - 30000.0 / 1001.0_f64).abs() < 0.02);
    }

    #[test]
    fn large_pictures_limit_framerate_num() {
        let mut t = translator();
        let params = SequenceParams {
            framerate_num: 60000,
            framerate_den: 1001,
            ..sd_params()
        };
        t.apply_sequence_params(&params).unwrap();

        // 17 bit pictures leave 15 bits for the numerator.
        t.complete_picture(PictureCodingType::I, true, 100_000);
        t.check_framerate().unwrap();

        let num = t.descriptor().get(Field::FramerateNum);
        let den = t.descriptor().get(Field::FramerateDen);
        assert!(100_000 * u64::from(num) < (1 << OVERFLOW_LIMIT_NUM) - 1);
        assert_eq!(den, (1001 * 32767) / 60000);
        assert_eq!(num, (60000 * den + 500) / 1001);
    }

    #[test]
    fn idr_pic_ids_alternate() {
        let mut t = translator();
        t.apply_sequence_params(&sd_params()).unwrap();

        let mut previous = None;
        for _ in 0..4 {
            let ids = t.next_picture(&idr_frame()).unwrap();
            assert_eq!(ids.frame_num, 0);
            assert_ne!(Some(ids.idr_pic_id), previous);
            previous = Some(ids.idr_pic_id);
            t.commit_picture();
            t.complete_picture(PictureCodingType::I, true, 1000);
        }
    }

    #[test]
    fn frame_num_wraps() {
        let mut t = translator();
        t.apply_sequence_params(&sd_params()).unwrap();

        let ids = t.next_picture(&idr_frame()).unwrap();
        assert_eq!(ids.frame_num, 0);
        t.commit_picture();
        t.complete_picture(PictureCodingType::I, true, 1000);

        let p = FrameParams {
            picture_coding_type: PictureCodingType::P,
            idr: false,
            first_picture_in_sequence: false,
            ..idr_frame()
        };
        for expected in (1..16).chain(0..3) {
            let ids = t.next_picture(&p).unwrap();
            assert_eq!(ids.frame_num, expected);
            assert_eq!(ids.pic_order_cnt_lsb, ((expected * 2) & 0xf) as u8);
            t.commit_picture();
            t.complete_picture(PictureCodingType::P, true, 1000);
        }

        // A skipped picture does not consume a frame number.
        let ids = t.next_picture(&p).unwrap();
        t.commit_picture();
        t.complete_picture(PictureCodingType::P, false, 0);
        assert_eq!(t.next_picture(&p).unwrap().frame_num, ids.frame_num);
    }

    #[test]
    fn buffer_roles_swap_after_encoding() {
        let mut t = translator();
        t.apply_sequence_params(&sd_params()).unwrap();

        // The first picture after new parameters uses swapped contexts.
        t.next_picture(&idr_frame()).unwrap();
        assert_eq!(t.descriptor().get(Field::AddrSpatialContext), 0x31_0000);
        assert_eq!(t.descriptor().get(Field::AddrTemporalContext), 0x30_0000);
        t.commit_picture();
        t.complete_picture(PictureCodingType::I, true, 1000);
        assert_eq!(t.descriptor().get(Field::AddrFwdRefBuffer), 0x20_0000);
        assert_eq!(t.descriptor().get(Field::AddrRecBuffer), 0x10_0000);

        t.next_picture(&idr_frame()).unwrap();
        assert_eq!(t.descriptor().get(Field::AddrSpatialContext), 0x30_0000);
        assert_eq!(t.descriptor().get(Field::AddrTemporalContext), 0x31_0000);
        assert_eq!(t.descriptor().get(Field::AddrFwdRefBuffer), 0x20_0000);

        // Failed pictures keep the reference.
        t.commit_picture();
        t.complete_picture(PictureCodingType::I, false, 0);
        assert_eq!(t.descriptor().get(Field::AddrFwdRefBuffer), 0x20_0000);
        assert_eq!(t.past_bitstream_sizes(), &[0, 1000, 0, 0]);
    }

    #[test]
    fn adaptive_refresh_sets_macroblock_budget() {
        let mut t = translator();
        let params = SequenceParams {
            intra_refresh_type: IntraRefreshType::Adaptive,
            intra_refresh_param: 300,
            ..sd_params()
        };
        t.apply_sequence_params(&params).unwrap();
        t.next_picture(&idr_frame()).unwrap();
        assert_eq!(t.descriptor().get(Field::MaxAirIntraMbNb), 300);

        let params = SequenceParams {
            intra_refresh_type: IntraRefreshType::Cyclic,
            ..params
        };
        t.apply_sequence_params(&params).unwrap();
        t.next_picture(&idr_frame()).unwrap();
        assert_eq!(t.descriptor().get(Field::MaxAirIntraMbNb), 0);
    }

    #[test]
    fn unsubmitted_pictures_keep_contexts() {
        let mut t = translator();
        t.apply_sequence_params(&sd_params()).unwrap();

        t.next_picture(&idr_frame()).unwrap();
        t.commit_picture();
        t.complete_picture(PictureCodingType::I, true, 1000);
        let spatial = t.descriptor().get(Field::AddrSpatialContext);

        let p = FrameParams {
            picture_coding_type: PictureCodingType::P,
            idr: false,
            first_picture_in_sequence: false,
            ..idr_frame()
        };
        // Dropped before submission.
        t.next_picture(&p).unwrap();
        t.next_picture(&p).unwrap();
        t.commit_picture();
        assert_eq!(t.descriptor().get(Field::AddrTemporalContext), spatial);

        t.complete_picture(PictureCodingType::P, true, 1000);

        // A retried IDR keeps its identifier until it is submitted.
        let retried = t.next_picture(&idr_frame()).unwrap();
        assert_eq!(t.next_picture(&idr_frame()).unwrap(), retried);
        t.commit_picture();
        assert_ne!(t.next_picture(&idr_frame()).unwrap(), retried);
    }

    #[test]
    fn frames_need_a_sequence() {
        let mut t = translator();
        assert_eq!(t.next_picture(&idr_frame()), Err(ParamError::NoSequence));
    }
}
