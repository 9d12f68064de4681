// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host control and bitstream core of the HVA H.264 hardware encoder.
//!
//! The accelerator turns source pictures into slice data. This crate does the
//! rest: it translates host parameters into the accelerator task descriptor,
//! sequences commands through the accelerator FIFOs, models the coded picture
//! buffer, and writes the non-VCL NAL units that make the output a valid
//! Annex B byte stream.
//!
//! [`encoder::hva::Accelerator`] is the entry point. The hardware itself is
//! reached through the [`device::HvaDevice`] trait, implemented for tests by
//! [`backend::dummy::DummyDevice`].

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod device;
pub mod encoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Size of the picture in 16x16 macroblocks, rounding up.
    pub fn macroblocks(&self) -> (u32, u32) {
        (self.width.div_ceil(16), self.height.div_ceil(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macroblocks_round_up() {
        let hd = Resolution {
            width: 1920,
            height: 1080,
        };
        assert_eq!(hd.macroblocks(), (120, 68));
        assert_eq!(Resolution::default().macroblocks(), (0, 0));
    }
}
