// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;

/// Four byte Annex-B start code, used in front of every NAL unit the host emits.
pub const START_CODE_LONG: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
/// Three byte Annex-B start code.
pub const START_CODE_SHORT: [u8; 3] = [0x00, 0x00, 0x01];

/// Size in bits of a long start code followed by the one byte NAL header.
pub const NALU_PREFIX_BITS: u32 = (START_CODE_LONG.len() as u32 + 1) * 8;

/// NAL unit types the accelerator host deals with. See table 7-1 in the H.264
/// specification.
#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
}

impl NaluType {
    /// The `nal_ref_idc` the encoder uses for this type of unit.
    pub fn ref_idc(self) -> u8 {
        match self {
            NaluType::Sps | NaluType::Pps | NaluType::SliceIdr => 3,
            NaluType::Slice => 2,
            _ => 0,
        }
    }
}

/// The one byte NAL unit header: forbidden_zero_bit, nal_ref_idc, nal_unit_type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
}

impl NaluHeader {
    pub fn new(type_: NaluType) -> Self {
        Self {
            ref_idc: type_.ref_idc(),
            type_,
        }
    }

    pub fn to_byte(self) -> u8 {
        ((self.ref_idc & 0b11) << 5) | (self.type_ as u8 & 0b11111)
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0x80 != 0 {
            return None;
        }

        Some(Self {
            ref_idc: (byte >> 5) & 0b11,
            type_: NaluType::n(byte & 0b11111)?,
        })
    }
}

/// Returns the offsets of every NAL header byte following a start code in an
/// Annex-B byte stream.
pub fn find_nalu_headers(stream: &[u8]) -> Vec<usize> {
    let mut headers = Vec::new();
    let mut i = 0;

    while i + 3 < stream.len() {
        if stream[i..i + 3] == START_CODE_SHORT {
            headers.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    headers
}
