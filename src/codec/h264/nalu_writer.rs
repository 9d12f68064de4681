// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.
use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;
use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::START_CODE_LONG;

/// Internal wrapper over [`std::io::Write`] turning RBSP bytes into EBSP.
struct EmulationPrevention<W: Write> {
    out: W,
    /// Number of consecutive zero bytes most recently emitted.
    zero_run: u8,
    /// Bytes emitted downstream, start codes and prevention bytes included.
    emitted: usize,

    /// Emulation prevention enabled.
    ep_enabled: bool,
}

impl<W: Write> EmulationPrevention<W> {
    fn new(writer: W, ep_enabled: bool) -> Self {
        Self {
            out: writer,
            zero_run: 0,
            emitted: 0,
            ep_enabled,
        }
    }

    fn write_byte(&mut self, curr_byte: u8) -> std::io::Result<()> {
        if self.ep_enabled && self.zero_run >= 2 && curr_byte <= 0x03 {
            self.out.write_all(&[0x03])?;
            self.emitted += 1;
            self.zero_run = 0;
        }

        self.out.write_all(&[curr_byte])?;
        self.emitted += 1;

        if curr_byte == 0x00 {
            self.zero_run = self.zero_run.saturating_add(1);
        } else {
            self.zero_run = 0;
        }

        Ok(())
    }

    /// Writes a start code and NAL header, bypassing emulation prevention.
    fn write_header(&mut self, header: NaluHeader) -> NaluWriterResult<()> {
        self.out.write_all(&START_CODE_LONG)?;
        self.out.write_all(&[header.to_byte()])?;
        self.emitted += START_CODE_LONG.len() + 1;
        self.zero_run = 0;

        Ok(())
    }
}

impl<W: Write> Write for EmulationPrevention<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for byte in buf {
            self.write_byte(*byte)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error("value increment caused value overflow")]
    Overflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// A writer for H.264 bitstream. It is capable of outputing bitstream with
/// emulation-prevention.
pub struct NaluWriter<W: Write>(BitWriter<EmulationPrevention<W>>);

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W, ep_enabled: bool) -> Self {
        Self(BitWriter::new(EmulationPrevention::new(writer, ep_enabled)))
    }

    /// Writes fixed bit size integer (up to 32 bit) output with emulation
    /// prevention if enabled. Corresponds to `f(n)` in H.264 spec.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.0
            .write_f(bits, value)
            .map_err(NaluWriterError::BitWriterError)
    }

    /// An alias to [`Self::write_f`] Corresponds to `u(n)` in H.264 spec.
    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.write_f(bits, value)
    }

    /// Writes a number in exponential golumb format.
    pub fn write_exp_golumb(&mut self, value: u32) -> NaluWriterResult<()> {
        let value = value.checked_add(1).ok_or(NaluWriterError::Overflow)?;
        let bits = 32 - value.leading_zeros() as usize;
        let zeros = bits - 1;

        self.write_f(zeros, 0u32)?;
        self.write_f(bits, value)?;

        Ok(())
    }

    /// Writes a unsigned integer in exponential golumb format.
    /// Coresponds to `ue(v)` in H.264 spec.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        self.write_exp_golumb(value.into())
    }

    /// Writes a signed integer in exponential golumb format.
    /// Coresponds to `se(v)` in H.264 spec.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value: i32 = value.into();
        let abs_value: u32 = value.unsigned_abs();

        let code = if value <= 0 {
            abs_value.checked_mul(2)
        } else {
            abs_value.checked_mul(2).map(|v| v - 1)
        };

        self.write_ue(code.ok_or(NaluWriterError::Overflow)?)
    }

    /// Writes the RBSP stop bit and zero bits up to the next byte boundary.
    pub fn rbsp_trailing_bits(&mut self) -> NaluWriterResult<()> {
        self.write_f(1, true)?;
        self.0.pad_to_byte()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.0.has_data_pending()
    }

    /// Writes a long start code and the NAL header.
    pub fn write_header(&mut self, header: NaluHeader) -> NaluWriterResult<()> {
        self.0.flush()?;
        self.0.inner_mut().write_header(header)?;
        Ok(())
    }

    /// Returns `true` if next bits will be aligned to 8
    pub fn aligned(&self) -> bool {
        !self.0.has_data_pending()
    }

    /// Payload bits written so far, excluding start codes, NAL headers and
    /// emulation prevention bytes.
    pub fn rbsp_bits(&self) -> u64 {
        self.0.bits_written()
    }

    /// Flushes pending bits and returns the number of bytes emitted so far.
    pub fn flush(&mut self) -> NaluWriterResult<usize> {
        self.0.flush()?;
        Ok(self.0.inner().emitted)
    }
}
