// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-level sinks and sources for the headers this crate emits.

use std::borrow::Cow;
use std::io::Write;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadBitsError {
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("exp-Golomb code longer than 32 bits")]
    InvalidExpGolomb,
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

pub type ReadBitsResult<T> = Result<T, ReadBitsError>;

/// MSB-first reader over an RBSP.
///
/// With `needs_epb`, emulation prevention bytes are stripped up front so that
/// `position` counts payload bits only.
#[derive(Clone)]
pub struct BitReader<'a> {
    data: Cow<'a, [u8]>,
    position: usize,
    num_epb: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], needs_epb: bool) -> Self {
        if !needs_epb {
            return Self {
                data: Cow::Borrowed(data),
                position: 0,
                num_epb: 0,
            };
        }

        let mut rbsp = Vec::with_capacity(data.len());
        let mut zeros = 0;
        let mut num_epb = 0;
        for &byte in data {
            if zeros >= 2 && byte == 0x03 {
                num_epb += 1;
                zeros = 0;
                continue;
            }
            zeros = if byte == 0 { zeros + 1 } else { 0 };
            rbsp.push(byte);
        }

        Self {
            data: Cow::Owned(rbsp),
            position: 0,
            num_epb,
        }
    }

    pub fn read_bit(&mut self) -> ReadBitsResult<bool> {
        let byte = self
            .data
            .get(self.position / 8)
            .ok_or(ReadBitsError::OutOfBits)?;
        let bit = (byte >> (7 - self.position % 8)) & 1;
        self.position += 1;
        Ok(bit == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> ReadBitsResult<U> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut value = 0u32;
        for _ in 0..num_bits {
            value = (value << 1) | u32::from(self.read_bit()?);
        }

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// ue(v), H.264 9.1.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> ReadBitsResult<U> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
        }

        let value = ((1u32 << leading_zeros) - 1)
            .checked_add(self.read_bits::<u32>(leading_zeros)?)
            .ok_or(ReadBitsError::InvalidExpGolomb)?;

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// se(v), H.264 9.1.1.
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> ReadBitsResult<U> {
        let code = i64::from(self.read_ue::<u32>()?);
        let value = if code % 2 == 0 { -(code / 2) } else { code / 2 + 1 };
        let value = i32::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)?;

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Payload bits consumed so far.
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    pub fn num_epb(&self) -> usize {
        self.num_epb
    }
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// MSB-first bit sink over any [`std::io::Write`]. Keeps a running count of the
/// bits it was handed, so callers can record header sizes and patch offsets.
pub struct BitWriter<W: Write> {
    out: W,
    pending: u8,
    pending_bits: u8,
    bits_written: u64,
}

impl<W: Write> BitWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            pending: 0,
            pending_bits: 0,
            bits_written: 0,
        }
    }

    /// Writes the `bits` low bits of `value`, most significant first. Returns
    /// the number of bits written.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let value = value.into();
        for shift in (0..bits).rev() {
            self.write_bit((value >> shift) & 1 == 1)?;
        }

        Ok(bits)
    }

    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.pending = (self.pending << 1) | u8::from(bit);
        self.pending_bits += 1;
        self.bits_written += 1;

        if self.pending_bits == 8 {
            self.out.write_all(&[self.pending])?;
            self.pending = 0;
            self.pending_bits = 0;
        }

        Ok(())
    }

    /// Pads with zero bits up to the next byte boundary. Returns the number of
    /// padding bits.
    pub fn pad_to_byte(&mut self) -> BitWriterResult<usize> {
        let padding = usize::from((8 - self.pending_bits) % 8);
        for _ in 0..padding {
            self.write_bit(false)?;
        }

        Ok(padding)
    }

    /// Emits any partial byte, zero padded, and flushes the sink.
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.pending_bits != 0 {
            let byte = self.pending << (8 - self.pending_bits);
            self.out.write_all(&[byte])?;
            self.pending = 0;
            self.pending_bits = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    pub fn has_data_pending(&self) -> bool {
        self.pending_bits != 0
    }

    /// Number of bits handed to this writer so far, padding included.
    pub fn bits_written(&self) -> u64 {
        self.bits_written
    }

    pub(crate) fn inner(&self) -> &W {
        &self.out
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_packs_msb_first() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(3, 0b100u8).unwrap();
            writer.write_f(3, 0b101u8).unwrap();
            writer.write_f(3, 0b011u8).unwrap();
            assert_eq!(writer.bits_written(), 9);
            assert!(writer.has_data_pending());
        }
        assert_eq!(buf, vec![0b1001_0101, 0b1000_0000]);
    }

    #[test]
    fn writer_pads_to_byte() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(3, 0b111u8).unwrap();
            assert_eq!(writer.pad_to_byte().unwrap(), 5);
            assert_eq!(writer.pad_to_byte().unwrap(), 0);
            assert!(!writer.has_data_pending());
            assert_eq!(writer.bits_written(), 8);
        }
        assert_eq!(buf, vec![0b1110_0000]);
    }

    #[test]
    fn writer_rejects_wide_values() {
        let mut buf = Vec::<u8>::new();
        let mut writer = BitWriter::new(&mut buf);
        assert!(matches!(
            writer.write_f(33, 0u32),
            Err(BitWriterError::InvalidBitCount)
        ));
    }

    #[test]
    fn read_ue_limits() {
        let mut reader = BitReader::new(&[0b0001_1010], true);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 12);
        assert_eq!(reader.position(), 7);

        let mut reader = BitReader::new(&[0b1000_0000], true);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.position(), 1);

        // No stop bit.
        let mut reader = BitReader::new(&[0b0000_0000], true);
        assert_eq!(reader.read_ue::<u32>(), Err(ReadBitsError::OutOfBits));

        // 31 zeros, the marker, then 31 ones.
        let mut reader = BitReader::new(&[0, 0, 0, 0b0000_0001, 0xff, 0xff, 0xff, 0xfe], false);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0xffff_fffe);
    }

    #[test]
    fn read_se_alternates_sign() {
        // Codes 1, 2, 3, 4: 010 011 00100 00101.
        let mut reader = BitReader::new(&[0b0100_1100, 0b1000_0101], false);
        assert_eq!(reader.read_se::<i32>().unwrap(), 1);
        assert_eq!(reader.read_se::<i32>().unwrap(), -1);
        assert_eq!(reader.read_se::<i32>().unwrap(), 2);
        assert_eq!(reader.read_se::<i32>().unwrap(), -2);
    }

    #[test]
    fn emulation_prevention_is_stripped_on_request() {
        let mut reader = BitReader::new(&[0x00, 0x00, 0x03, 0x01], false);
        assert_eq!(reader.read_bits::<u32>(24).unwrap(), 0x03);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x01);

        let mut reader = BitReader::new(&[0x00, 0x00, 0x03, 0x01], true);
        assert_eq!(reader.read_bits::<u32>(24).unwrap(), 0x01);
        assert_eq!(reader.num_epb(), 1);
        assert_eq!(reader.read_bit(), Err(ReadBitsError::OutOfBits));
    }
}
