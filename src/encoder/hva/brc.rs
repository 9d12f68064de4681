// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coded picture buffer model kept on the host side of the accelerator, and the
//! value/scale coding used by the HRD syntax for bit rate and CPB size.

/// Scale offset of `bit_rate_value_minus1`, H.264 E.2.2 (E-37).
pub const BITRATE_SCALE_OFFSET: u32 = 6;
/// Scale offset of `cpb_size_value_minus1`, H.264 E.2.2 (E-38).
pub const CPB_SIZE_SCALE_OFFSET: u32 = 4;

fn saturate_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Fixed point rational number `div + rem / base`, with `rem < base`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Accumulator {
    pub div: i32,
    pub rem: u32,
    pub base: u16,
}

impl Accumulator {
    /// Quantity accumulated over `time_num / time_den` seconds at `rate` units
    /// per second.
    pub fn from_rate_time(rate: u32, time_num: u32, time_den: u16) -> Self {
        let base = time_den.max(1);
        let total = u64::from(rate) * u64::from(time_num);

        Self {
            div: saturate_i32((total / u64::from(base)) as i64),
            rem: (total % u64::from(base)) as u32,
            base,
        }
    }

    /// Bits drained from the CPB per frame period.
    pub fn depletion(bitrate: u32, framerate_num: u16, framerate_den: u16) -> Self {
        Self::from_rate_time(bitrate, u32::from(framerate_den), framerate_num)
    }

    pub fn add(&mut self, other: &Accumulator) {
        debug_assert_eq!(self.base, other.base);

        let base = u64::from(self.base.max(1));
        let rem = u64::from(self.rem) + u64::from(other.rem);

        self.div = saturate_i32(
            i64::from(self.div) + i64::from(other.div) + (rem / base) as i64,
        );
        self.rem = (rem % base) as u32;
    }

    pub fn add_value(&mut self, value: u32) {
        self.div = saturate_i32(i64::from(self.div) + i64::from(value));
    }

    pub fn sub_value(&mut self, value: u32) {
        self.div = saturate_i32(i64::from(self.div) - i64::from(value));
    }

    pub fn mul(&mut self, n: u32) {
        let base = u64::from(self.base.max(1));
        let rem = u64::from(self.rem) * u64::from(n);

        self.div = saturate_i32(
            i64::from(self.div) * i64::from(n) + (rem / base) as i64,
        );
        self.rem = (rem % base) as u32;
    }

    /// Integer part, rounding half up on the remainder.
    pub fn integer_part(&self) -> i32 {
        if 2 * u64::from(self.rem) >= u64::from(self.base.max(1)) {
            self.div.saturating_add(1)
        } else {
            self.div
        }
    }
}

/// What the rate control model needs to know about a completed picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PictureReport {
    pub bitrate: u32,
    pub framerate_num: u16,
    pub framerate_den: u16,
    /// Removal time of the picture, in frame periods.
    pub removal_time: u32,
    /// VCL, non-VCL and stuffing bits of the access unit.
    pub picture_size_bits: u32,
    pub first_picture: bool,
    pub skipped: bool,
}

/// Host model of the coded picture buffer fullness.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferModel {
    fullness: Accumulator,
    last_removal_time: u32,
}

impl BufferModel {
    /// Accounts for one more picture and returns the new fullness in bits.
    pub fn update(&mut self, report: &PictureReport) -> i32 {
        let depletion = Accumulator::depletion(
            report.bitrate,
            report.framerate_num,
            report.framerate_den,
        );

        if report.first_picture {
            let mut fullness = depletion;
            fullness.mul(report.removal_time);
            fullness.sub_value(report.picture_size_bits);

            self.fullness = fullness;
            self.last_removal_time = report.removal_time;
        } else {
            let elapsed = report.removal_time.wrapping_sub(self.last_removal_time);
            if elapsed > i32::MAX as u32 {
                log::warn!(
                    "removal time went back from {} to {}, picture ignored",
                    self.last_removal_time,
                    report.removal_time
                );
                return self.fullness();
            }

            // At least one frame period elapsed since the previous picture.
            let periods = elapsed.max(1);
            let mut drained = depletion;
            drained.mul(periods);
            self.fullness.add(&drained);
            self.last_removal_time = self.last_removal_time.wrapping_add(periods);
            self.fullness.sub_value(report.picture_size_bits);
        }

        if report.skipped {
            self.fullness.add_value(report.picture_size_bits);
        }

        self.fullness()
    }

    pub fn fullness(&self) -> i32 {
        self.fullness.integer_part()
    }
}

/// A syntax element pair such that `(value << (scale + offset))` approximates
/// a target quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueScale {
    pub value: u32,
    pub scale: u32,
}

/// Splits `target` into a value fitting 16 bits and a 4 bit scale.
///
/// Trailing zero bits are moved into the scale as long as the scale stays
/// representable, then at least `scale_offset` bits are dropped and the value
/// is shifted until it fits 16 bits. Exact whenever `target` has enough
/// trailing zeros.
pub fn deconstruct_value(target: u32, scale_offset: u32) -> ValueScale {
    let mut value = target;
    let mut shift = 0;

    while (value & 1 == 0 && shift < 16 + scale_offset - 1)
        || (value & 1 == 1 && (shift < scale_offset || value > 0xffff))
    {
        value >>= 1;
        shift += 1;
    }

    ValueScale {
        // `value_minus1` syntax elements cannot code 0.
        value: value.max(1),
        scale: shift - scale_offset,
    }
}

pub fn reconstruct_value(value: u32, scale: u32, scale_offset: u32) -> u32 {
    let shifted = u64::from(value) << (scale + scale_offset).min(32);
    shifted.min(u64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_arithmetic() {
        // 2 Mbps at 30000/1001 fps.
        let mut acc = Accumulator::depletion(2_000_000, 30000, 1001);
        assert_eq!(acc.div, 66733);
        assert_eq!(acc.rem, 10000);
        assert_eq!(acc.base, 30000);
        assert_eq!(acc.integer_part(), 66733);

        let depletion = acc;
        acc.add(&depletion);
        assert_eq!(acc.div, 133466);
        assert_eq!(acc.rem, 20000);
        assert_eq!(acc.integer_part(), 133467);

        acc.add(&depletion);
        assert_eq!(acc.div, 200200);
        assert_eq!(acc.rem, 0);

        let mut tripled = depletion;
        tripled.mul(3);
        assert_eq!(tripled, acc);

        acc.sub_value(200300);
        assert_eq!(acc.integer_part(), -100);
        acc.add_value(50);
        assert_eq!(acc.integer_part(), -50);
    }

    fn report(removal_time: u32, size: u32, first: bool) -> PictureReport {
        PictureReport {
            bitrate: 2_000_000,
            framerate_num: 30000,
            framerate_den: 1001,
            removal_time,
            picture_size_bits: size,
            first_picture: first,
            skipped: false,
        }
    }

    #[test]
    fn fullness_matches_closed_form() {
        let size = 50_000;
        let mut model = BufferModel::default();

        for n in 1..=300u32 {
            let fullness = model.update(&report(n, size, n == 1));
            let expected = 2_000_000.0 * 1001.0 / 30000.0 * f64::from(n) - f64::from(size * n);
            assert!((f64::from(fullness) - expected).abs() <= 1.0, "{n}: {fullness} vs {expected}");
        }
    }

    #[test]
    fn elapsed_periods_are_all_accounted() {
        let mut model = BufferModel::default();
        let mut r = report(1, 0, true);
        r.framerate_num = 25;
        r.framerate_den = 1;

        assert_eq!(model.update(&r), 80_000);

        // Three frame periods between the two pictures.
        r.first_picture = false;
        r.removal_time = 4;
        r.picture_size_bits = 100_000;
        assert_eq!(model.update(&r), 80_000 * 4 - 100_000);
    }

    #[test]
    fn skipped_frame_is_not_subtracted() {
        let mut model = BufferModel::default();
        let mut r = report(1, 40_000, true);
        r.framerate_num = 25;
        r.framerate_den = 1;
        let before = model.update(&r);

        r.first_picture = false;
        r.removal_time = 2;
        r.skipped = true;
        let after = model.update(&r);

        assert_eq!(after - before, 80_000);
    }

    #[test]
    fn removal_time_going_back_is_ignored() {
        let mut model = BufferModel::default();
        let mut r = report(10, 40_000, true);
        r.framerate_num = 25;
        r.framerate_den = 1;
        let before = model.update(&r);

        r.first_picture = false;
        r.removal_time = 5;
        assert_eq!(model.update(&r), before);

        r.removal_time = 11;
        assert_eq!(model.update(&r), before + 80_000 - 40_000);
    }

    #[test]
    fn value_scale_coding() {
        let vs = deconstruct_value(2_000_000, BITRATE_SCALE_OFFSET);
        assert_eq!(vs, ValueScale { value: 15625, scale: 1 });
        assert_eq!(reconstruct_value(vs.value, vs.scale, BITRATE_SCALE_OFFSET), 2_000_000);

        let vs = deconstruct_value(4_000_000, CPB_SIZE_SCALE_OFFSET);
        assert_eq!(vs, ValueScale { value: 15625, scale: 4 });
        assert_eq!(reconstruct_value(vs.value, vs.scale, CPB_SIZE_SCALE_OFFSET), 4_000_000);

        for target in [1_000u32, 64_000, 1_500_001, 38_400_000, 135_000_000, u32::MAX] {
            for offset in [BITRATE_SCALE_OFFSET, CPB_SIZE_SCALE_OFFSET] {
                let vs = deconstruct_value(target, offset);
                assert!(vs.value <= 0xffff);
                assert!(vs.scale < 16);

                let rebuilt = reconstruct_value(vs.value, vs.scale, offset);
                assert!(rebuilt <= target);
                assert_eq!(deconstruct_value(rebuilt, offset), vs);
            }
        }
    }
}
