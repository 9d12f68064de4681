#![no_main]

use hva_encoder::codec::h264::nalu::NaluHeader;
use hva_encoder::codec::h264::nalu::NaluType;
use hva_encoder::codec::h264::nalu_writer::NaluWriter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut out = Vec::new();
    {
        let mut writer = NaluWriter::new(&mut out, true);
        if writer.write_header(NaluHeader::new(NaluType::Sei)).is_err() {
            return;
        }
        for &byte in data {
            if writer.write_u(8, byte).is_err() {
                return;
            }
        }
        if writer.rbsp_trailing_bits().is_err() || writer.flush().is_err() {
            return;
        }
    }

    // Past the start code, emulation prevention leaves no 00 00 0x sequence
    // other than the escape itself.
    for window in out[4..].windows(3) {
        assert!(!(window[0] == 0 && window[1] == 0 && window[2] <= 2));
    }
});
