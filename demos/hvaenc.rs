// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives the encoder against the simulated accelerator and writes the
//! resulting Annex B stream. The slice data is fake, the rest of every access
//! unit is what a real accelerator would get.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use argh::FromArgs;
use hva_encoder::backend::dummy::DummyDevice;
use hva_encoder::codec::h264::syntax::Level;
use hva_encoder::codec::h264::syntax::Profile;
use hva_encoder::device::HvaDevice;
use hva_encoder::encoder::hva::params::BrcType;
use hva_encoder::encoder::hva::params::FrameParams;
use hva_encoder::encoder::hva::params::InitParams;
use hva_encoder::encoder::hva::params::MemoryProfile;
use hva_encoder::encoder::hva::params::PictureCodingType;
use hva_encoder::encoder::hva::params::SequenceParams;
use hva_encoder::encoder::hva::Accelerator;
use hva_encoder::encoder::hva::CompletionInfo;
use hva_encoder::encoder::hva::Submission;
use hva_encoder::encoder::hva::TransformStatus;

/// Output buffer handed to the accelerator for each access unit.
const OUTPUT_BUFFER_SIZE: u32 = 2 << 20;

/// Simulated HVA encoder
#[derive(Debug, FromArgs)]
struct Args {
    /// frames width
    #[argh(option, default = "720")]
    width: u16,

    /// frames height
    #[argh(option, default = "576")]
    height: u16,

    /// number of frames to encode
    #[argh(option, default = "25")]
    count: usize,

    /// target bitrate in bits per second
    #[argh(option, default = "2_000_000")]
    bitrate: u32,

    /// framerate numerator
    #[argh(option, default = "25")]
    framerate_num: u16,

    /// framerate denominator
    #[argh(option, default = "1")]
    framerate_den: u16,

    /// distance between IDR pictures
    #[argh(option, default = "12")]
    idr_period: usize,

    /// use constant bitrate instead of variable bitrate
    #[argh(switch)]
    cbr: bool,

    /// output file for the encoded stream
    #[argh(option)]
    output: Option<PathBuf>,
}

fn memory_profile(width: u16, height: u16) -> anyhow::Result<MemoryProfile> {
    [
        MemoryProfile::Cif,
        MemoryProfile::Sd,
        MemoryProfile::Hd720p,
        MemoryProfile::Hd,
    ]
    .into_iter()
    .find(|profile| {
        let max = profile.max_resolution();
        u32::from(width) <= max.width && u32::from(height) <= max.height
    })
    .ok_or_else(|| anyhow!("{}x{} is larger than any memory profile", width, height))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let device = Arc::new(DummyDevice::new());
    let accelerator = Accelerator::new(device.clone(), Default::default())?;

    let (sender, completions) = channel();
    let handle = accelerator.init(
        &InitParams {
            memory_profile: memory_profile(args.width, args.height)?,
        },
        Box::new(move |info: &CompletionInfo| {
            let _ = sender.send(*info);
        }),
    )?;

    let params = SequenceParams {
        frame_width: args.width,
        frame_height: args.height,
        profile: Profile::Main,
        level: Level::L4,
        brc_type: if args.cbr { BrcType::Cbr } else { BrcType::Vbr },
        bitrate: args.bitrate,
        cpb_buffer_size: args.bitrate,
        framerate_num: args.framerate_num,
        framerate_den: args.framerate_den,
        ..Default::default()
    };
    accelerator.set_sequence_params(handle, &params)?;

    let source_size = u32::from(args.width) * u32::from(args.height) * 3 / 2;
    let source = device.alloc("source", source_size, 256)?;
    let output_buffer = device.alloc("output", OUTPUT_BUFFER_SIZE, 256)?;

    let mut output = args
        .output
        .map(File::create)
        .transpose()
        .context("cannot create output file")?;

    for i in 0..args.count {
        let idr = i % args.idr_period.max(1) == 0;
        let frame = FrameParams {
            picture_coding_type: if idr {
                PictureCodingType::I
            } else {
                PictureCodingType::P
            },
            idr,
            first_picture_in_sequence: i == 0,
            addr_source_buffer: source.phys,
            addr_output_bitstream_start: output_buffer.phys,
            addr_output_bitstream_end: output_buffer.end(),
            ..Default::default()
        };

        if let Submission::Discarded { task_id } = accelerator.encode_frame(handle, &frame)? {
            log::warn!("frame {} (task {}) discarded", i, task_id);
            completions.recv()?;
            continue;
        }

        device.complete_next();
        let info = completions
            .recv_timeout(Duration::from_secs(1))
            .context("no completion")?;

        match info.transform_status {
            TransformStatus::Ok => (),
            TransformStatus::FrameSkipped => {
                println!("frame {}: skipped", i);
                continue;
            }
            status => return Err(anyhow!("frame {} failed: {:?}", i, status)),
        }

        let size = (info.non_vcl_nalu_size + info.bitstream_size) as usize;
        let access_unit = device.read_vec(output_buffer.phys, size)?;
        if let Some(output) = &mut output {
            output.write_all(&access_unit)?;
        }

        println!(
            "frame {}: {} bytes ({} non-VCL), removal time {}, CPB {} bits",
            i,
            size,
            info.non_vcl_nalu_size,
            info.removal_time,
            accelerator.buffer_fullness(handle)?
        );
    }

    let stats = accelerator.stats();
    println!(
        "{} frames submitted, {} completed, {} discarded, {} accelerator ticks",
        stats.frames_submitted,
        stats.frames_completed,
        stats.discarded_commands,
        stats.hw_encode_ticks
    );

    accelerator.terminate(handle)?;
    Ok(())
}
