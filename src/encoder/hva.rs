// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side of the HVA H.264 hardware encoder.
//!
//! The accelerator only produces slice data. Everything else in an access
//! unit is written by the host around it:
//!
//! ```text
//! | AUD | SPS | PPS | SEI (reserved) | slice (accelerator) | filler |
//! ```
//!
//! [`Accelerator::encode_frame`] writes the delimiter and the parameter sets,
//! reserves an over-estimated amount of space for the SEI, then hands a task
//! descriptor to the accelerator. Once the accelerator reports the picture
//! size and removal time, the completion worker updates the rate control
//! model, writes the real SEI in the reserved space, closes the gap left
//! before the slice data, appends filler data and runs the completion
//! callback of the instance.
//!
//! Every submitted command gets exactly one callback, run without any lock of
//! the accelerator held. Commands that never reached the accelerator get
//! theirs before `encode_frame` returns, unless `encode_frame` was called from
//! the callback of the same instance: the callback is not reentered, so that
//! one runs once the callback in progress returns.

pub mod brc;
pub mod descriptor;
pub mod lifecycle;
pub mod nvcl;
pub mod params;
pub mod sequencer;
pub mod translator;

use std::collections::VecDeque;
use std::sync::mpsc::sync_channel;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use thiserror::Error;

use crate::codec::h264::nalu_writer::NaluWriterError;
use crate::codec::h264::slice_header::SliceHeaderParams;
use crate::codec::h264::slice_header::SliceHeaderTemplate;
use crate::codec::h264::slice_header::SliceType;
use crate::codec::h264::synthesizer::SynthesizerError;
use crate::device::DeviceError;
use crate::device::HvaDevice;
use crate::device::HwFault;
use crate::device::IrqHandler;
use crate::device::ParamOut;
use crate::device::TaskStatus;
use crate::device::PARAM_OUT_HEADER_SIZE;
use crate::encoder::hva::brc::BufferModel;
use crate::encoder::hva::brc::PictureReport;
use crate::encoder::hva::descriptor::Field;
use crate::encoder::hva::lifecycle::AllocError;
use crate::encoder::hva::lifecycle::InstanceBuffers;
use crate::encoder::hva::lifecycle::ScratchAddresses;
use crate::encoder::hva::lifecycle::ScratchBuffers;
use crate::encoder::hva::nvcl::HrdReport;
use crate::encoder::hva::nvcl::NvclContext;
use crate::encoder::hva::nvcl::FILLER_DATA_HEADER_SIZE;
use crate::encoder::hva::params::BrcType;
use crate::encoder::hva::params::FrameParams;
use crate::encoder::hva::params::InitParams;
use crate::encoder::hva::params::ParamError;
use crate::encoder::hva::params::PictureCodingType;
use crate::encoder::hva::params::SequenceParams;
use crate::encoder::hva::sequencer::CommandSequencer;
use crate::encoder::hva::sequencer::CompletionRecord;
use crate::encoder::hva::sequencer::LaunchError;
use crate::encoder::hva::sequencer::Stats;
use crate::encoder::hva::translator::FrameLayout;
use crate::encoder::hva::translator::ParameterTranslator;

/// Largest number of instances the 8 bit client id can address.
const MAX_CLIENT_IDS: usize = 256;

/// Process-wide settings of an [`Accelerator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceleratorConfig {
    /// Encode instances that may exist at once.
    pub max_instances: usize,
    /// Commands the accelerator command FIFO holds.
    pub cmd_fifo_depth: u32,
    pub status_fifo_size: u32,
    /// How long [`Accelerator::init`] waits for an instance slot.
    pub instance_timeout: Duration,
    /// How long [`Accelerator::encode_frame`] waits for room in the command
    /// FIFO before discarding the command.
    pub fifo_timeout: Duration,
    /// Memory partition of the instance buffers. Instances alternate between
    /// two sub-partitions named after it.
    pub partition: String,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            max_instances: 30,
            cmd_fifo_depth: 16,
            status_fifo_size: 16,
            instance_timeout: Duration::from_millis(1000),
            fifo_timeout: Duration::from_millis(1000),
            partition: String::from("vid-encoder"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HvaError {
    #[error("timed out waiting for a free encode instance")]
    AdmissionTimeout,
    #[error("no free instance slot")]
    NoFreeSlot,
    #[error("invalid instance handle")]
    InvalidHandle,
    #[error("the previous frame of this instance has not completed")]
    Busy,
    #[error("invalid parameters")]
    Params(#[from] ParamError),
    #[error("cannot allocate instance buffers")]
    Alloc(#[from] AllocError),
    #[error("device access failed")]
    Device(#[from] DeviceError),
    #[error("cannot generate non-VCL NAL units")]
    Bitstream(#[from] SynthesizerError),
    #[error("cannot generate the slice header")]
    SliceHeader(#[from] NaluWriterError),
    #[error("cannot start the completion worker")]
    Worker(#[source] std::io::Error),
}

pub type HvaResult<T> = Result<T, HvaError>;

/// Outcome of one encode command, as reported to the completion callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransformStatus {
    #[default]
    Ok,
    /// The rate control skipped the picture. Not an error: the access unit is
    /// empty and the caller moves on to the next frame.
    FrameSkipped,
    /// The final SEI did not fit the space reserved for it.
    BitstreamOverflow,
    /// The command never reached the accelerator.
    CmdDiscarded,
    /// A memory interface error or a failed buffer access.
    HwError,
    BitstreamOversize,
    SliceLimitSize,
    MaxSliceNumber,
    SliceReady,
    TaskListFull,
    UnknownCommand,
    WrongCodecOrResolution,
}

impl TransformStatus {
    fn from_task_status(code: u8) -> Self {
        match TaskStatus::n(code) {
            Some(TaskStatus::Ok) => TransformStatus::Ok,
            Some(TaskStatus::FrameSkipped) => TransformStatus::FrameSkipped,
            Some(TaskStatus::BitstreamOversize) => TransformStatus::BitstreamOversize,
            Some(TaskStatus::SliceLimitSize) => TransformStatus::SliceLimitSize,
            Some(TaskStatus::MaxSliceNumber) => TransformStatus::MaxSliceNumber,
            Some(TaskStatus::SliceReady) => TransformStatus::SliceReady,
            Some(TaskStatus::TaskListFull) => TransformStatus::TaskListFull,
            Some(TaskStatus::UnknownCommand) => TransformStatus::UnknownCommand,
            Some(TaskStatus::WrongCodecOrResolution) => TransformStatus::WrongCodecOrResolution,
            None => {
                log::error!("unknown task status {:#x}", code);
                TransformStatus::HwError
            }
        }
    }
}

/// What the completion callback learns about an access unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompletionInfo {
    /// VCL bytes written by the accelerator.
    pub bitstream_size: u32,
    /// Removal time of the picture, in frame periods.
    pub removal_time: u32,
    pub stuffing_bits: u32,
    /// Bytes written by the host ahead of and after the VCL data.
    pub non_vcl_nalu_size: u32,
    pub transform_status: TransformStatus,
    /// Time from submission to the completion interrupt.
    pub frame_encode_duration: Duration,
    /// Encoder core ticks spent on the picture.
    pub hvc_encode_duration: u32,
}

pub type CompletionCallback = Box<dyn FnMut(&CompletionInfo) + Send>;

/// Identifies an encode instance. Doubles as the client id of its commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(u8);

impl Handle {
    pub fn client_id(self) -> u8 {
        self.0
    }
}

/// Result of a successful [`Accelerator::encode_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// The command is queued. Its callback runs on the completion worker.
    Deferred { task_id: u16 },
    /// The command FIFO stayed full. The callback already ran with
    /// [`TransformStatus::CmdDiscarded`], or runs once the callback in
    /// progress returns.
    Discarded { task_id: u16 },
}

/// What the completion needs to remember about a submitted frame.
struct InFlight {
    task_id: u16,
    frame: FrameParams,
    submitted: Instant,
    /// End of the AUD, SPS and PPS, in bits from the output buffer start.
    headers_end_bits: u32,
    sei_reserved_bits: u32,
    /// Non-VCL size announced to the accelerator, in bits.
    non_vcl_bits: u32,
    brc_enabled: bool,
    sei_enabled: bool,
}

struct Instance<D: HvaDevice> {
    client_id: u8,
    buffers: InstanceBuffers<D>,
    translator: ParameterTranslator,
    /// Rebuilt whenever new sequence parameters are applied.
    nvcl: Option<NvclContext>,
    brc: BufferModel,
    /// Taken out while the callback runs.
    callback: Option<CompletionCallback>,
    /// Completions reported while the callback was taken out.
    pending: VecDeque<CompletionInfo>,
    in_flight: Option<InFlight>,
}

struct InstanceTable<D: HvaDevice> {
    slots: Vec<Option<Arc<Mutex<Instance<D>>>>>,
    /// Present while at least one instance exists.
    scratch: Option<ScratchBuffers>,
}

struct Shared<D: HvaDevice> {
    device: Arc<D>,
    config: AcceleratorConfig,
    sequencer: Arc<CommandSequencer<D>>,
    table: Mutex<InstanceTable<D>>,
}

/// Entry point of the encoder: owns the instances sharing one accelerator.
pub struct Accelerator<D: HvaDevice> {
    shared: Arc<Shared<D>>,
}

impl<D: HvaDevice> Accelerator<D> {
    /// Sets up the admission tokens and starts the completion worker. The
    /// interrupt handler is installed when the first instance is created.
    pub fn new(device: Arc<D>, mut config: AcceleratorConfig) -> HvaResult<Self> {
        if !(1..=MAX_CLIENT_IDS).contains(&config.max_instances) {
            log::warn!(
                "{} instances requested, clamping to 1..={}",
                config.max_instances,
                MAX_CLIENT_IDS
            );
            config.max_instances = config.max_instances.clamp(1, MAX_CLIENT_IDS);
        }

        // One command in flight per instance bounds the outstanding records.
        let capacity = config.max_instances + config.status_fifo_size as usize;
        let (sender, receiver) = sync_channel(capacity);
        let sequencer = Arc::new(CommandSequencer::new(device.clone(), &config, sender));

        let shared = Arc::new(Shared {
            device,
            table: Mutex::new(InstanceTable {
                slots: (0..config.max_instances).map(|_| None).collect(),
                scratch: None,
            }),
            config,
            sequencer,
        });

        let worker = Arc::downgrade(&shared);
        std::thread::Builder::new()
            .name(String::from("hva-completion"))
            .spawn(move || run_completion_worker(worker, receiver))
            .map_err(HvaError::Worker)?;

        Ok(Self { shared })
    }

    /// Creates an encode instance able to encode up to the resolution of
    /// `params.memory_profile`. `callback` runs once per command submitted
    /// for it.
    pub fn init(&self, params: &InitParams, callback: CompletionCallback) -> HvaResult<Handle> {
        if !self.shared.sequencer.admit_instance() {
            log::error!(
                "no encode instance freed up within {:?}",
                self.shared.config.instance_timeout
            );
            return Err(HvaError::AdmissionTimeout);
        }

        let handle = self.shared.create_instance(params, callback);
        if handle.is_err() {
            self.shared.sequencer.release_instance();
        }

        handle
    }

    /// Applies new sequence parameters. The next frame starts a new sequence
    /// and must be an IDR picture.
    pub fn set_sequence_params(&self, handle: Handle, params: &SequenceParams) -> HvaResult<()> {
        let instance = self.shared.instance(handle)?;
        let mut instance = instance.lock();

        instance.translator.apply_sequence_params(params)?;
        instance.brc = Default::default();

        Ok(())
    }

    /// Prepares the access unit of `frame` and submits it to the accelerator.
    /// Errors mean nothing was submitted and no callback will run.
    pub fn encode_frame(&self, handle: Handle, frame: &FrameParams) -> HvaResult<Submission> {
        let instance = self.shared.instance(handle)?;
        let mut guard = instance.lock();
        if guard.in_flight.is_some() {
            return Err(HvaError::Busy);
        }

        let submission = self.shared.encode_frame(&mut guard, frame)?;
        if let Submission::Discarded { .. } = submission {
            deliver(
                &mut guard,
                CompletionInfo {
                    transform_status: TransformStatus::CmdDiscarded,
                    ..Default::default()
                },
            );
        }

        Ok(submission)
    }

    /// Destroys an instance. The caller must wait for its last callback first.
    pub fn terminate(&self, handle: Handle) -> HvaResult<()> {
        self.shared.destroy_instance(handle)?;
        self.shared.sequencer.release_instance();

        Ok(())
    }

    pub fn stats(&self) -> Stats {
        self.shared.sequencer.stats()
    }

    /// Host estimate of the CPB fullness of an instance, in bits.
    pub fn buffer_fullness(&self, handle: Handle) -> HvaResult<i32> {
        Ok(self.shared.instance(handle)?.lock().brc.fullness())
    }

    pub fn instance_count(&self) -> usize {
        self.shared.table.lock().slots.iter().flatten().count()
    }

    /// Addresses of the shared scratch buffers, if any instance exists.
    pub fn scratch_addresses(&self) -> Option<ScratchAddresses> {
        self.shared
            .table
            .lock()
            .scratch
            .as_ref()
            .map(|scratch| *scratch.addresses())
    }
}

/// Runs the callback of an instance with the instance unlocked, so that the
/// callback may call back into the accelerator. If the callback is already
/// running, `info` is queued for that caller to deliver.
fn deliver<D: HvaDevice>(guard: &mut MutexGuard<'_, Instance<D>>, info: CompletionInfo) {
    let Some(mut callback) = guard.callback.take() else {
        guard.pending.push_back(info);
        return;
    };

    let mut info = info;
    loop {
        MutexGuard::unlocked(guard, || callback(&info));
        match guard.pending.pop_front() {
            Some(next) => info = next,
            None => break,
        }
    }

    guard.callback = Some(callback);
}

fn run_completion_worker<D: HvaDevice>(
    shared: Weak<Shared<D>>,
    completions: Receiver<CompletionRecord>,
) {
    // Ends once the accelerator is gone and the sender with it.
    while let Ok(record) = completions.recv() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.complete(record);
    }

    log::debug!("completion worker done");
}

impl<D: HvaDevice> Shared<D> {
    fn instance(&self, handle: Handle) -> HvaResult<Arc<Mutex<Instance<D>>>> {
        self.table
            .lock()
            .slots
            .get(usize::from(handle.0))
            .and_then(|slot| slot.clone())
            .ok_or(HvaError::InvalidHandle)
    }

    fn create_instance(
        &self,
        params: &InitParams,
        callback: CompletionCallback,
    ) -> HvaResult<Handle> {
        let mut table = self.table.lock();

        let client_id = table
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(HvaError::NoFreeSlot)?;

        let scratch = match &table.scratch {
            Some(scratch) => *scratch.addresses(),
            None => {
                let scratch = ScratchBuffers::allocate(self.device.sram_region())?;
                let handler: Weak<dyn IrqHandler> = Arc::downgrade(&self.sequencer) as _;
                self.device.register_irq_handler(handler)?;
                log::debug!("scratch buffers: {} bytes of SRAM", scratch.used());

                let addresses = *scratch.addresses();
                table.scratch = Some(scratch);
                addresses
            }
        };

        let partition = format!("{}-{}", self.config.partition, client_id % 2);
        let max_resolution = params.memory_profile.max_resolution();
        let buffers =
            match InstanceBuffers::allocate(self.device.clone(), &partition, max_resolution) {
                Ok(buffers) => buffers,
                Err(e) => {
                    if table.slots.iter().all(Option::is_none) {
                        self.release_scratch(&mut table);
                    }
                    return Err(e.into());
                }
            };

        let translator = ParameterTranslator::new(max_resolution, buffers.addresses(), &scratch);
        // The table never grows past MAX_CLIENT_IDS slots.
        let client_id = client_id as u8;
        table.slots[usize::from(client_id)] = Some(Arc::new(Mutex::new(Instance {
            client_id,
            buffers,
            translator,
            nvcl: None,
            brc: Default::default(),
            callback: Some(callback),
            pending: VecDeque::new(),
            in_flight: None,
        })));

        log::debug!(
            "instance {} created for {:?}, {} instances",
            client_id,
            params.memory_profile,
            table.slots.iter().flatten().count()
        );

        Ok(Handle(client_id))
    }

    fn destroy_instance(&self, handle: Handle) -> HvaResult<()> {
        let mut table = self.table.lock();

        let instance = table
            .slots
            .get_mut(usize::from(handle.0))
            .and_then(Option::take)
            .ok_or(HvaError::InvalidHandle)?;
        if instance.lock().in_flight.is_some() {
            log::warn!("instance {} terminated with a command in flight", handle.0);
        }
        drop(instance);

        if table.slots.iter().all(Option::is_none) {
            self.release_scratch(&mut table);
        }
        log::debug!("instance {} terminated", handle.0);

        Ok(())
    }

    fn release_scratch(&self, table: &mut InstanceTable<D>) {
        if table.scratch.take().is_some() {
            self.device.unregister_irq_handler();
            log::debug!("scratch buffers released");
        }
    }

    fn encode_frame(&self, instance: &mut Instance<D>, frame: &FrameParams) -> HvaResult<Submission> {
        let device = &*self.device;

        let ids = instance.translator.next_picture(frame)?;
        let params = instance
            .translator
            .sequence()
            .cloned()
            .ok_or(ParamError::NoSequence)?;

        if instance.translator.take_stale() {
            instance.nvcl = None;
        }
        let nvcl = instance
            .nvcl
            .get_or_insert_with(|| NvclContext::new(&params));
        nvcl.begin_access_unit(params.profile);

        let start = frame.addr_output_bitstream_start;
        let end = frame.addr_output_bitstream_end;

        let mut headers = Vec::new();
        let mut offset = frame.bitstream_offset;
        offset += nvcl.write_aud(frame.picture_coding_type, &mut headers)?;
        if frame.idr || frame.first_picture_in_sequence {
            offset += nvcl.write_sps(&params, &mut headers)?;
            offset += nvcl.write_pps(&mut headers)?;
        }

        let brc_enabled = params.brc_type != BrcType::NoBrc;
        let sei_enabled = brc_enabled && params.sei_present();
        let (sei_estimate_bits, sei_reserved_bits) = if sei_enabled {
            let estimate = nvcl.estimate_sei_size(frame);
            (estimate, estimate + ((estimate * 3) >> 3))
        } else {
            (0, 0)
        };

        let vcl_start = u64::from(start) + u64::from((offset + sei_reserved_bits) >> 3);
        if vcl_start >= u64::from(end) {
            return Err(ParamError::OutputBuffer { start, end }.into());
        }

        let headers_addr = start + frame.bitstream_offset / 8;
        device.write(headers_addr, &headers)?;
        device.flush_cache(headers_addr, headers.len() as u32);

        let slice_header = SliceHeaderTemplate::build(&SliceHeaderParams {
            slice_type: match frame.picture_coding_type {
                PictureCodingType::I => SliceType::I,
                PictureCodingType::P => SliceType::P,
            },
            idr: frame.idr,
            idr_pic_id: ids.idr_pic_id,
            frame_num: ids.frame_num,
            log2_max_frame_num_minus4: params.log2_max_frame_num_minus4,
            pic_order_cnt_type: params.pic_order_cnt_type,
            pic_order_cnt_lsb: ids.pic_order_cnt_lsb,
            entropy_coding_mode: nvcl.entropy_coding_mode(),
            disable_deblocking_filter_idc: frame.disable_deblocking_filter_idc,
            slice_alpha_c0_offset_div2: frame.slice_alpha_c0_offset_div2,
            slice_beta_offset_div2: frame.slice_beta_offset_div2,
        })?;

        let addresses = instance.buffers.addresses();
        device.write(addresses.slice_header, &slice_header.bytes)?;
        device.flush_cache(addresses.slice_header, slice_header.bytes.len() as u32);

        let layout = FrameLayout {
            headers_end_bits: offset,
            sei_estimate_bits,
            sei_reserved_bits,
            slice_header: &slice_header,
            entropy_coding_mode: nvcl.entropy_coding_mode(),
            chroma_qp_index_offset: nvcl.chroma_qp_index_offset(),
        };
        let descriptor = instance.translator.build_frame_descriptor(frame, &layout);
        descriptor.dump();
        let non_vcl_bits = descriptor.get(Field::NonVclNaluSize);

        let raw = descriptor.serialize();
        device.write(addresses.task_descriptor, &raw)?;
        device.flush_cache(addresses.task_descriptor, raw.len() as u32);

        device.fill(addresses.param_out, PARAM_OUT_HEADER_SIZE, 0)?;
        device.flush_cache(addresses.param_out, PARAM_OUT_HEADER_SIZE);

        log::trace!(
            "instance {}: {:?} frame {}, {} header bits, {} SEI bits reserved",
            instance.client_id,
            frame.picture_coding_type,
            ids.frame_num,
            offset - frame.bitstream_offset,
            sei_reserved_bits
        );

        let submitted = Instant::now();
        match self
            .sequencer
            .launch(instance.client_id, addresses.task_descriptor)
        {
            Ok(task_id) => {
                instance.translator.commit_picture();
                instance.in_flight = Some(InFlight {
                    task_id,
                    frame: frame.clone(),
                    submitted,
                    headers_end_bits: offset,
                    sei_reserved_bits,
                    non_vcl_bits,
                    brc_enabled,
                    sei_enabled,
                });

                Ok(Submission::Deferred { task_id })
            }
            Err(LaunchError::Discarded { task_id }) => {
                instance
                    .translator
                    .complete_picture(frame.picture_coding_type, false, 0);

                Ok(Submission::Discarded { task_id })
            }
        }
    }

    /// Runs on the completion worker for every record queued by the interrupt
    /// handler.
    fn complete(&self, record: CompletionRecord) {
        let client_id = record.status.client_id;
        let Ok(instance) = self.instance(Handle(client_id)) else {
            log::warn!(
                "task {} completed for terminated instance {}",
                record.status.task_id,
                client_id
            );
            return;
        };

        let mut guard = instance.lock();
        let Some(in_flight) = guard.in_flight.take() else {
            log::warn!(
                "instance {}: task {} completed with no command in flight",
                client_id,
                record.status.task_id
            );
            return;
        };
        if in_flight.task_id != record.status.task_id {
            log::warn!(
                "instance {}: expected task {}, got {}",
                client_id,
                in_flight.task_id,
                record.status.task_id
            );
        }

        let info = self.finish_frame(&mut guard, &in_flight, &record);
        log::trace!("instance {}: {:?}", client_id, info);
        self.sequencer
            .record_completion(record.irq_time.elapsed(), info.hvc_encode_duration);

        deliver(&mut guard, info);
    }

    fn read_param_out(&self, instance: &Instance<D>) -> HvaResult<ParamOut> {
        let addr = instance.buffers.addresses().param_out;
        let mut raw = [0u8; PARAM_OUT_HEADER_SIZE as usize];

        self.device.invalidate_cache(addr, PARAM_OUT_HEADER_SIZE);
        self.device.read(addr, &mut raw)?;
        let param_out =
            ParamOut::parse(&raw).map_err(|e| DeviceError::Backend(anyhow::Error::from(e)))?;
        self.device.fill(addr, PARAM_OUT_HEADER_SIZE, 0)?;

        Ok(param_out)
    }

    fn finish_frame(
        &self,
        instance: &mut Instance<D>,
        in_flight: &InFlight,
        record: &CompletionRecord,
    ) -> CompletionInfo {
        let frame = &in_flight.frame;
        let mut info = CompletionInfo {
            frame_encode_duration: record
                .irq_time
                .saturating_duration_since(in_flight.submitted),
            ..Default::default()
        };

        let param_out = match self.read_param_out(instance) {
            Ok(param_out) => param_out,
            Err(e) => {
                log::error!("instance {}: {:#}", instance.client_id, anyhow::Error::from(e));
                instance
                    .translator
                    .complete_picture(frame.picture_coding_type, false, 0);
                info.transform_status = TransformStatus::HwError;
                return info;
            }
        };
        info.hvc_encode_duration = param_out.hvc_duration();
        info.removal_time = param_out.removal_time;

        if let Some(fault) = record.fault {
            log::error!(
                "instance {}: task {} hit {:?}",
                instance.client_id,
                record.status.task_id,
                fault
            );
            info.transform_status = match fault {
                HwFault::Lmi | HwFault::Emi => TransformStatus::HwError,
                HwFault::StatusFifoOverflow => TransformStatus::CmdDiscarded,
            };
            instance
                .translator
                .complete_picture(frame.picture_coding_type, false, 0);
            return info;
        }

        info.transform_status = TransformStatus::from_task_status(record.status.status);
        info.bitstream_size = param_out.bitstream_size;
        info.stuffing_bits = param_out.stuffing_bits;

        let encoded = info.transform_status == TransformStatus::Ok;
        let skipped = info.transform_status == TransformStatus::FrameSkipped;
        if in_flight.brc_enabled && (encoded || skipped) {
            let descriptor = instance.translator.descriptor();
            let report = PictureReport {
                bitrate: descriptor.get(Field::BitRate),
                framerate_num: descriptor.get(Field::FramerateNum) as u16,
                framerate_den: descriptor.get(Field::FramerateDen) as u16,
                removal_time: info.removal_time,
                picture_size_bits: 8 * info.bitstream_size
                    + in_flight.non_vcl_bits
                    + info.stuffing_bits,
                first_picture: frame.first_picture_in_sequence,
                skipped,
            };

            let fullness = instance.brc.update(&report);
            log::trace!(
                "instance {}: {} bit picture, CPB fullness {} bits",
                instance.client_id,
                report.picture_size_bits,
                fullness
            );
            if fullness < 0 && frame.first_picture_in_sequence {
                log::error!(
                    "instance {}: first picture overflows the CPB by {} bits",
                    instance.client_id,
                    -i64::from(fullness)
                );
            }
        }

        instance.translator.complete_picture(
            frame.picture_coding_type,
            encoded,
            info.bitstream_size,
        );

        if let Err(e) = self.assemble_access_unit(instance, in_flight, &mut info) {
            log::error!(
                "instance {}: cannot finish access unit: {:#}",
                instance.client_id,
                anyhow::Error::from(e)
            );
            info.transform_status = TransformStatus::HwError;
        }

        info
    }

    /// Writes the SEI and filler data around the VCL data of a completed
    /// picture, and sets the non-VCL size of `info`.
    fn assemble_access_unit(
        &self,
        instance: &mut Instance<D>,
        in_flight: &InFlight,
        info: &mut CompletionInfo,
    ) -> HvaResult<()> {
        let device = &*self.device;
        let frame = &in_flight.frame;
        let start = frame.addr_output_bitstream_start;
        let mut offset = in_flight.headers_end_bits;

        let Some(nvcl) = instance.nvcl.as_mut() else {
            return Ok(());
        };

        if in_flight.sei_enabled && info.transform_status == TransformStatus::Ok {
            let report = HrdReport {
                removal_time: info.removal_time,
                bitstream_size: info.bitstream_size,
                stuffing_bits: info.stuffing_bits,
            };
            let mut sei = Vec::new();
            let sei_bits = nvcl.write_sei(frame, &report, &mut sei)?;

            let sei_bytes = sei_bits / 8;
            let reserved_bytes = in_flight.sei_reserved_bits / 8;
            if sei_bytes > reserved_bytes {
                log::error!(
                    "instance {}: SEI of {} bytes exceeds the {} bytes reserved",
                    instance.client_id,
                    sei_bytes,
                    reserved_bytes
                );
                info.transform_status = TransformStatus::BitstreamOverflow;
                return Ok(());
            }

            let sei_addr = start + offset / 8;
            device.write(sei_addr, &sei)?;
            if sei_bytes < reserved_bytes {
                device.invalidate_cache(sei_addr + reserved_bytes, info.bitstream_size);
                device.copy_within(
                    sei_addr + reserved_bytes,
                    sei_addr + sei_bytes,
                    info.bitstream_size,
                )?;
            }
            device.flush_cache(sei_addr, sei_bytes + info.bitstream_size);

            offset += sei_bits;
        }

        if info.stuffing_bits > 0 {
            let buffer_size = u64::from(frame.addr_output_bitstream_end - start);
            let needed = u64::from(offset / 8)
                + u64::from(info.bitstream_size)
                + u64::from(info.stuffing_bits / 8)
                + u64::from(FILLER_DATA_HEADER_SIZE);

            if needed <= buffer_size {
                let mut filler = Vec::new();
                let filler_bits = nvcl.write_filler(info.stuffing_bits, &mut filler)?;

                let filler_addr = start + offset / 8 + info.bitstream_size;
                device.write(filler_addr, &filler)?;
                device.flush_cache(filler_addr, filler.len() as u32);

                offset += filler_bits;
            } else {
                log::warn!(
                    "instance {}: no room for {} stuffing bits",
                    instance.client_id,
                    info.stuffing_bits
                );
            }
        }

        info.non_vcl_nalu_size = (offset - frame.bitstream_offset) / 8;
        log::trace!(
            "instance {}: access unit of {} non-VCL and {} VCL bytes",
            instance.client_id,
            info.non_vcl_nalu_size,
            info.bitstream_size
        );

        Ok(())
    }
}

impl<D: HvaDevice> Drop for Shared<D> {
    fn drop(&mut self) {
        if self.table.get_mut().scratch.is_some() {
            self.device.unregister_irq_handler();
        }
    }
}
