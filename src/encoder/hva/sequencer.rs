// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Admission of encode instances and commands, and the interrupt fast path.
//!
//! Two counting semaphores bound the pipeline: one token per encode instance
//! and one per command the accelerator FIFO can hold. A FIFO token is returned
//! by the interrupt handler when it pops the matching status word. A command
//! that times out waiting for a FIFO token is discarded, and the token the
//! accelerator did not accept is never handed back, so the pipeline shrinks
//! instead of overflowing.
//!
//! The interrupt handler only reads and acknowledges one status FIFO entry
//! under the hardware lock, then queues a [`CompletionRecord`] for the
//! completion worker.

use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::mpsc::SyncSender;
use std::sync::mpsc::TrySendError;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;
use thiserror::Error;

use crate::device::command_word;
use crate::device::HvaDevice;
use crate::device::HwFault;
use crate::device::IrqHandler;
use crate::device::Register;
use crate::device::StatusWord;
use crate::device::FIFO_LEVEL_MASK;
use crate::device::HVA_H264_ENC;
use crate::encoder::hva::AcceleratorConfig;

/// Counting semaphore with timed acquisition.
pub struct Semaphore {
    permits: Mutex<usize>,
    released: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    /// Takes a permit, waiting up to `timeout` for one. Returns false on
    /// timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();

        while *permits == 0 {
            if self.released.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return false;
            }
        }

        *permits -= 1;
        true
    }

    pub fn release(&self) {
        *self.permits.lock() += 1;
        self.released.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

/// What the interrupt handler hands to the completion worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionRecord {
    pub status: StatusWord,
    /// Error raised on the error line since the previous completion.
    pub fault: Option<HwFault>,
    pub irq_time: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("command {task_id} discarded: no room in the command FIFO")]
    Discarded { task_id: u16 },
}

/// Accelerator statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub frames_submitted: u64,
    pub frames_completed: u64,
    pub discarded_commands: u64,
    pub spurious_irqs: u64,
    pub last_irq: Option<Instant>,
    /// Longest delay between an interrupt and the end of its completion.
    pub max_completion_latency: Duration,
    /// Encoder core ticks spent on completed tasks.
    pub hw_encode_ticks: u64,
}

#[derive(Default)]
struct HwState {
    pending_fault: Option<HwFault>,
}

pub struct CommandSequencer<D: HvaDevice> {
    device: Arc<D>,
    instance_tokens: Semaphore,
    fifo_tokens: Semaphore,
    /// Serializes host interface register accesses.
    hw: Mutex<HwState>,
    next_task_id: AtomicU16,
    completions: SyncSender<CompletionRecord>,
    stats: Mutex<Stats>,

    max_instances: usize,
    cmd_fifo_depth: u32,
    status_fifo_size: u32,
    instance_timeout: Duration,
    fifo_timeout: Duration,
}

impl<D: HvaDevice> CommandSequencer<D> {
    pub fn new(
        device: Arc<D>,
        config: &AcceleratorConfig,
        completions: SyncSender<CompletionRecord>,
    ) -> Self {
        Self {
            device,
            instance_tokens: Semaphore::new(config.max_instances),
            fifo_tokens: Semaphore::new(config.cmd_fifo_depth as usize),
            hw: Mutex::new(Default::default()),
            next_task_id: AtomicU16::new(0),
            completions,
            stats: Mutex::new(Default::default()),
            max_instances: config.max_instances,
            cmd_fifo_depth: config.cmd_fifo_depth,
            status_fifo_size: config.status_fifo_size,
            instance_timeout: config.instance_timeout,
            fifo_timeout: config.fifo_timeout,
        }
    }

    /// Takes an instance token. Returns false if none became available in
    /// time.
    pub fn admit_instance(&self) -> bool {
        self.instance_tokens.acquire_timeout(self.instance_timeout)
    }

    pub fn release_instance(&self) {
        self.instance_tokens.release();
    }

    /// FIFO tokens currently available.
    pub fn fifo_tokens(&self) -> usize {
        self.fifo_tokens.available()
    }

    /// Pushes an encode command for `client_id` whose task descriptor is at
    /// `descriptor_addr`. Returns the task id of the command.
    pub fn launch(&self, client_id: u8, descriptor_addr: u32) -> Result<u16, LaunchError> {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cmd = command_word(HVA_H264_ENC, client_id, task_id);

        let accepted = self.fifo_tokens.acquire_timeout(self.fifo_timeout) && {
            let _hw = self.hw.lock();

            let level = self.device.read_register(Register::Cfl);
            if level < self.cmd_fifo_depth {
                self.device.write_register(Register::FifoCmd, cmd);
                self.device.write_register(Register::FifoCmd, descriptor_addr);
                true
            } else {
                // The token is kept: the accelerator holds fewer commands than
                // the semaphore believed.
                log::debug!("command FIFO level {} with a token in hand", level);
                false
            }
        };

        let mut stats = self.stats.lock();
        if !accepted {
            stats.discarded_commands += 1;
            log::warn!(
                "client {}: command {} discarded, {} discarded so far",
                client_id,
                task_id,
                stats.discarded_commands
            );
            return Err(LaunchError::Discarded { task_id });
        }

        stats.frames_submitted += 1;
        log::trace!(
            "client {}: command {:#010x} with descriptor at {:#010x}",
            client_id,
            cmd,
            descriptor_addr
        );

        Ok(task_id)
    }

    /// Accounts for a completion processed by the worker.
    pub fn record_completion(&self, latency: Duration, hw_ticks: u32) {
        let mut stats = self.stats.lock();
        stats.frames_completed += 1;
        stats.max_completion_latency = stats.max_completion_latency.max(latency);
        stats.hw_encode_ticks += u64::from(hw_ticks);
    }

    pub fn stats(&self) -> Stats {
        *self.stats.lock()
    }
}

impl<D: HvaDevice> IrqHandler for CommandSequencer<D> {
    fn on_irq(&self) {
        let now = Instant::now();

        let entry = {
            let mut hw = self.hw.lock();

            let level = self.device.read_register(Register::Sfl);
            if level & FIFO_LEVEL_MASK > 0 {
                let raw = self.device.read_register(Register::FifoSts);
                // The accelerator keeps interrupting until acknowledged.
                self.device.write_register(Register::ItAck, 1);
                self.fifo_tokens.release();

                Some((StatusWord::from_raw(raw), hw.pending_fault.take()))
            } else {
                None
            }
        };

        let mut stats = self.stats.lock();
        let Some((status, fault)) = entry else {
            stats.spurious_irqs += 1;
            log::warn!(
                "status FIFO empty, {} spurious interrupts",
                stats.spurious_irqs
            );
            return;
        };
        stats.last_irq = Some(now);
        drop(stats);

        log::trace!(
            "task {} of client {} done with status {:#x}",
            status.task_id,
            status.client_id,
            status.status
        );

        if usize::from(status.client_id) >= self.max_instances {
            log::error!(
                "client id {} out of range, {} instances",
                status.client_id,
                self.max_instances
            );
            return;
        }

        let record = CompletionRecord {
            status,
            fault,
            irq_time: now,
        };
        match self.completions.try_send(record) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                log::error!("completion queue full, task {} lost", status.task_id)
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("completion worker gone, task {} dropped", status.task_id)
            }
        }
    }

    fn on_error_irq(&self) {
        let mut hw = self.hw.lock();
        log::error!("accelerator error interrupt");

        let lmi = self.device.read_register(Register::LmiErr);
        if lmi != 0 {
            hw.pending_fault = Some(HwFault::Lmi);
        }
        let emi = self.device.read_register(Register::EmiErr);
        if emi != 0 {
            hw.pending_fault = Some(HwFault::Emi);
        }
        let level = self.device.read_register(Register::Sfl);
        if level == self.status_fifo_size {
            hw.pending_fault = Some(HwFault::StatusFifoOverflow);
        }
        log::debug!("LMI_ERR {:#x}, EMI_ERR {:#x}, SFL {}", lmi, emi, level);

        self.device.write_register(Register::ErrItAck, 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::sync_channel;
    use std::sync::mpsc::Receiver;
    use std::sync::Weak;

    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::backend::dummy::ScriptedTask;
    use crate::backend::dummy::DRAM_BASE;
    use crate::device::TaskStatus;

    fn sequencer(
        cmd_fifo_depth: u32,
    ) -> (
        Arc<DummyDevice>,
        Arc<CommandSequencer<DummyDevice>>,
        Receiver<CompletionRecord>,
    ) {
        let device = Arc::new(DummyDevice::new());
        let config = AcceleratorConfig {
            cmd_fifo_depth,
            fifo_timeout: Duration::from_millis(20),
            instance_timeout: Duration::from_millis(20),
            max_instances: 2,
            ..Default::default()
        };
        let (sender, receiver) = sync_channel(8);
        let sequencer = Arc::new(CommandSequencer::new(device.clone(), &config, sender));

        let handler: Weak<dyn IrqHandler> = Arc::downgrade(&sequencer) as Weak<dyn IrqHandler>;
        device.register_irq_handler(handler).unwrap();

        (device, sequencer, receiver)
    }

    #[test]
    fn semaphore_times_out() {
        let semaphore = Semaphore::new(1);

        assert!(semaphore.acquire_timeout(Duration::from_millis(1)));
        let start = Instant::now();
        assert!(!semaphore.acquire_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));

        semaphore.release();
        assert_eq!(semaphore.available(), 1);
        assert!(semaphore.acquire_timeout(Duration::ZERO));
    }

    #[test]
    fn semaphore_wakes_waiter() {
        let semaphore = Arc::new(Semaphore::new(0));

        let waiter = {
            let semaphore = semaphore.clone();
            std::thread::spawn(move || semaphore.acquire_timeout(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        semaphore.release();

        assert!(waiter.join().unwrap());
        assert_eq!(semaphore.available(), 0);
    }

    #[test]
    fn instance_admission_is_bounded() {
        let (_device, sequencer, _receiver) = sequencer(4);

        assert!(sequencer.admit_instance());
        assert!(sequencer.admit_instance());
        assert!(!sequencer.admit_instance());

        sequencer.release_instance();
        assert!(sequencer.admit_instance());
    }

    #[test]
    fn fifo_admission_is_bounded() {
        let (device, sequencer, receiver) = sequencer(2);

        assert_eq!(sequencer.launch(0, DRAM_BASE), Ok(0));
        assert_eq!(sequencer.launch(1, DRAM_BASE), Ok(1));
        assert_eq!(
            sequencer.launch(0, DRAM_BASE),
            Err(LaunchError::Discarded { task_id: 2 })
        );
        assert_eq!(device.pending_commands(), 2);

        // One completion frees one slot.
        assert!(device.complete_next());
        assert_eq!(sequencer.launch(0, DRAM_BASE), Ok(3));

        let record = receiver.try_recv().unwrap();
        assert_eq!(record.status.client_id, 0);
        assert_eq!(record.status.task_id, 0);
        assert_eq!(record.fault, None);

        let stats = sequencer.stats();
        assert_eq!(stats.frames_submitted, 3);
        assert_eq!(stats.discarded_commands, 1);
        assert!(stats.last_irq.is_some());
        assert_eq!(device.interrupt_acks(), 1);
    }

    #[test]
    fn discarded_token_is_not_returned() {
        let (device, sequencer, _receiver) = sequencer(1);

        // The accelerator already holds a command the semaphore does not
        // know about.
        device.write_register(Register::FifoCmd, 0x0002);
        device.write_register(Register::FifoCmd, DRAM_BASE);

        assert!(sequencer.launch(0, DRAM_BASE).is_err());
        assert_eq!(sequencer.fifo_tokens(), 0);
        assert!(sequencer.launch(0, DRAM_BASE).is_err());
        assert_eq!(sequencer.stats().discarded_commands, 2);
    }

    #[test]
    fn spurious_interrupts_are_counted() {
        let (device, sequencer, receiver) = sequencer(2);

        device.raise_spurious_irq();
        device.raise_spurious_irq();

        assert_eq!(sequencer.stats().spurious_irqs, 2);
        assert_eq!(device.interrupt_acks(), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn error_interrupt_reaches_next_completion() {
        let (device, sequencer, receiver) = sequencer(2);

        device.script(ScriptedTask {
            fault: Some(HwFault::Emi),
            ..Default::default()
        });
        sequencer.launch(1, DRAM_BASE).unwrap();
        sequencer.launch(1, DRAM_BASE).unwrap();
        device.complete_all();

        let first = receiver.try_recv().unwrap();
        assert_eq!(first.fault, Some(HwFault::Emi));
        let second = receiver.try_recv().unwrap();
        assert_eq!(second.fault, None);
        assert_eq!(device.error_interrupt_acks(), 1);
    }

    #[test]
    fn status_fifo_overflow_is_detected() {
        let (device, sequencer, receiver) = sequencer(2);

        device.script(ScriptedTask {
            status: TaskStatus::FrameSkipped,
            fault: Some(HwFault::StatusFifoOverflow),
            ..Default::default()
        });
        sequencer.launch(0, DRAM_BASE).unwrap();
        device.complete_next();

        let record = receiver.try_recv().unwrap();
        assert_eq!(record.fault, Some(HwFault::StatusFifoOverflow));
        assert_eq!(record.status.status, TaskStatus::FrameSkipped as u8);
    }
}
