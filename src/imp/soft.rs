// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A software GPU.

Memory is host memory and command buffers are interpreted on a GPU timeline.  The timeline
runs in one of two modes:

* **manual**: nothing executes until [`SoftDevice::step`] or [`SoftDevice::run_until_idle`]
  is called, or until a CPU thread blocks waiting on an event (waits pump the queue).  This
  gives tests full control over when the "GPU" catches up.
* **threaded**: a worker thread executes submissions in order, optionally after an
  artificial latency per command buffer.

Everything executed is recorded in a [`JournalEntry`] log so protocol properties can be
asserted after the fact.
*/

mod command_buffer;
mod event;
mod memory;

use crate::imp::{
    Capabilities, CommandBufferDescriptor, CompletionHandler, EncoderFence, EncoderKind, Error,
    NativeBuffer, NativeCommandBuffer, NativeDevice, NativeEvent, NativeSampler,
    NativeSamplerDescriptor, NativeTexture, NativeTextureDescriptor, ShaderStage, StorageMode,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub use command_buffer::SoftCommandBuffer;
pub use event::SoftEvent;
pub use memory::{SoftBuffer, SoftSampler, SoftTexture};

/// Something the software GPU did, in the order it did it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Committed { command_buffer: u64, label: String },
    EncoderBegan { command_buffer: u64, kind: EncoderKind },
    EncoderEnded { command_buffer: u64, kind: EncoderKind, fence: Option<EncoderFence> },
    EncoderFenceWaited { command_buffer: u64, fence: EncoderFence },
    Copied { command_buffer: u64, src: u64, dst: u64, dst_offset: u64, len: u64 },
    Filled { command_buffer: u64, dst: u64, len: u64, value: u8 },
    Synchronized { command_buffer: u64, buffer: u64 },
    BufferBound { command_buffer: u64, stage: ShaderStage, index: u32, buffer: u64, len: u64 },
    BytesBound { command_buffer: u64, stage: ShaderStage, index: u32, len: u64 },
    Scattered { command_buffer: u64, count: u32 },
    EventSignaled { command_buffer: u64, event: u64, value: u64 },
    EventWaited { command_buffer: u64, event: u64, value: u64 },
    Completed { command_buffer: u64 },
    BufferFreed { buffer: u64, label: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Manual,
    Threaded { latency: Duration },
}

struct Pending {
    command_buffer: SoftCommandBuffer,
    pc: usize,
    on_complete: Option<CompletionHandler>,
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("command_buffer", &self.command_buffer.id())
            .field("pc", &self.pc)
            .finish()
    }
}

/// State shared by the device, its buffers, events and worker thread.
#[derive(Debug)]
pub(crate) struct Inner {
    capabilities: Capabilities,
    mode: Mode,
    pending: Mutex<VecDeque<Pending>>,
    work_available: Condvar,
    idle: Condvar,
    executing: Mutex<()>,
    journal: Mutex<Vec<JournalEntry>>,
    next_id: AtomicU64,
    committed: AtomicU64,
    completed: AtomicU64,
    live_buffers: AtomicUsize,
    live_bytes: AtomicU64,
    memory_budget: Option<u64>,
    fail_command_buffers: AtomicBool,
    shutdown: AtomicBool,
}

impl Inner {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record(&self, entry: JournalEntry) {
        self.journal.lock().unwrap().push(entry);
    }

    pub(crate) fn is_manual(&self) -> bool {
        self.mode == Mode::Manual
    }

    /// Execute the head of the queue as far as it can go.  Returns whether anything happened.
    pub(crate) fn step(&self) -> bool {
        //another thread (or a completion handler on this one) is already executing
        let Ok(_executing) = self.executing.try_lock() else {
            return false;
        };
        let mut pending = match self.pending.lock().unwrap().pop_front() {
            Some(p) => p,
            None => return false,
        };
        let start = pending.pc;
        let finished = pending.command_buffer.execute(&mut pending.pc, self);
        if !finished {
            let progressed = pending.pc != start;
            self.pending.lock().unwrap().push_front(pending);
            return progressed;
        }
        let id = pending.command_buffer.id();
        self.record(JournalEntry::Completed { command_buffer: id });
        if let Some(handler) = pending.on_complete.take() {
            handler();
        }
        //drop resources the command buffer referenced before reporting idle
        drop(pending);
        let pending = self.pending.lock().unwrap();
        self.completed.fetch_add(1, Ordering::Release);
        self.idle.notify_all();
        drop(pending);
        true
    }

    fn is_idle(&self) -> bool {
        self.completed.load(Ordering::Acquire) == self.committed.load(Ordering::Acquire)
    }

    fn worker(self: Arc<Self>, latency: Duration) {
        loop {
            let starting_fresh = {
                let mut pending = self.pending.lock().unwrap();
                while pending.is_empty() && !self.shutdown.load(Ordering::Relaxed) {
                    pending = self.work_available.wait(pending).unwrap();
                }
                if self.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                pending.front().map(|p| p.pc == 0).unwrap_or(false)
            };
            if starting_fresh && !latency.is_zero() {
                thread::sleep(latency);
            }
            if !self.step() {
                //stalled on an event the CPU has not signaled yet
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Configures a [`SoftDevice`].
#[derive(Debug, Clone)]
pub struct SoftDeviceBuilder {
    capabilities: Capabilities,
    mode: Mode,
    memory_budget: Option<u64>,
}

impl SoftDeviceBuilder {
    /// Unified memory, fences and compute supported, shared storage by default.
    pub fn new() -> Self {
        SoftDeviceBuilder {
            capabilities: Capabilities {
                supports_fences: true,
                supports_compute: true,
                unified_memory: true,
                efficient_buffer_blits: false,
                supports_argument_buffers: true,
                default_storage_mode: StorageMode::Shared,
                max_buffer_length: 256 << 20,
            },
            mode: Mode::Manual,
            memory_budget: None,
        }
    }

    /// Pretend to be a discrete GPU: private memory with fast blits, managed by default.
    pub fn discrete(mut self) -> Self {
        self.capabilities.unified_memory = false;
        self.capabilities.efficient_buffer_blits = true;
        self.capabilities.default_storage_mode = StorageMode::Managed;
        self
    }

    pub fn capabilities(mut self, f: impl FnOnce(&mut Capabilities)) -> Self {
        f(&mut self.capabilities);
        self
    }

    pub fn threaded(mut self, latency: Duration) -> Self {
        self.mode = Mode::Threaded { latency };
        self
    }

    /// Fail allocations once this many bytes are live.
    pub fn memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    pub fn build(self) -> Arc<SoftDevice> {
        let inner = Arc::new(Inner {
            capabilities: self.capabilities,
            mode: self.mode,
            pending: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            idle: Condvar::new(),
            executing: Mutex::new(()),
            journal: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            committed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            live_buffers: AtomicUsize::new(0),
            live_bytes: AtomicU64::new(0),
            memory_budget: self.memory_budget,
            fail_command_buffers: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let worker = match self.mode {
            Mode::Manual => None,
            Mode::Threaded { latency } => {
                let move_inner = inner.clone();
                let handle = thread::Builder::new()
                    .name("soft_gpu".to_string())
                    .spawn(move || move_inner.worker(latency));
                match handle {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        logwise::error_sync!(
                            "could not spawn soft_gpu thread, falling back to manual: {err}",
                            err = logwise::privacy::LogIt(&e)
                        );
                        None
                    }
                }
            }
        };
        Arc::new(SoftDevice { inner, worker })
    }
}

impl Default for SoftDeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct SoftDevice {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl SoftDevice {
    pub fn builder() -> SoftDeviceBuilder {
        SoftDeviceBuilder::new()
    }

    /// Default capabilities, manual timeline.
    pub fn manual() -> Arc<SoftDevice> {
        SoftDeviceBuilder::new().build()
    }

    /// Default capabilities, worker-thread timeline.
    pub fn threaded(latency: Duration) -> Arc<SoftDevice> {
        SoftDeviceBuilder::new().threaded(latency).build()
    }

    /// Execute (part of) the oldest pending command buffer.
    pub fn step(&self) -> bool {
        self.inner.step()
    }

    /// Step until nothing is pending or the queue is stalled on an unsignaled event.
    pub fn run_until_idle(&self) {
        while self.inner.step() {}
    }

    pub fn pending_command_buffers(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.inner.journal.lock().unwrap().clone()
    }

    pub fn clear_journal(&self) {
        self.inner.journal.lock().unwrap().clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.inner.live_buffers.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> u64 {
        self.inner.live_bytes.load(Ordering::Relaxed)
    }

    /// Make subsequent command buffer allocations fail.
    pub fn set_fail_command_buffers(&self, fail: bool) {
        self.inner.fail_command_buffers.store(fail, Ordering::Relaxed);
    }
}

impl NativeDevice for SoftDevice {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities.clone()
    }

    fn new_buffer(&self, len: u64, mode: StorageMode, label: &str) -> Result<Arc<dyn NativeBuffer>, Error> {
        let max = self.inner.capabilities.max_buffer_length;
        if len > max {
            return Err(Error::TooLarge { len, max });
        }
        if let Some(budget) = self.inner.memory_budget {
            if self.inner.live_bytes.load(Ordering::Relaxed) + len > budget {
                return Err(Error::OutOfMemory {
                    label: label.to_string(),
                    len,
                });
            }
        }
        Ok(Arc::new(SoftBuffer::new(self.inner.clone(), len, mode, label)))
    }

    fn new_texture(&self, descriptor: &NativeTextureDescriptor) -> Result<Arc<dyn NativeTexture>, Error> {
        Ok(Arc::new(SoftTexture::new(self.inner.next_id(), &descriptor.label)))
    }

    fn new_sampler(&self, descriptor: &NativeSamplerDescriptor) -> Result<Arc<dyn NativeSampler>, Error> {
        Ok(Arc::new(SoftSampler::new(self.inner.next_id(), &descriptor.label)))
    }

    fn new_event(&self, label: &str) -> Arc<dyn NativeEvent> {
        Arc::new(SoftEvent::new(
            self.inner.next_id(),
            label,
            Arc::downgrade(&self.inner),
        ))
    }

    fn new_command_buffer(&self, descriptor: &CommandBufferDescriptor) -> Result<Box<dyn NativeCommandBuffer>, Error> {
        if self.inner.fail_command_buffers.load(Ordering::Relaxed) {
            return Err(Error::CommandBufferAllocation(descriptor.label.clone()));
        }
        Ok(Box::new(SoftCommandBuffer::new(
            self.inner.next_id(),
            descriptor.label.clone(),
            self.inner.clone(),
        )))
    }

    fn commit(&self, command_buffer: Box<dyn NativeCommandBuffer>, on_complete: CompletionHandler) {
        let label = command_buffer.label().to_string();
        let command_buffer = SoftCommandBuffer::from_native(command_buffer);
        self.inner.record(JournalEntry::Committed {
            command_buffer: command_buffer.id(),
            label,
        });
        self.inner.committed.fetch_add(1, Ordering::Release);
        let mut pending = self.inner.pending.lock().unwrap();
        pending.push_back(Pending {
            command_buffer,
            pc: 0,
            on_complete: Some(on_complete),
        });
        self.inner.work_available.notify_one();
    }

    fn wait_idle(&self) {
        match self.inner.mode {
            Mode::Manual => {
                self.run_until_idle();
                if !self.inner.is_idle() {
                    logwise::warn_sync!(
                        "soft GPU stalled with {count} command buffers pending",
                        count = self.pending_command_buffers()
                    );
                }
            }
            Mode::Threaded { .. } => {
                let mut pending = self.inner.pending.lock().unwrap();
                while !self.inner.is_idle() {
                    pending = self.inner.idle.wait(pending).unwrap();
                }
            }
        }
    }
}

impl Drop for SoftDevice {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        {
            let _pending = self.inner.pending.lock().unwrap();
            self.inner.work_available.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Read the GPU-side bytes of a soft buffer.  `None` for buffers from other backends.
pub fn gpu_contents(buffer: &dyn NativeBuffer) -> Option<Vec<u8>> {
    buffer
        .as_any()
        .downcast_ref::<SoftBuffer>()
        .map(|b| b.gpu_bytes().to_vec())
}
