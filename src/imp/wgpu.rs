// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
wgpu backend.

wgpu is a portable, validated API, so some native features are emulated:

* CPU-visible storage is a CPU shadow synchronized around submissions (see [`WgpuBuffer`]).
* Events are CPU-side counters; GPU signals apply when the signaling submission completes and
  GPU waits rely on the single queue's submission order.
* Render encoders record nothing; pipelines and attachments belong to the caller.

A dedicated `wgpu_poll` thread drives the device so completion callbacks fire without the
caller polling.
*/

mod buffer;
mod command_buffer;
mod event;
mod scatter;

pub use buffer::{WgpuBuffer, WgpuSampler, WgpuTexture};
pub use command_buffer::WgpuCommandBuffer;
pub use event::WgpuEvent;

use crate::imp::{
    Capabilities, CommandBufferDescriptor, CompletionHandler, Error, Kernel, NativeBuffer, NativeCommandBuffer,
    NativeDevice, NativeEvent, NativeSampler, NativeSamplerDescriptor, NativeTexture, NativeTextureDescriptor,
    StorageMode,
};
use command_buffer::Command;
use scatter::ScatterPipeline;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use wgpu::PollType;
use wgpu::util::DeviceExt;

fn downcast(buffer: &Arc<dyn NativeBuffer>) -> &WgpuBuffer {
    match buffer.as_any().downcast_ref::<WgpuBuffer>() {
        Some(b) => b,
        None => panic!("buffer {} does not belong to the wgpu backend", buffer.label()),
    }
}

fn buffer_key(buffer: &Arc<dyn NativeBuffer>) -> usize {
    Arc::as_ptr(buffer) as *const u8 as usize
}

#[derive(Debug)]
struct Shared {
    device: wgpu::Device,
    queue: wgpu::Queue,
    in_flight: Mutex<u64>,
    idle: Condvar,
    poll_trigger: Mutex<Option<Sender<()>>>,
}

impl Shared {
    fn set_needs_poll(&self) {
        if let Some(sender) = self.poll_trigger.lock().unwrap().as_ref() {
            let _ = sender.send(());
        }
    }

    fn finish_one(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

/// Counts down the callbacks one submission produces; the last one completes it.
struct Completion {
    remaining: AtomicUsize,
    signals: Vec<(Arc<dyn NativeEvent>, u64)>,
    on_complete: Mutex<Option<CompletionHandler>>,
    shared: Arc<Shared>,
}

impl Completion {
    fn done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        for (event, value) in &self.signals {
            event.signal(*value);
        }
        let handler = self.on_complete.lock().unwrap().take();
        if let Some(handler) = handler {
            handler();
        }
        self.shared.finish_one();
    }
}

/// A wgpu device and queue adapted to [`NativeDevice`].
#[derive(Debug)]
pub struct WgpuDevice {
    shared: Arc<Shared>,
    capabilities: Capabilities,
    next_id: AtomicU64,
    scatter: OnceLock<ScatterPipeline>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WgpuDevice {
    /// Open the default adapter.  Blocks until the device is ready.
    pub fn new() -> Result<Arc<WgpuDevice>, Error> {
        test_executors::spin_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Arc<WgpuDevice>, Error> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::from_env_or_default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .map_err(|e| {
                logwise::error_sync!("no adapter: {e}", e = logwise::privacy::LogIt(&e));
                Error::NoSuchAdapter
            })?;
        let info = adapter.get_info();
        logwise::info_sync!(
            "using adapter {name} on {backend}",
            name = logwise::privacy::LogIt(&info.name),
            backend = logwise::privacy::LogIt(&info.backend)
        );
        let descriptor = wgpu::DeviceDescriptor {
            label: Some("buffers_and_fences"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: wgpu::Trace::Off,
        };
        let (device, queue) = adapter
            .request_device(&descriptor)
            .await
            .map_err(|e| Error::Backend(e.to_string()))?;
        Self::from_device(device, queue)
    }

    /// Wrap an already created device.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Result<Arc<WgpuDevice>, Error> {
        let limits = device.limits();
        let capabilities = Capabilities {
            supports_fences: true,
            supports_compute: true,
            unified_memory: false,
            efficient_buffer_blits: true,
            supports_argument_buffers: false,
            default_storage_mode: StorageMode::Private,
            max_buffer_length: limits.max_buffer_size,
        };
        let (poll_sender, poll_receiver): (Sender<()>, Receiver<()>) = mpsc::channel();
        let poll_device = device.clone();
        let poll_thread = thread::Builder::new()
            .name("wgpu_poll".to_string())
            .spawn(move || {
                //poll until the queue is empty each time work is submitted
                while poll_receiver.recv().is_ok() {
                    let _ = poll_device.poll(PollType::Wait);
                }
            })
            .map_err(|e| Error::Backend(format!("could not spawn wgpu_poll: {e}")))?;
        Ok(Arc::new(WgpuDevice {
            shared: Arc::new(Shared {
                device,
                queue,
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
                poll_trigger: Mutex::new(Some(poll_sender)),
            }),
            capabilities,
            next_id: AtomicU64::new(1),
            scatter: OnceLock::new(),
            poll_thread: Mutex::new(Some(poll_thread)),
        }))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn upload_shadow(&self, buffer: &Arc<dyn NativeBuffer>) {
        let wgpu_buffer = downcast(buffer);
        if let Some((offset, bytes)) = wgpu_buffer.take_upload() {
            //write_buffer wants whole words
            let start = offset & !(wgpu::COPY_BUFFER_ALIGNMENT - 1);
            let lead = (offset - start) as usize;
            let end = (offset + bytes.len() as u64)
                .div_ceil(wgpu::COPY_BUFFER_ALIGNMENT)
                * wgpu::COPY_BUFFER_ALIGNMENT;
            let end = end.min(wgpu_buffer.len());
            if lead == 0 && end == offset + bytes.len() as u64 {
                self.shared.queue.write_buffer(&wgpu_buffer.buffer, offset, bytes);
            } else if let Some(contents) = wgpu_buffer.contents() {
                let whole = unsafe {
                    std::slice::from_raw_parts(contents.as_ptr().add(start as usize), (end - start) as usize)
                };
                self.shared.queue.write_buffer(&wgpu_buffer.buffer, start, whole);
            }
        }
    }

    fn encode(&self, commands: &[Command], encoder: &mut wgpu::CommandEncoder) -> Vec<Arc<dyn NativeBuffer>> {
        let device = &self.shared.device;
        let mut readbacks: Vec<Arc<dyn NativeBuffer>> = Vec::new();
        let mut read_back = |buffer: &Arc<dyn NativeBuffer>, mode: StorageMode| {
            if buffer.storage_mode() == mode {
                readbacks.push(buffer.clone());
            }
        };
        for command in commands {
            match command {
                Command::Copy {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    len,
                } => {
                    encoder.copy_buffer_to_buffer(
                        &downcast(src).buffer,
                        *src_offset,
                        &downcast(dst).buffer,
                        *dst_offset,
                        *len,
                    );
                    read_back(dst, StorageMode::Shared);
                }
                Command::Fill { dst, range, value } => {
                    let target = &downcast(dst).buffer;
                    let len = range.end - range.start;
                    if *value == 0 {
                        encoder.clear_buffer(target, range.start, Some(len));
                    } else {
                        let pattern = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some("fill pattern"),
                            contents: &vec![*value; len as usize],
                            usage: wgpu::BufferUsages::COPY_SRC,
                        });
                        encoder.copy_buffer_to_buffer(&pattern, 0, target, range.start, len);
                    }
                    read_back(dst, StorageMode::Shared);
                }
                Command::Synchronize(buffer) => read_back(buffer, StorageMode::Managed),
                Command::Read(_) | Command::Signal { .. } => {}
                Command::Dispatch(Kernel::ScatterDescriptors {
                    entries,
                    indices,
                    table,
                    count,
                    entry_size,
                }) => {
                    let pipeline = self.scatter.get_or_init(|| ScatterPipeline::new(device));
                    pipeline.encode(
                        device,
                        encoder,
                        &downcast(entries).buffer,
                        &downcast(indices).buffer,
                        &downcast(table).buffer,
                        *count,
                        *entry_size,
                    );
                    read_back(table, StorageMode::Shared);
                }
            }
        }
        let mut seen = HashSet::new();
        readbacks.retain(|b| seen.insert(buffer_key(b)));
        readbacks
    }
}

impl Drop for WgpuDevice {
    fn drop(&mut self) {
        //closing the channel ends the poll loop
        self.shared.poll_trigger.lock().unwrap().take();
        if let Some(handle) = self.poll_thread.lock().unwrap().take() {
            //the last reference can go away inside a completion callback on the poll thread
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl NativeDevice for WgpuDevice {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn new_buffer(&self, len: u64, mode: StorageMode, label: &str) -> Result<Arc<dyn NativeBuffer>, Error> {
        if len > self.capabilities.max_buffer_length {
            return Err(Error::TooLarge {
                len,
                max: self.capabilities.max_buffer_length,
            });
        }
        let len = crate::imp::align_copy(len);
        Ok(Arc::new(WgpuBuffer::new(&self.shared.device, self.next_id(), len, mode, label)))
    }

    fn new_texture(&self, descriptor: &NativeTextureDescriptor) -> Result<Arc<dyn NativeTexture>, Error> {
        Ok(Arc::new(WgpuTexture::new(
            &self.shared.device,
            self.next_id(),
            &descriptor.label,
            descriptor.width,
            descriptor.height,
        )))
    }

    fn new_sampler(&self, descriptor: &NativeSamplerDescriptor) -> Result<Arc<dyn NativeSampler>, Error> {
        Ok(Arc::new(WgpuSampler::new(
            &self.shared.device,
            self.next_id(),
            &descriptor.label,
            descriptor.linear,
            descriptor.repeat,
        )))
    }

    fn new_event(&self, label: &str) -> Arc<dyn NativeEvent> {
        Arc::new(WgpuEvent::new(label))
    }

    fn new_command_buffer(&self, descriptor: &CommandBufferDescriptor) -> Result<Box<dyn NativeCommandBuffer>, Error> {
        Ok(Box::new(WgpuCommandBuffer::new(
            &descriptor.label,
            self.capabilities.supports_compute,
        )))
    }

    fn commit(&self, command_buffer: Box<dyn NativeCommandBuffer>, on_complete: CompletionHandler) {
        let command_buffer = WgpuCommandBuffer::from_native(command_buffer);
        let label = command_buffer.label().to_string();

        let mut uploaded = HashSet::new();
        for command in &command_buffer.commands {
            //every buffer the submission touches, so shared readbacks never clobber CPU writes
            let touched: Vec<&Arc<dyn NativeBuffer>> = match command {
                Command::Copy { src, dst, .. } => vec![src, dst],
                Command::Fill { dst, .. } => vec![dst],
                Command::Read(buffer) | Command::Synchronize(buffer) => vec![buffer],
                Command::Dispatch(Kernel::ScatterDescriptors {
                    entries,
                    indices,
                    table,
                    ..
                }) => vec![entries, indices, table],
                Command::Signal { .. } => Vec::new(),
            };
            for buffer in touched {
                if uploaded.insert(buffer_key(buffer)) {
                    self.upload_shadow(buffer);
                }
            }
        }

        let mut encoder = self
            .shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(&label) });
        let readbacks = self.encode(&command_buffer.commands, &mut encoder);
        let staging: Vec<(Arc<dyn NativeBuffer>, wgpu::Buffer)> = readbacks
            .into_iter()
            .map(|target| {
                let source = downcast(&target);
                let staging = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("readback staging"),
                    size: source.len(),
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, source.len());
                (target, staging)
            })
            .collect();
        let signals = command_buffer
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Signal { event, value } => Some((event.clone(), *value)),
                _ => None,
            })
            .collect();

        *self.shared.in_flight.lock().unwrap() += 1;
        self.shared.queue.submit(Some(encoder.finish()));
        logwise::trace_sync!("submitted {label}", label = logwise::privacy::LogIt(&label));

        let completion = Arc::new(Completion {
            remaining: AtomicUsize::new(1 + staging.len()),
            signals,
            on_complete: Mutex::new(Some(on_complete)),
            shared: self.shared.clone(),
        });
        for (target, staging) in staging {
            let completion = completion.clone();
            let mapped = staging.clone();
            staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                match result {
                    Ok(()) => {
                        let view = mapped.slice(..).get_mapped_range();
                        downcast(&target).store_readback(&view);
                        drop(view);
                        mapped.unmap();
                    }
                    Err(e) => {
                        logwise::error_sync!(
                            "readback of {buffer} failed: {e}",
                            buffer = logwise::privacy::LogIt(target.label()),
                            e = logwise::privacy::LogIt(&e)
                        );
                    }
                }
                completion.done();
            });
        }
        self.shared.queue.on_submitted_work_done(move || completion.done());
        self.shared.set_needs_poll();
    }

    fn wait_idle(&self) {
        let _ = self.shared.device.poll(PollType::Wait);
        let mut in_flight = self.shared.in_flight.lock().unwrap();
        while *in_flight > 0 {
            in_flight = self.shared.idle.wait(in_flight).unwrap();
        }
    }
}
