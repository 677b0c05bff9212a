// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::buffer::CommandBuffer;
use super::encoder::{EncoderMultiplexer, EncoderState};
use crate::buffer::Buffer;
use crate::config::DebugLevel;
use crate::descriptor::BindlessManager;
use crate::fence::FenceWait;
use crate::imp::{EncoderKind, Kernel, NativeBuffer, ShaderStage, StorageMode};
use crate::rhi::Services;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// Describes a render pass.  Attachments are owned by the caller's pipeline layer.
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    pub label: String,
}

impl RenderPassDescriptor {
    pub fn new(label: &str) -> Self {
        RenderPassDescriptor {
            label: label.to_string(),
        }
    }
}

/**
Per-thread recording facade.

A context lazily allocates command buffers from the queue, routes every operation through an
[`EncoderMultiplexer`] so the right encoder is open, publishes dirty descriptors before each
render pass and records buffer usage so multi-buffered slots are not recycled while in flight.

Contexts are not shared between threads; hand finished work to
[`crate::Rhi::submit_command_lists`] or call [`CommandContext::submit`].
*/
pub struct CommandContext {
    services: Arc<Services>,
    bindless: Option<Arc<BindlessManager>>,
    label: String,
    current: Option<CommandBuffer>,
    finished: Vec<CommandBuffer>,
    //already committed because of DebugLevel::ConditionalSubmit
    committed: Vec<FenceWait>,
    encoder: EncoderMultiplexer,
    //(stage, slot) -> (gpu address, length) bound in the open encoder
    bound_heaps: HashMap<(ShaderStage, u32), (u64, u64)>,
    render_waits: Vec<FenceWait>,
    command_buffers: u32,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("label", &self.label)
            .field("encoder", &self.encoder.state())
            .field("finished", &self.finished.len())
            .field("committed", &self.committed.len())
            .finish()
    }
}

impl CommandContext {
    pub(crate) fn new(services: Arc<Services>, bindless: Option<Arc<BindlessManager>>, label: &str) -> Self {
        CommandContext {
            services,
            bindless,
            label: label.to_string(),
            current: None,
            finished: Vec::new(),
            committed: Vec::new(),
            encoder: EncoderMultiplexer::new(),
            bound_heaps: HashMap::new(),
            render_waits: Vec::new(),
            command_buffers: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn encoder_state(&self) -> EncoderState {
        self.encoder.state()
    }

    pub fn within_render_pass(&self) -> bool {
        self.encoder.within_render_pass()
    }

    fn debug_level(&self) -> DebugLevel {
        self.services.config.debug_level
    }

    fn parts(&mut self) -> (&mut EncoderMultiplexer, &mut CommandBuffer) {
        let services = &self.services;
        let label = &self.label;
        let count = &mut self.command_buffers;
        let command_buffer = self.current.get_or_insert_with(|| {
            let name = format!("{label} #{count}");
            *count += 1;
            services
                .queue
                .create_command_buffer(&name)
                .unwrap_or_else(|e| panic!("command buffer allocation failed for {name}: {e}"))
        });
        (&mut self.encoder, command_buffer)
    }

    fn open(&mut self, kind: EncoderKind) -> bool {
        let label = format!("{} {kind:?}", self.label);
        let (encoder, command_buffer) = self.parts();
        let opened = encoder.begin(command_buffer.native(), kind, &label);
        if opened {
            self.bound_heaps.clear();
        }
        opened
    }

    fn close_open_encoder(&mut self) {
        assert!(
            !self.within_render_pass(),
            "fence operations are not allowed inside a render pass"
        );
        let (encoder, command_buffer) = self.parts();
        encoder.close(command_buffer.native());
    }

    /// Commit the current command buffer now, keeping the context usable.
    fn commit_current(&mut self) {
        if let Some(mut command_buffer) = self.current.take() {
            self.encoder.finalize(command_buffer.native());
            self.bound_heaps.clear();
            self.services.upload.flush(&self.services);
            let completion = self.services.queue.commit(command_buffer);
            self.committed.push(completion);
        }
    }

    fn after_encoder_end(&mut self, ended: bool) {
        if ended && self.debug_level() >= DebugLevel::ConditionalSubmit {
            logwise::trace_sync!("conditional submit after encoder end");
            self.commit_current();
        }
    }

    pub fn begin_render_pass(&mut self, descriptor: &RenderPassDescriptor) {
        assert!(!self.within_render_pass(), "begin_render_pass inside a render pass");
        if let Some(bindless) = self.bindless.clone() {
            bindless.update_descriptors_with_gpu(self);
        }
        let waits = std::mem::take(&mut self.render_waits);
        let (encoder, command_buffer) = self.parts();
        encoder.close(command_buffer.native());
        for wait in &waits {
            command_buffer
                .native()
                .wait_for_event(wait.fence().native(), wait.value());
        }
        encoder.begin_render(command_buffer.native(), &descriptor.label);
        self.bound_heaps.clear();
        if let Some(bindless) = self.bindless.clone() {
            bindless.bind_heaps(self, &[ShaderStage::Vertex, ShaderStage::Fragment]);
        }
    }

    pub fn end_render_pass(&mut self) {
        let (encoder, command_buffer) = self.parts();
        encoder.end_render(command_buffer.native());
    }

    pub fn begin_compute_encoder(&mut self) {
        if self.open(EncoderKind::Compute) {
            if let Some(bindless) = self.bindless.clone() {
                bindless.bind_heaps(self, &[ShaderStage::Compute]);
            }
        }
    }

    pub fn end_compute_encoder(&mut self) {
        let (encoder, command_buffer) = self.parts();
        let ended = encoder.end(command_buffer.native(), EncoderKind::Compute);
        self.after_encoder_end(ended);
    }

    pub fn begin_blit_encoder(&mut self) {
        self.open(EncoderKind::Blit);
    }

    pub fn end_blit_encoder(&mut self) {
        let (encoder, command_buffer) = self.parts();
        let ended = encoder.end(command_buffer.native(), EncoderKind::Blit);
        self.after_encoder_end(ended);
    }

    /// Copy between the current backings of two buffers.  Both are marked used by this command buffer.
    pub fn copy_buffer_to_buffer(&mut self, src: &Buffer, src_offset: u64, dst: &Buffer, dst_offset: u64, len: u64) {
        assert!(src_offset + len <= src.size(), "copy source range exceeds {}", src.label());
        assert!(dst_offset + len <= dst.size(), "copy destination range exceeds {}", dst.label());
        let (Some(from), Some(to)) = (src.current_backing(), dst.current_backing()) else {
            panic!("copy between {} and {} needs GPU backings", src.label(), dst.label());
        };
        self.copy_native(&from, src_offset, &to, dst_offset, len);
        self.use_buffer(src);
        self.use_buffer(dst);
    }

    pub(crate) fn copy_native(
        &mut self,
        src: &Arc<dyn NativeBuffer>,
        src_offset: u64,
        dst: &Arc<dyn NativeBuffer>,
        dst_offset: u64,
        len: u64,
    ) {
        self.open(EncoderKind::Blit);
        let (_, command_buffer) = self.parts();
        command_buffer
            .native()
            .copy_buffer_to_buffer(src, src_offset, dst, dst_offset, len);
    }

    pub fn fill_buffer(&mut self, dst: &Buffer, range: Range<u64>, value: u8) {
        let Some(backing) = dst.current_backing() else {
            panic!("fill of {} needs a GPU backing", dst.label());
        };
        assert!(range.end <= dst.size(), "fill range exceeds {}", dst.label());
        self.open(EncoderKind::Blit);
        let (_, command_buffer) = self.parts();
        command_buffer.native().fill_buffer(&backing, range, value);
        self.use_buffer(dst);
    }

    /// Make GPU writes to a managed buffer visible to the CPU copy.  A no-op for other storage.
    pub fn synchronize_resource(&mut self, buffer: &Buffer) {
        if buffer.storage_mode() != StorageMode::Managed {
            return;
        }
        if let Some(backing) = buffer.current_backing() {
            self.synchronize_native(&backing);
            self.use_buffer(buffer);
        }
    }

    pub(crate) fn synchronize_native(&mut self, backing: &Arc<dyn NativeBuffer>) {
        self.open(EncoderKind::Blit);
        let (_, command_buffer) = self.parts();
        command_buffer.native().synchronize_resource(backing);
    }

    pub(crate) fn dispatch(&mut self, kernel: Kernel) {
        assert!(
            self.services.capabilities.supports_compute,
            "dispatch on a device without compute"
        );
        self.begin_compute_encoder();
        let (_, command_buffer) = self.parts();
        command_buffer.native().dispatch(kernel);
    }

    /// Bind `buffer` at `index` for `stage` in the open encoder.
    ///
    /// Inline buffers are pushed as bytes; others bind their current backing and are marked used.
    pub fn bind_buffer(&mut self, stage: ShaderStage, index: u32, buffer: &Buffer) {
        assert!(
            self.encoder.state() != EncoderState::Idle,
            "bind_buffer with no open encoder"
        );
        if let Some(bytes) = buffer.inline_snapshot() {
            self.set_bytes(stage, index, &bytes);
            return;
        }
        let Some(backing) = buffer.current_backing() else {
            logwise::trace_sync!(
                "binding Null buffer {label}",
                label = logwise::privacy::LogIt(buffer.label())
            );
            return;
        };
        let (_, command_buffer) = self.parts();
        command_buffer
            .native()
            .set_buffer(stage, index, &backing, 0, buffer.size());
        self.use_buffer(buffer);
    }

    pub fn set_bytes(&mut self, stage: ShaderStage, index: u32, bytes: &[u8]) {
        assert!(
            self.encoder.state() != EncoderState::Idle,
            "set_bytes with no open encoder"
        );
        let (_, command_buffer) = self.parts();
        command_buffer.native().set_bytes(stage, index, bytes);
    }

    /// Bind a descriptor table, skipping the call if the same range is already bound in this encoder.
    pub(crate) fn bind_heap(&mut self, stage: ShaderStage, index: u32, table: &Arc<dyn NativeBuffer>, len: u64) {
        let key = (stage, index);
        let binding = (table.gpu_address(), len);
        if self.debug_level() < DebugLevel::ResetOnBind && self.bound_heaps.get(&key) == Some(&binding) {
            return;
        }
        let (_, command_buffer) = self.parts();
        command_buffer.native().set_buffer(stage, index, table, 0, len);
        self.bound_heaps.insert(key, binding);
    }

    /// GPU-side signal of `wait`, after everything recorded so far.  Ends any open compute or blit encoder.
    pub fn signal_fence(&mut self, wait: &FenceWait) {
        assert!(
            self.services.capabilities.supports_fences,
            "signal_fence on a device without GPU events"
        );
        self.close_open_encoder();
        let (_, command_buffer) = self.parts();
        command_buffer
            .native()
            .signal_event(wait.fence().native(), wait.value());
    }

    /// GPU-side wait for `wait` before anything recorded after this call.
    pub fn wait_for_fence(&mut self, wait: &FenceWait) {
        assert!(
            self.services.capabilities.supports_fences,
            "wait_for_fence on a device without GPU events"
        );
        self.close_open_encoder();
        let (_, command_buffer) = self.parts();
        command_buffer
            .native()
            .wait_for_event(wait.fence().native(), wait.value());
    }

    /// Delay the next render pass until `wait` has signaled.
    pub(crate) fn wait_before_next_render_pass(&mut self, wait: FenceWait) {
        self.render_waits.push(wait);
    }

    /// The point signaled when the current command buffer completes.
    pub fn command_buffer_fence(&mut self) -> FenceWait {
        let (_, command_buffer) = self.parts();
        command_buffer.completion_fence()
    }

    pub fn add_completion_handler(&mut self, handler: impl FnOnce() + Send + 'static) {
        let (_, command_buffer) = self.parts();
        command_buffer.add_completion_handler(handler);
    }

    /// Record that the current command buffer reads or writes `buffer`'s current slot.
    pub fn use_buffer(&mut self, buffer: &Buffer) {
        if buffer.current_backing().is_none() {
            return;
        }
        let fence = self.command_buffer_fence();
        buffer.mark_used(fence);
    }

    /// Close out recording and hand back the command buffers still to be committed.
    pub fn finalize(mut self) -> Vec<CommandBuffer> {
        if let Some(mut command_buffer) = self.current.take() {
            self.encoder.finalize(command_buffer.native());
            self.finished.push(command_buffer);
        }
        if !self.render_waits.is_empty() {
            logwise::warn_sync!(
                "context {label} finalized with {n} render pass waits unused",
                label = logwise::privacy::LogIt(&self.label),
                n = self.render_waits.len()
            );
        }
        std::mem::take(&mut self.finished)
    }

    /// Commit staged uploads, then finalize and commit this context.
    ///
    /// Returns the completion point of the last command buffer, if any work was recorded.
    pub fn submit(self) -> Option<FenceWait> {
        let services = self.services.clone();
        services.upload.flush(&services);
        let queue = services.queue.clone();
        let mut last = self.committed.last().cloned();
        for command_buffer in self.finalize() {
            last = Some(queue.commit(command_buffer));
        }
        last
    }
}
