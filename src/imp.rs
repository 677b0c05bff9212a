// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The downward interface: what this crate needs from a native graphics API.

Everything above this module talks to `dyn NativeDevice` and friends.  The software backend
is always compiled; the wgpu backend is behind `backend_wgpu`.
*/

use std::any::Any;
use std::fmt::Debug;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

pub mod soft;

#[cfg(feature = "backend_wgpu")]
pub mod wgpu;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("out of device memory allocating {len} bytes for {label}")]
    OutOfMemory { label: String, len: u64 },
    #[error("buffer length {len} exceeds device limit {max}")]
    TooLarge { len: u64, max: u64 },
    #[error("command buffer allocation failed: {0}")]
    CommandBufferAllocation(String),
    #[error("device lost")]
    DeviceLost,
    #[error("no suitable adapter")]
    NoSuchAdapter,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Where a buffer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// One allocation visible to both CPU and GPU.
    Shared,
    /// GPU-only memory; the CPU reaches it through transfer buffers.
    Private,
    /// Separate CPU and GPU copies, kept coherent with explicit notifications.
    Managed,
}

/// Feature flags, read once at startup.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// GPU-side event signal/wait commands are available.
    pub supports_fences: bool,
    pub supports_compute: bool,
    pub unified_memory: bool,
    pub efficient_buffer_blits: bool,
    pub supports_argument_buffers: bool,
    pub default_storage_mode: StorageMode,
    pub max_buffer_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    Render,
    Compute,
    Blit,
}

/// Token produced when an encoder ends.  The next encoder on the same command buffer waits on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncoderFence(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferencePolicy {
    Retained,
    Unretained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReporting {
    Default,
    EncoderExecutionStatus,
}

#[derive(Debug, Clone)]
pub struct CommandBufferDescriptor {
    pub label: String,
    pub references: ReferencePolicy,
    pub error_reporting: ErrorReporting,
}

#[derive(Debug, Clone)]
pub struct NativeTextureDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct NativeSamplerDescriptor {
    pub label: String,
    pub linear: bool,
    pub repeat: bool,
}

/// Compute kernels this crate dispatches itself.
#[derive(Debug, Clone)]
pub enum Kernel {
    /// Copy `count` entries of `entry_size` bytes from `entries` into `table`, at the
    /// positions given by the `u32` array in `indices`.
    ScatterDescriptors {
        entries: Arc<dyn NativeBuffer>,
        indices: Arc<dyn NativeBuffer>,
        table: Arc<dyn NativeBuffer>,
        count: u32,
        entry_size: u32,
    },
}

pub type CompletionHandler = Box<dyn FnOnce() + Send>;

pub trait NativeDevice: Send + Sync + Debug {
    fn capabilities(&self) -> Capabilities;
    fn new_buffer(&self, len: u64, mode: StorageMode, label: &str) -> Result<Arc<dyn NativeBuffer>, Error>;
    fn new_texture(&self, descriptor: &NativeTextureDescriptor) -> Result<Arc<dyn NativeTexture>, Error>;
    fn new_sampler(&self, descriptor: &NativeSamplerDescriptor) -> Result<Arc<dyn NativeSampler>, Error>;
    /// A CPU-observable event.  Events exist on every backend; whether the GPU can
    /// signal or wait on them is [`Capabilities::supports_fences`].
    fn new_event(&self, label: &str) -> Arc<dyn NativeEvent>;
    fn new_command_buffer(&self, descriptor: &CommandBufferDescriptor) -> Result<Box<dyn NativeCommandBuffer>, Error>;
    /// Submit in queue order.  `on_complete` runs once the GPU has finished the work.
    fn commit(&self, command_buffer: Box<dyn NativeCommandBuffer>, on_complete: CompletionHandler);
    /// Block until everything committed so far has completed.
    fn wait_idle(&self);
}

pub trait NativeBuffer: Send + Sync + Debug {
    fn len(&self) -> u64;
    fn storage_mode(&self) -> StorageMode;
    /// CPU pointer for shared and managed storage.  Private storage has none.
    fn contents(&self) -> Option<NonNull<u8>>;
    /// Tell the GPU copy of a managed buffer that the CPU wrote `range`.
    fn did_modify_range(&self, range: Range<u64>);
    fn gpu_address(&self) -> u64;
    fn label(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

pub trait NativeTexture: Send + Sync + Debug {
    fn resource_id(&self) -> u64;
    fn label(&self) -> &str;
}

pub trait NativeSampler: Send + Sync + Debug {
    fn resource_id(&self) -> u64;
    fn label(&self) -> &str;
}

pub trait NativeEvent: Send + Sync + Debug {
    fn signaled_value(&self) -> u64;
    /// CPU-side signal.  Values lower than the current one are ignored.
    fn signal(&self, value: u64);
    /// Wait until `signaled_value() >= value`.  `None` waits forever.  Returns whether the value was reached.
    fn wait(&self, value: u64, timeout: Option<Duration>) -> bool;
    /// Run `callback` once the event reaches `value` (immediately if it already has).
    fn notify(&self, value: u64, callback: CompletionHandler);
    fn as_any(&self) -> &dyn Any;
}

/// A native command buffer under construction.
pub trait NativeCommandBuffer: Send + Debug {
    fn label(&self) -> &str;
    fn begin_encoder(&mut self, kind: EncoderKind, label: &str);
    fn end_encoder(&mut self) -> Option<EncoderFence>;
    fn wait_for_encoder_fence(&mut self, fence: EncoderFence);
    fn copy_buffer_to_buffer(
        &mut self,
        src: &Arc<dyn NativeBuffer>,
        src_offset: u64,
        dst: &Arc<dyn NativeBuffer>,
        dst_offset: u64,
        len: u64,
    );
    fn fill_buffer(&mut self, dst: &Arc<dyn NativeBuffer>, range: Range<u64>, value: u8);
    /// Make the CPU copy of a managed buffer reflect GPU writes once this command buffer completes.
    fn synchronize_resource(&mut self, buffer: &Arc<dyn NativeBuffer>);
    fn set_buffer(&mut self, stage: ShaderStage, index: u32, buffer: &Arc<dyn NativeBuffer>, offset: u64, len: u64);
    fn set_bytes(&mut self, stage: ShaderStage, index: u32, bytes: &[u8]);
    fn dispatch(&mut self, kernel: Kernel);
    fn signal_event(&mut self, event: &Arc<dyn NativeEvent>, value: u64);
    fn wait_for_event(&mut self, event: &Arc<dyn NativeEvent>, value: u64);
    /// Recover the concrete type at commit time.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Round `len` up to the 4-byte copy granularity every backend shares.
pub(crate) fn align_copy(len: u64) -> u64 {
    (len + 3) & !3
}
