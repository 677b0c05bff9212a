// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::{Inner, JournalEntry};
use crate::imp::{NativeBuffer, NativeSampler, NativeTexture, StorageMode};
use std::any::Any;
use std::cell::UnsafeCell;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Host memory the "GPU" and the CPU both scribble on.
///
/// Access is coordinated by the protocol above (locks, fences, ring rotation), exactly
/// as it would be for real device memory.
struct Memory(UnsafeCell<Box<[u8]>>);

//coordinated externally, as with real device memory
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    fn new(len: u64) -> Self {
        Memory(UnsafeCell::new(vec![0u8; len as usize].into_boxed_slice()))
    }
    fn ptr(&self) -> *mut u8 {
        unsafe { (*self.0.get()).as_mut_ptr() }
    }
}

pub struct SoftBuffer {
    id: u64,
    label: String,
    len: u64,
    mode: StorageMode,
    gpu: Memory,
    //only for managed storage
    cpu: Option<Memory>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SoftBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("len", &self.len)
            .field("mode", &self.mode)
            .finish()
    }
}

impl SoftBuffer {
    pub(super) fn new(inner: Arc<Inner>, len: u64, mode: StorageMode, label: &str) -> Self {
        inner.live_buffers.fetch_add(1, Ordering::Relaxed);
        inner.live_bytes.fetch_add(len, Ordering::Relaxed);
        SoftBuffer {
            id: inner.next_id(),
            label: label.to_string(),
            len,
            mode,
            gpu: Memory::new(len),
            cpu: (mode == StorageMode::Managed).then(|| Memory::new(len)),
            inner,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// What the GPU would see right now.
    pub fn gpu_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.gpu.ptr(), self.len as usize) }
    }

    pub(super) fn gpu_ptr(&self) -> *mut u8 {
        self.gpu.ptr()
    }

    /// Managed storage: copy the GPU side back to the CPU side.
    pub(super) fn synchronize(&self) {
        if let Some(cpu) = &self.cpu {
            unsafe {
                std::ptr::copy_nonoverlapping(self.gpu.ptr(), cpu.ptr(), self.len as usize);
            }
        }
    }
}

impl NativeBuffer for SoftBuffer {
    fn len(&self) -> u64 {
        self.len
    }

    fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    fn contents(&self) -> Option<NonNull<u8>> {
        match self.mode {
            StorageMode::Shared => NonNull::new(self.gpu.ptr()),
            StorageMode::Managed => self.cpu.as_ref().and_then(|c| NonNull::new(c.ptr())),
            StorageMode::Private => None,
        }
    }

    fn did_modify_range(&self, range: Range<u64>) {
        let Some(cpu) = &self.cpu else {
            return;
        };
        assert!(range.end <= self.len, "modified range {range:?} outside buffer of {} bytes", self.len);
        let start = range.start as usize;
        let count = (range.end - range.start) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(cpu.ptr().add(start), self.gpu.ptr().add(start), count);
        }
    }

    fn gpu_address(&self) -> u64 {
        self.id << 32
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for SoftBuffer {
    fn drop(&mut self) {
        self.inner.live_buffers.fetch_sub(1, Ordering::Relaxed);
        self.inner.live_bytes.fetch_sub(self.len, Ordering::Relaxed);
        self.inner.record(JournalEntry::BufferFreed {
            buffer: self.id,
            label: std::mem::take(&mut self.label),
        });
    }
}

#[derive(Debug)]
pub struct SoftTexture {
    id: u64,
    label: String,
}

impl SoftTexture {
    pub(super) fn new(id: u64, label: &str) -> Self {
        SoftTexture {
            id,
            label: label.to_string(),
        }
    }
}

impl NativeTexture for SoftTexture {
    fn resource_id(&self) -> u64 {
        self.id
    }
    fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug)]
pub struct SoftSampler {
    id: u64,
    label: String,
}

impl SoftSampler {
    pub(super) fn new(id: u64, label: &str) -> Self {
        SoftSampler {
            id,
            label: label.to_string(),
        }
    }
}

impl NativeSampler for SoftSampler {
    fn resource_id(&self) -> u64 {
        self.id
    }
    fn label(&self) -> &str {
        &self.label
    }
}
