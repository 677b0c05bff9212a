// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Lockable GPU buffers.

A [`Buffer`] is created from a [`BufferDescriptor`].  Its lifetime hint picks how many native
backings it gets:

| lifetime  | backings                 | write lock                                  |
|-----------|--------------------------|---------------------------------------------|
| Static    | 1                        | in place (shared) or through a transfer     |
| Dynamic   | `Config::buffering_depth`| rotates to the next backing first           |
| Volatile  | `Config::buffering_depth`| as Dynamic, or CPU memory bound as bytes    |
| Null      | 0                        | cannot be locked                            |

The storage mode (shared, private or managed) is chosen from the usage flags and the device
capabilities, and decides how a lock reaches memory; see `storage.rs`.

Locks are exclusive: a buffer has at most one outstanding [`BufferLock`], and dropping it
unlocks.
*/

mod storage;

use crate::fence::FenceWait;
use crate::imp::{self, NativeBuffer, StorageMode};
use crate::multibuffer::BufferRing;
use crate::rhi::Services;
use crate::transfer::TransferBuffer;
use crate::{RingHazardPolicy, deletion::DeferredObject};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Volatile buffers smaller than this may live in CPU memory when inline buffers are enabled.
pub const INLINE_LIMIT: u64 = 4096;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Written rarely; one backing.
        const STATIC = 1 << 0;
        /// Written most frames; multi-buffered.
        const DYNAMIC = 1 << 1;
        /// Written every use; multi-buffered, may be inline.
        const VOLATILE = 1 << 2;
        /// A placeholder with no memory.
        const NULL = 1 << 3;
        const VERTEX = 1 << 4;
        const INDEX = 1 << 5;
        const UNIFORM = 1 << 6;
        const SHADER_RESOURCE = 1 << 7;
        const UNORDERED_ACCESS = 1 << 8;
        /// Keep the memory CPU visible even where private storage would be faster.
        const KEEP_CPU_ACCESSIBLE = 1 << 9;

        const LIFETIME = Self::STATIC.bits() | Self::DYNAMIC.bits() | Self::VOLATILE.bits() | Self::NULL.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    Static,
    Dynamic,
    Volatile,
    Null,
}

impl Lifetime {
    /// Lifetime bits are mutually exclusive; none means Dynamic.
    pub fn from_usage(usage: BufferUsage) -> Self {
        let bits = usage & BufferUsage::LIFETIME;
        match bits.bits().count_ones() {
            0 => Lifetime::Dynamic,
            1 if bits == BufferUsage::STATIC => Lifetime::Static,
            1 if bits == BufferUsage::DYNAMIC => Lifetime::Dynamic,
            1 if bits == BufferUsage::VOLATILE => Lifetime::Volatile,
            1 => Lifetime::Null,
            _ => panic!("buffer usage {usage:?} names more than one lifetime"),
        }
    }

    fn multi_buffered(self) -> bool {
        matches!(self, Lifetime::Dynamic | Lifetime::Volatile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn new(label: &str, size: u64, usage: BufferUsage) -> Self {
        BufferDescriptor {
            label: label.to_string(),
            size,
            usage,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CreateError {
    #[error("buffer {label} has size 0; only Null buffers may be empty")]
    ZeroSize { label: String },
    #[error("initial data for {label} is {got} bytes but the buffer is {size}")]
    InitialDataSize { label: String, got: u64, size: u64 },
    #[error(transparent)]
    Allocation(#[from] imp::Error),
}

struct InlineData(UnsafeCell<Box<[u8]>>);

//access is serialized by the buffer's lock state
unsafe impl Send for InlineData {}
unsafe impl Sync for InlineData {}

impl InlineData {
    fn new(len: u64) -> Self {
        InlineData(UnsafeCell::new(vec![0u8; len as usize].into_boxed_slice()))
    }

    fn ptr(&self) -> *mut u8 {
        unsafe { (*self.0.get()).as_mut_ptr() }
    }

    fn snapshot(&self) -> Vec<u8> {
        unsafe { (*self.0.get()).to_vec() }
    }

    fn into_box(self) -> Box<[u8]> {
        self.0.into_inner()
    }
}

impl std::fmt::Debug for InlineData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InlineData")
    }
}

#[derive(Debug)]
struct LockState {
    mode: LockMode,
    offset: u64,
    len: u64,
    slot: usize,
    transfer: Option<TransferBuffer>,
    //slot whose contents a partial write must carry forward
    preserve: Option<Arc<dyn NativeBuffer>>,
}

#[derive(Debug)]
struct BufferInner {
    label: String,
    size: u64,
    //size of each backing
    allocation: u64,
    usage: BufferUsage,
    lifetime: Lifetime,
    storage: StorageMode,
    ring: Mutex<BufferRing>,
    lock: Mutex<Option<LockState>>,
    inline: Option<InlineData>,
    services: Arc<Services>,
    hazards: AtomicU64,
}

impl BufferInner {
    /// Move a multi-buffered ring to its next slot, resolving any hazard on it.
    ///
    /// Returns the new slot and the previous current backing.
    fn rotate(&self) -> (usize, Option<Arc<dyn NativeBuffer>>) {
        let (index, previous, outstanding) = {
            let mut ring = self.ring.lock().unwrap();
            let previous = ring.current().cloned();
            let index = ring.advance();
            (index, previous, ring.slot(index).outstanding())
        };
        if !outstanding.is_empty() {
            self.hazards.fetch_add(1, Ordering::Relaxed);
            match self.services.config.ring_hazard {
                RingHazardPolicy::Wait => {
                    let _stall = logwise::perfwarn_begin!("buffer ring hazard wait");
                    for wait in &outstanding {
                        if !wait.wait_timeout(self.services.config.hazard_wait) {
                            logwise::warn_sync!(
                                "buffer {label} slot {index} still in use after hazard wait",
                                label = logwise::privacy::LogIt(&self.label),
                                index = index
                            );
                        }
                    }
                }
                RingHazardPolicy::Warn => {
                    logwise::warn_sync!(
                        "buffer {label} rotated onto slot {index} while the GPU may still read it",
                        label = logwise::privacy::LogIt(&self.label),
                        index = index
                    );
                }
            }
        }
        (index, previous)
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let deletion = self.services.deletion.clone();
        if let Some(state) = self.lock.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            logwise::warn_sync!(
                "buffer {label} dropped while locked",
                label = logwise::privacy::LogIt(&self.label)
            );
            if let Some(transfer) = state.transfer {
                deletion.enqueue(DeferredObject::Transfer(transfer, self.services.transfer.clone()));
            }
        }
        for slot in self.ring.get_mut().unwrap().drain() {
            let outstanding = slot.outstanding();
            deletion.enqueue_with(DeferredObject::Buffer(slot.backing), outstanding);
        }
        if let Some(inline) = self.inline.take() {
            deletion.enqueue(DeferredObject::HostMemory(inline.into_box()));
        }
    }
}

/// A multi-buffered, lockable GPU buffer.  Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    pub(crate) fn new(
        services: Arc<Services>,
        descriptor: &BufferDescriptor,
        initial: Option<&[u8]>,
    ) -> Result<Buffer, CreateError> {
        let lifetime = Lifetime::from_usage(descriptor.usage);
        if descriptor.size == 0 && lifetime != Lifetime::Null {
            return Err(CreateError::ZeroSize {
                label: descriptor.label.clone(),
            });
        }
        if let Some(data) = initial {
            if data.len() as u64 != descriptor.size {
                return Err(CreateError::InitialDataSize {
                    label: descriptor.label.clone(),
                    got: data.len() as u64,
                    size: descriptor.size,
                });
            }
        }
        let storage = storage::select(descriptor.usage, &services.capabilities);
        let inline = services.config.inline_volatile_buffers
            && lifetime == Lifetime::Volatile
            && descriptor.size < INLINE_LIMIT
            && !descriptor
                .usage
                .intersects(BufferUsage::SHADER_RESOURCE | BufferUsage::UNORDERED_ACCESS);
        let allocation = imp::align_copy(descriptor.size);
        let count = match lifetime {
            Lifetime::Null => 0,
            _ if inline => 0,
            Lifetime::Static => 1,
            Lifetime::Dynamic | Lifetime::Volatile => services.config.buffering_depth,
        };
        let mut backings = Vec::with_capacity(count);
        for i in 0..count {
            let label = if count == 1 {
                descriptor.label.clone()
            } else {
                format!("{}[{i}]", descriptor.label)
            };
            backings.push(services.device.new_buffer(allocation, storage, &label)?);
        }
        logwise::debuginternal_sync!(
            "created buffer {label} ({size} bytes, {count} backings)",
            label = logwise::privacy::LogIt(&descriptor.label),
            size = descriptor.size,
            count = count
        );
        let buffer = Buffer {
            inner: Arc::new(BufferInner {
                label: descriptor.label.clone(),
                size: descriptor.size,
                allocation,
                usage: descriptor.usage,
                lifetime,
                storage,
                ring: Mutex::new(BufferRing::new(backings)),
                lock: Mutex::new(None),
                inline: inline.then(|| InlineData::new(descriptor.size)),
                services,
                hazards: AtomicU64::new(0),
            }),
        };
        if let Some(data) = initial {
            if !data.is_empty() {
                let mut lock = buffer.lock(LockMode::Write, 0, 0);
                lock.copy_from_slice(data);
            }
        }
        Ok(buffer)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn lifetime(&self) -> Lifetime {
        self.inner.lifetime
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.inner.storage
    }

    pub fn is_inline(&self) -> bool {
        self.inner.inline.is_some()
    }

    /// Number of native backings.
    pub fn ring_len(&self) -> usize {
        self.inner.ring.lock().unwrap().len()
    }

    /// Which backing the GPU sees now.
    pub fn ring_index(&self) -> usize {
        self.inner.ring.lock().unwrap().current_index()
    }

    /// Native backing at `index`, for inspection.
    pub fn backing(&self, index: usize) -> Option<Arc<dyn NativeBuffer>> {
        let ring = self.inner.ring.lock().unwrap();
        (index < ring.len()).then(|| ring.slot(index).backing.clone())
    }

    /// Whether any command buffer that used slot `index` has not completed.
    pub fn slot_in_flight(&self, index: usize) -> bool {
        let ring = self.inner.ring.lock().unwrap();
        index < ring.len() && !ring.slot(index).outstanding().is_empty()
    }

    /// Times a rotation landed on a slot that was still in use.
    pub fn hazards(&self) -> u64 {
        self.inner.hazards.load(Ordering::Relaxed)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock.lock().unwrap().is_some()
    }

    pub(crate) fn current_backing(&self) -> Option<Arc<dyn NativeBuffer>> {
        self.inner.ring.lock().unwrap().current().cloned()
    }

    pub(crate) fn inline_snapshot(&self) -> Option<Vec<u8>> {
        self.inner.inline.as_ref().map(InlineData::snapshot)
    }

    pub(crate) fn mark_used(&self, fence: FenceWait) {
        let mut ring = self.inner.ring.lock().unwrap();
        if ring.len() > 0 {
            let index = ring.current_index();
            ring.mark_used(index, fence);
        }
    }

    /**
    Lock `size` bytes at `offset` for CPU access.  A `size` of 0 means "to the end".

    Write locks on Dynamic and Volatile buffers move to the next backing first; bytes outside a
    partial write keep their previous contents.  Read locks must start at offset 0 and return
    what the GPU last wrote, which may block until outstanding work completes.

    # Panics

    If the buffer is Null, already locked, or the range is out of bounds.
    */
    pub fn lock(&self, mode: LockMode, offset: u64, size: u64) -> BufferLock<'_> {
        let inner = &self.inner;
        assert!(inner.lifetime != Lifetime::Null, "Null buffer {} cannot be locked", inner.label);
        assert!(offset <= inner.size, "lock offset {offset} beyond {} bytes", inner.size);
        let len = if size == 0 { inner.size - offset } else { size };
        assert!(
            offset + len <= inner.size,
            "lock of {len} bytes at {offset} exceeds {}-byte buffer {}",
            inner.size,
            inner.label
        );
        if mode == LockMode::Read {
            assert_eq!(offset, 0, "read locks must start at offset 0");
        }

        let mut state = inner.lock.lock().unwrap();
        if state.is_some() {
            //release before panicking so the outstanding lock can still unlock
            drop(state);
            panic!("buffer {} is already locked", inner.label);
        }

        if let Some(data) = &inner.inline {
            *state = Some(LockState {
                mode,
                offset,
                len,
                slot: 0,
                transfer: None,
                preserve: None,
            });
            return BufferLock {
                buffer: self,
                ptr: unsafe { data.ptr().add(offset as usize) },
                len: len as usize,
                mode,
            };
        }

        let strategy = storage::strategy(inner.storage);
        let (slot, mapping) = match mode {
            LockMode::Read => {
                let slot = inner.ring.lock().unwrap().current_index();
                let mapping = (strategy.lock_read)(inner, len);
                (slot, mapping)
            }
            LockMode::Write => {
                let partial = offset != 0 || len != inner.size;
                let (slot, previous) = if inner.lifetime.multi_buffered() {
                    inner.rotate()
                } else {
                    (inner.ring.lock().unwrap().current_index(), None)
                };
                let previous = previous.filter(|_| partial);
                let mapping = (strategy.lock_write)(
                    inner,
                    storage::WriteTarget {
                        slot,
                        offset,
                        len,
                        previous,
                    },
                );
                (slot, mapping)
            }
        };
        *state = Some(LockState {
            mode,
            offset,
            len,
            slot,
            transfer: mapping.transfer,
            preserve: mapping.preserve,
        });
        BufferLock {
            buffer: self,
            ptr: mapping.ptr,
            len: len as usize,
            mode,
        }
    }

    fn unlock(&self) {
        let inner = &self.inner;
        let mut guard = inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = guard.take() else {
            panic!("unlock of buffer {} that is not locked", inner.label);
        };
        if inner.inline.is_some() {
            return;
        }
        let strategy = storage::strategy(inner.storage);
        match state.mode {
            LockMode::Read => (strategy.unlock_read)(inner, state),
            LockMode::Write => (strategy.unlock_write)(inner, state),
        }
        drop(guard);
    }

    /// Write `value` over the whole buffer through a write lock.
    pub fn fill(&self, value: u8) {
        let mut lock = self.lock(LockMode::Write, 0, 0);
        lock.fill(value);
    }

    /// Read the whole buffer back into a vector.
    pub fn read_to_vec(&self) -> Vec<u8> {
        self.lock(LockMode::Read, 0, 0).to_vec()
    }
}

/// CPU access to a locked buffer range.  Dropping unlocks.
#[derive(Debug)]
#[must_use = "dropping the lock unlocks immediately"]
pub struct BufferLock<'a> {
    buffer: &'a Buffer,
    ptr: *mut u8,
    len: usize,
    mode: LockMode,
}

impl BufferLock<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn unlock(self) {}
}

impl Deref for BufferLock<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for BufferLock<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        assert_eq!(self.mode, LockMode::Write, "read locks are immutable");
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for BufferLock<'_> {
    fn drop(&mut self) {
        self.buffer.unlock();
    }
}
