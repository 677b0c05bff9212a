// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Per-storage-mode lock behavior.

Each storage mode gets a table of functions chosen once per lock, rather than branching on the
mode at every step:

* Shared memory is written and read in place.
* Managed memory is written in place and flushed with `did_modify_range`; reads first
  synchronize the GPU copy back and wait.
* Private memory is reached through transfer buffers: writes are staged on the upload context,
  reads copy into a transfer buffer and wait.
*/

use super::{BufferInner, BufferUsage, Lifetime, LockState};
use crate::command::CommandContext;
use crate::deletion::DeferredObject;
use crate::imp::{self, Capabilities, NativeBuffer, StorageMode};
use crate::transfer::TransferBuffer;
use std::sync::Arc;

pub(super) struct WriteTarget {
    pub(super) slot: usize,
    pub(super) offset: u64,
    pub(super) len: u64,
    pub(super) previous: Option<Arc<dyn NativeBuffer>>,
}

pub(super) struct Mapping {
    pub(super) ptr: *mut u8,
    pub(super) transfer: Option<TransferBuffer>,
    pub(super) preserve: Option<Arc<dyn NativeBuffer>>,
}

pub(super) struct StorageStrategy {
    pub(super) lock_read: fn(&Arc<BufferInner>, u64) -> Mapping,
    pub(super) lock_write: fn(&Arc<BufferInner>, WriteTarget) -> Mapping,
    pub(super) unlock_read: fn(&Arc<BufferInner>, LockState),
    pub(super) unlock_write: fn(&Arc<BufferInner>, LockState),
}

static SHARED: StorageStrategy = StorageStrategy {
    lock_read: shared_lock_read,
    lock_write: shared_lock_write,
    unlock_read: nothing,
    unlock_write: nothing,
};

static MANAGED: StorageStrategy = StorageStrategy {
    lock_read: managed_lock_read,
    lock_write: managed_lock_write,
    unlock_read: nothing,
    unlock_write: managed_unlock_write,
};

static PRIVATE: StorageStrategy = StorageStrategy {
    lock_read: private_lock_read,
    lock_write: private_lock_write,
    unlock_read: private_unlock_read,
    unlock_write: private_unlock_write,
};

pub(super) fn strategy(mode: StorageMode) -> &'static StorageStrategy {
    match mode {
        StorageMode::Shared => &SHARED,
        StorageMode::Managed => &MANAGED,
        StorageMode::Private => &PRIVATE,
    }
}

/// Pick a storage mode for a new buffer.
pub(crate) fn select(usage: BufferUsage, capabilities: &Capabilities) -> StorageMode {
    if usage.contains(BufferUsage::KEEP_CPU_ACCESSIBLE) {
        if capabilities.unified_memory {
            return StorageMode::Shared;
        }
        return match capabilities.default_storage_mode {
            StorageMode::Private => StorageMode::Managed,
            other => other,
        };
    }
    let shader_visible = usage.intersects(BufferUsage::SHADER_RESOURCE | BufferUsage::UNORDERED_ACCESS);
    if !capabilities.unified_memory
        && (capabilities.efficient_buffer_blits || (capabilities.supports_argument_buffers && shader_visible))
    {
        return StorageMode::Private;
    }
    capabilities.default_storage_mode
}

fn cpu_ptr(backing: &Arc<dyn NativeBuffer>) -> *mut u8 {
    match backing.contents() {
        Some(ptr) => ptr.as_ptr(),
        None => panic!("backing {} has no CPU mapping", backing.label()),
    }
}

fn slot_backing(inner: &BufferInner, slot: usize) -> Arc<dyn NativeBuffer> {
    inner.ring.lock().unwrap().slot(slot).backing.clone()
}

fn current_backing(inner: &BufferInner) -> Arc<dyn NativeBuffer> {
    match inner.ring.lock().unwrap().current() {
        Some(backing) => backing.clone(),
        None => panic!("buffer {} has no backing", inner.label),
    }
}

fn nothing(_inner: &Arc<BufferInner>, _state: LockState) {}

fn copy_contents(from: &Arc<dyn NativeBuffer>, to: &Arc<dyn NativeBuffer>, len: u64) {
    unsafe {
        std::ptr::copy_nonoverlapping(cpu_ptr(from), cpu_ptr(to), len as usize);
    }
}

fn shared_lock_read(inner: &Arc<BufferInner>, _len: u64) -> Mapping {
    Mapping {
        ptr: cpu_ptr(&current_backing(inner)),
        transfer: None,
        preserve: None,
    }
}

fn shared_lock_write(inner: &Arc<BufferInner>, target: WriteTarget) -> Mapping {
    let backing = slot_backing(inner, target.slot);
    if let Some(previous) = &target.previous {
        copy_contents(previous, &backing, inner.size);
    }
    Mapping {
        ptr: unsafe { cpu_ptr(&backing).add(target.offset as usize) },
        transfer: None,
        preserve: None,
    }
}

/// Submit `record`'s work on a throwaway context and block until it completes.
fn run_and_wait(inner: &Arc<BufferInner>, label: &str, record: impl FnOnce(&mut CommandContext)) {
    let services = &inner.services;
    let mut context = CommandContext::new(services.clone(), None, label);
    record(&mut context);
    let _stall = logwise::perfwarn_begin!("buffer read lock");
    if let Some(completion) = context.submit() {
        completion.wait();
    }
}

fn managed_lock_read(inner: &Arc<BufferInner>, _len: u64) -> Mapping {
    let backing = current_backing(inner);
    run_and_wait(inner, "managed read-back", |context| {
        context.synchronize_native(&backing);
    });
    Mapping {
        ptr: cpu_ptr(&backing),
        transfer: None,
        preserve: None,
    }
}

fn managed_lock_write(inner: &Arc<BufferInner>, target: WriteTarget) -> Mapping {
    let backing = slot_backing(inner, target.slot);
    if let Some(previous) = &target.previous {
        copy_contents(previous, &backing, inner.size);
        backing.did_modify_range(0..inner.size);
    }
    Mapping {
        ptr: unsafe { cpu_ptr(&backing).add(target.offset as usize) },
        transfer: None,
        preserve: None,
    }
}

fn managed_unlock_write(inner: &Arc<BufferInner>, state: LockState) {
    let backing = slot_backing(inner, state.slot);
    backing.did_modify_range(state.offset..state.offset + state.len);
}

fn allocate_transfer(inner: &BufferInner, len: u64) -> TransferBuffer {
    match inner.services.transfer.allocate(len) {
        Ok(transfer) => transfer,
        Err(e) => {
            logwise::error_sync!(
                "no transfer buffer for {label}: {e}",
                label = logwise::privacy::LogIt(&inner.label),
                e = logwise::privacy::LogIt(&e)
            );
            panic!("transfer buffer allocation failed for {}: {e}", inner.label);
        }
    }
}

fn private_lock_read(inner: &Arc<BufferInner>, len: u64) -> Mapping {
    let services = &inner.services;
    services.upload.flush(services);
    let transfer = allocate_transfer(inner, len);
    let backing = current_backing(inner);
    run_and_wait(inner, "private read-back", |context| {
        context.copy_native(&backing, 0, transfer.native(), 0, imp::align_copy(len));
    });
    Mapping {
        ptr: transfer.as_ptr(),
        transfer: Some(transfer),
        preserve: None,
    }
}

fn private_unlock_read(inner: &Arc<BufferInner>, state: LockState) {
    if let Some(transfer) = state.transfer {
        inner.services.transfer.recycle(transfer);
    }
}

/// A Static buffer the GPU may still be reading gets a fresh backing; the old one is retired
/// behind its outstanding uses.
fn orphan(inner: &BufferInner, slot: usize) -> Option<Arc<dyn NativeBuffer>> {
    let mut ring = inner.ring.lock().unwrap();
    let outstanding = ring.slot(slot).outstanding();
    if outstanding.is_empty() {
        return None;
    }
    let fresh = match inner
        .services
        .device
        .new_buffer(inner.allocation, StorageMode::Private, &inner.label)
    {
        Ok(fresh) => fresh,
        Err(e) => {
            logwise::warn_sync!(
                "could not orphan {label}, writing behind in-flight work: {e}",
                label = logwise::privacy::LogIt(&inner.label),
                e = logwise::privacy::LogIt(&e)
            );
            return None;
        }
    };
    let old = ring.replace(slot, fresh);
    let previous = old.backing.clone();
    inner
        .services
        .deletion
        .enqueue_with(DeferredObject::Buffer(old.backing), outstanding);
    Some(previous)
}

fn private_lock_write(inner: &Arc<BufferInner>, target: WriteTarget) -> Mapping {
    let partial = target.offset != 0 || target.len != inner.size;
    assert!(
        target.offset % 4 == 0 && (target.len % 4 == 0 || target.offset + target.len == inner.size),
        "partial locks of private buffer {} must be 4-byte aligned",
        inner.label
    );
    let mut previous = target.previous;
    if inner.lifetime == Lifetime::Static {
        let orphaned = orphan(inner, target.slot);
        if partial {
            previous = orphaned;
        }
    }
    let transfer = allocate_transfer(inner, target.len);
    Mapping {
        ptr: transfer.as_ptr(),
        transfer: Some(transfer),
        preserve: previous,
    }
}

fn private_unlock_write(inner: &Arc<BufferInner>, state: LockState) {
    let Some(transfer) = state.transfer else {
        return;
    };
    let services = &inner.services;
    let dst = slot_backing(inner, state.slot);
    let weak = Arc::downgrade(inner);
    let allocator = services.transfer.clone();
    let deletion = services.deletion.clone();
    let preserve = state.preserve;
    let size = inner.allocation;
    let copy_len = imp::align_copy(state.len).min(size - state.offset);
    let (slot, offset) = (state.slot, state.offset);
    services.upload.enqueue(Box::new(move |context| {
        if let Some(previous) = &preserve {
            context.copy_native(previous, 0, &dst, 0, size);
        }
        context.copy_native(transfer.native(), 0, &dst, offset, copy_len);
        let fence = context.command_buffer_fence();
        if let Some(inner) = weak.upgrade() {
            let mut ring = inner.ring.lock().unwrap();
            if slot < ring.len() && Arc::ptr_eq(&ring.slot(slot).backing, &dst) {
                ring.mark_used(slot, fence.clone());
            }
        }
        deletion.enqueue_with(DeferredObject::Transfer(transfer, allocator), vec![fence]);
    }));
}
