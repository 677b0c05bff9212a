// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Fence-gated deferred deletion.

"This object is logically dead" and "the GPU has stopped reading it" happen at different
times.  Objects go into the queue when the first is true and are destroyed by the reaper
once every fence they were recorded with has signaled.

The queue is organized by frame.  [`DeferredDeletionQueue::end_frame`] closes the current
frame's list into a record along with the completion fences of every command buffer that
has been committed and not yet completed, including those from earlier frames, then drains
records old enough to be worth polling.  Records are reaped oldest first; the first record
that is not ready stops the drain.
*/

use crate::command::CommittedCommandBuffer;
use crate::config::Config;
use crate::descriptor::{DescriptorHandle, DescriptorHeap};
use crate::fence::{Fence, FenceWait};
use crate::imp::{NativeBuffer, NativeSampler, NativeTexture};
use crate::transfer::{TransferAllocator, TransferBuffer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Something whose destruction must wait for the GPU.
pub enum DeferredObject {
    Buffer(Arc<dyn NativeBuffer>),
    Texture(Arc<dyn NativeTexture>),
    Sampler(Arc<dyn NativeSampler>),
    /// Returned to its allocator rather than freed.
    Transfer(TransferBuffer, Arc<TransferAllocator>),
    /// Index goes back on the heap's free list.
    Descriptor(DescriptorHandle, Arc<DescriptorHeap>),
    Fence(Fence),
    CommandBuffer(CommittedCommandBuffer),
    /// CPU memory the GPU may still be reading through `set_bytes` style bindings.
    HostMemory(Box<[u8]>),
    Callback(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for DeferredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferredObject::Buffer(b) => write!(f, "Buffer({})", b.label()),
            DeferredObject::Texture(t) => write!(f, "Texture({})", t.label()),
            DeferredObject::Sampler(s) => write!(f, "Sampler({})", s.label()),
            DeferredObject::Transfer(t, _) => write!(f, "Transfer({} bytes)", t.len()),
            DeferredObject::Descriptor(h, _) => write!(f, "Descriptor({h:?})"),
            DeferredObject::Fence(fence) => write!(f, "Fence({})", fence.label()),
            DeferredObject::CommandBuffer(c) => write!(f, "CommandBuffer({})", c.label()),
            DeferredObject::HostMemory(m) => write!(f, "HostMemory({} bytes)", m.len()),
            DeferredObject::Callback(_) => write!(f, "Callback"),
        }
    }
}

impl DeferredObject {
    fn destroy(self) {
        match self {
            DeferredObject::Transfer(buffer, allocator) => allocator.recycle(buffer),
            DeferredObject::Descriptor(handle, heap) => heap.free(handle),
            DeferredObject::Callback(callback) => callback(),
            //everything else is released by dropping the last reference
            other => drop(other),
        }
    }
}

#[derive(Debug)]
struct Entry {
    object: DeferredObject,
    fences: Vec<FenceWait>,
}

#[derive(Debug)]
struct Record {
    frame: u64,
    frame_fences: Vec<FenceWait>,
    entries: VecDeque<Entry>,
}

#[derive(Debug)]
pub struct DeferredDeletionQueue {
    current: Mutex<Vec<Entry>>,
    //completion fences of command buffers committed this frame
    fences: Mutex<Vec<FenceWait>>,
    //committed completion fences not yet seen signaled
    outstanding: Mutex<Vec<FenceWait>>,
    records: Mutex<VecDeque<Record>>,
    frame: AtomicU64,
    frames_in_flight: u64,
    reaper_wait: Duration,
    destroyed: AtomicU64,
}

impl DeferredDeletionQueue {
    pub fn new(frames_in_flight: u64, reaper_wait: Duration) -> Self {
        DeferredDeletionQueue {
            current: Mutex::new(Vec::new()),
            fences: Mutex::new(Vec::new()),
            outstanding: Mutex::new(Vec::new()),
            records: Mutex::new(VecDeque::new()),
            frame: AtomicU64::new(0),
            frames_in_flight,
            reaper_wait,
            destroyed: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.frames_in_flight, config.reaper_wait)
    }

    /// Defer `object` until every command buffer committed before its frame closes has completed.
    pub fn enqueue(&self, object: DeferredObject) {
        self.enqueue_with(object, Vec::new());
    }

    /// Defer `object` until `fences` (and its frame's fences) have signaled.
    pub fn enqueue_with(&self, object: DeferredObject, fences: Vec<FenceWait>) {
        logwise::trace_sync!("deferring {object}", object = logwise::privacy::LogIt(&object));
        self.current.lock().unwrap().push(Entry { object, fences });
    }

    /// Associate a committed command buffer's completion with the current frame.
    pub fn add_fence(&self, fence: FenceWait) {
        self.fences.lock().unwrap().push(fence);
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Objects not yet destroyed.
    pub fn pending(&self) -> usize {
        let current = self.current.lock().unwrap().len();
        let recorded: usize = self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.entries.len())
            .sum();
        current + recorded
    }

    /// Objects destroyed so far.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    fn close_frame(&self) {
        let entries: VecDeque<Entry> = std::mem::take(&mut *self.current.lock().unwrap()).into();
        let frame_fences = {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding.extend(std::mem::take(&mut *self.fences.lock().unwrap()));
            outstanding.retain(|f| !f.is_signaled());
            outstanding.clone()
        };
        let frame = self.frame.fetch_add(1, Ordering::AcqRel);
        if entries.is_empty() {
            return;
        }
        self.records.lock().unwrap().push_back(Record {
            frame,
            frame_fences,
            entries,
        });
    }

    /// Close the current frame and reap whatever is ready.  Returns how many objects were destroyed.
    pub fn end_frame(&self) -> usize {
        self.close_frame();
        self.drain()
    }

    fn ready(&self, fence: &FenceWait) -> bool {
        if self.reaper_wait.is_zero() {
            fence.is_signaled()
        } else {
            fence.wait_timeout(self.reaper_wait)
        }
    }

    /// Destroy every object in sufficiently old records whose fences have signaled.
    ///
    /// Objects that are not ready stay queued in order; a timeout only means "not yet".
    pub fn drain(&self) -> usize {
        self.drain_records(true)
    }

    /// Close the current frame and destroy everything whose fences have already signaled,
    /// regardless of how many frames ago it was queued.  Never blocks.
    pub fn reap_signaled(&self) -> usize {
        self.close_frame();
        self.drain_records(false)
    }

    fn drain_records(&self, respect_age: bool) -> usize {
        let now = self.frame();
        let mut doomed = Vec::new();
        {
            let mut records = self.records.lock().unwrap();
            for record in records.iter_mut() {
                if respect_age && now - record.frame <= self.frames_in_flight {
                    break;
                }
                if !record.frame_fences.iter().all(|f| self.ready(f)) {
                    let frame = record.frame;
                    logwise::trace_sync!("deletion record for frame {frame} not ready", frame = frame);
                    break;
                }
                record.frame_fences.clear();
                let mut waiting = VecDeque::new();
                for entry in record.entries.drain(..) {
                    if entry.fences.iter().all(|f| self.ready(f)) {
                        doomed.push(entry.object);
                    } else {
                        waiting.push_back(entry);
                    }
                }
                record.entries = waiting;
            }
            records.retain(|r| !r.entries.is_empty());
        }
        let count = doomed.len();
        //destructors may take other locks (heaps, pools), so run them unlocked
        for object in doomed {
            object.destroy();
        }
        self.destroyed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Shutdown path: wait for every fence and destroy everything.
    pub fn flush(&self) -> usize {
        self.close_frame();
        let records = std::mem::take(&mut *self.records.lock().unwrap());
        let mut count = 0;
        for record in records {
            for fence in &record.frame_fences {
                fence.wait();
            }
            for entry in record.entries {
                for fence in &entry.fences {
                    fence.wait();
                }
                entry.object.destroy();
                count += 1;
            }
        }
        self.destroyed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }
}

impl Drop for DeferredDeletionQueue {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 {
            //no blocking here; owners that need an orderly teardown call flush() first
            logwise::warn_sync!(
                "deletion queue dropped with {pending} objects pending",
                pending = pending
            );
        }
    }
}
