// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::heap::{HeapMode, Publish};
use super::{DescriptorEntry, DescriptorHandle, DescriptorHeap, DescriptorKind, Error};
use crate::buffer::Buffer;
use crate::command::CommandContext;
use crate::config::{DebugLevel, PublishStrategy};
use crate::deletion::DeferredObject;
use crate::fence::Fence;
use crate::imp::{Capabilities, Kernel, NativeBuffer, ShaderStage, StorageMode};
use crate::rhi::{Sampler, Services, Texture};
use crate::transfer::TransferBuffer;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Buffer index the resource table is bound at in every stage.
pub const RESOURCE_HEAP_BIND_POINT: u32 = 0;
/// Buffer index the sampler table is bound at in every stage.
pub const SAMPLER_HEAP_BIND_POINT: u32 = 1;

/// When a descriptor write becomes visible to the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorUpdate {
    /// Written now; published at the next render pass boundary.
    Immediate,
    /// Written once the current frame's work has retired, for slots the GPU may still be reading.
    Deferred,
}

/// What a resource descriptor points at.
#[derive(Debug, Clone, Copy)]
pub enum ResourceView<'a> {
    Texture {
        texture: &'a Texture,
        min_lod_clamp: f32,
    },
    /// A raw byte range of the buffer's current backing.
    Buffer {
        buffer: &'a Buffer,
        offset: u64,
        len: u64,
    },
    TypedBuffer {
        buffer: &'a Buffer,
        offset: u64,
        len: u64,
        stride: u16,
    },
}

fn cpu_visible_storage(capabilities: &Capabilities) -> StorageMode {
    if capabilities.unified_memory {
        StorageMode::Shared
    } else {
        StorageMode::Managed
    }
}

/**
Owns the resource and sampler heaps and gets their contents to the GPU.

Handles are reserved and written on the CPU at any time.  Writes accumulate in a dirty range
and are published by [`BindlessManager::update_descriptors_with_gpu`], which every
[`CommandContext`] created by [`crate::Rhi::command_context`] calls before starting a render
pass:

* [`PublishStrategy::CpuDirect`] writes land in the table immediately; publishing only resets the range.
* [`PublishStrategy::Copy`] blits the dirty sub-range of a CPU shadow into the private table.
* [`PublishStrategy::ComputeScatter`] dispatches a kernel that scatters (entry, index) pairs
  into the table, then makes the next render pass wait for it.  Devices without GPU events
  or compute fall back to `Copy`.

The sampler heap is always written directly.
*/
#[derive(Debug)]
pub struct BindlessManager {
    services: Arc<Services>,
    resources: Arc<DescriptorHeap>,
    samplers: Arc<DescriptorHeap>,
    strategy: PublishStrategy,
    publish_fence: Option<Fence>,
    publishes: AtomicU64,
}

impl BindlessManager {
    pub(crate) fn new(services: Arc<Services>) -> Result<Self, Error> {
        let capabilities = &services.capabilities;
        let config = &services.config;
        let strategy = match config.publish_strategy {
            PublishStrategy::ComputeScatter if !(capabilities.supports_fences && capabilities.supports_compute) => {
                logwise::warn_sync!("compute scatter publishing needs GPU events and compute; using copy");
                PublishStrategy::Copy
            }
            other => other,
        };
        let (mode, storage) = match strategy {
            PublishStrategy::CpuDirect => (HeapMode::Direct, cpu_visible_storage(capabilities)),
            PublishStrategy::Copy => (HeapMode::Shadowed, StorageMode::Private),
            PublishStrategy::ComputeScatter => (HeapMode::Scatter, StorageMode::Private),
        };
        let validate = config.debug_level >= DebugLevel::FastValidation;
        let resource_table = services
            .device
            .new_buffer(config.resource_heap_size, storage, "resource descriptor heap")?;
        let sampler_table = services.device.new_buffer(
            config.sampler_heap_size,
            cpu_visible_storage(capabilities),
            "sampler descriptor heap",
        )?;
        let publish_fence = match strategy {
            PublishStrategy::ComputeScatter => services.queue.create_fence("descriptor publish"),
            _ => None,
        };
        logwise::info_sync!(
            "bindless manager using {strategy}",
            strategy = logwise::privacy::LogIt(&strategy)
        );
        Ok(BindlessManager {
            resources: Arc::new(DescriptorHeap::new(
                DescriptorKind::Standard,
                resource_table,
                mode,
                validate,
            )),
            samplers: Arc::new(DescriptorHeap::new(
                DescriptorKind::Sampler,
                sampler_table,
                HeapMode::Direct,
                validate,
            )),
            services,
            strategy,
            publish_fence,
            publishes: AtomicU64::new(0),
        })
    }

    /// The strategy in effect, after any capability fallback.
    pub fn strategy(&self) -> PublishStrategy {
        self.strategy
    }

    pub fn heap(&self, kind: DescriptorKind) -> &Arc<DescriptorHeap> {
        match kind {
            DescriptorKind::Standard => &self.resources,
            DescriptorKind::Sampler => &self.samplers,
        }
    }

    pub fn peak(&self, kind: DescriptorKind) -> u32 {
        self.heap(kind).peak()
    }

    /// Publishes that moved data to the GPU so far.
    pub fn publishes(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }

    /// # Panics
    ///
    /// If the heap is full.
    pub fn reserve(&self, kind: DescriptorKind) -> DescriptorHandle {
        self.heap(kind).reserve()
    }

    pub fn try_reserve(&self, kind: DescriptorKind) -> Result<DescriptorHandle, Error> {
        self.heap(kind).try_reserve()
    }

    /// Return a slot at once.  Only for slots no submitted work refers to.
    pub fn free(&self, handle: DescriptorHandle) {
        self.heap(handle.kind()).free(handle);
    }

    /// Return a slot once the work submitted so far has retired.
    pub fn free_deferred(&self, handle: DescriptorHandle) {
        let heap = self.heap(handle.kind()).clone();
        self.services
            .deletion
            .enqueue(DeferredObject::Descriptor(handle, heap));
    }

    fn write(&self, handle: DescriptorHandle, entry: DescriptorEntry, update: DescriptorUpdate) {
        let heap = self.heap(handle.kind()).clone();
        match update {
            DescriptorUpdate::Immediate => heap.update(handle, entry),
            DescriptorUpdate::Deferred => self
                .services
                .deletion
                .enqueue(DeferredObject::Callback(Box::new(move || heap.update(handle, entry)))),
        }
    }

    pub fn bind_sampler(&self, handle: DescriptorHandle, sampler: &Sampler, lod_bias: f32) {
        assert_eq!(handle.kind(), DescriptorKind::Sampler, "bind_sampler on a resource handle");
        self.samplers
            .update(handle, DescriptorEntry::sampler(sampler.native().as_ref(), lod_bias));
    }

    pub fn bind_resource(&self, handle: DescriptorHandle, view: ResourceView<'_>, update: DescriptorUpdate) {
        assert_eq!(handle.kind(), DescriptorKind::Standard, "bind_resource on a sampler handle");
        let entry = match view {
            ResourceView::Texture {
                texture,
                min_lod_clamp,
            } => DescriptorEntry::texture(texture.native().as_ref(), min_lod_clamp),
            ResourceView::Buffer { buffer, offset, len } => {
                let backing = buffer_backing(buffer, offset, len);
                DescriptorEntry::buffer(backing.as_ref(), offset, len)
            }
            ResourceView::TypedBuffer {
                buffer,
                offset,
                len,
                stride,
            } => {
                let backing = buffer_backing(buffer, offset, len);
                DescriptorEntry::typed_buffer(backing.as_ref(), offset, len, stride)
            }
        };
        self.write(handle, entry, update);
    }

    pub fn bind_texture(&self, handle: DescriptorHandle, texture: &Texture, update: DescriptorUpdate) {
        self.bind_resource(
            handle,
            ResourceView::Texture {
                texture,
                min_lod_clamp: 0.0,
            },
            update,
        );
    }

    /// Move dirty entries to the GPU-visible tables, recording any needed work on `context`.
    ///
    /// # Panics
    ///
    /// Inside a render pass.
    pub fn update_descriptors_with_gpu(&self, context: &mut CommandContext) {
        assert!(
            !context.within_render_pass(),
            "descriptors published inside a render pass"
        );
        //direct heaps only need their dirty range reset
        let _ = self.samplers.take_publish();
        let Some(publish) = self.resources.take_publish() else {
            return;
        };
        match publish {
            Publish::Copy { first, bytes } => self.publish_copy(context, first, bytes),
            Publish::Scatter {
                entries,
                indices,
                count,
            } => self.publish_scatter(context, entries, indices, count),
        }
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    fn stage(&self, bytes: &[u8]) -> TransferBuffer {
        let mut transfer = match self.services.transfer.allocate(bytes.len() as u64) {
            Ok(transfer) => transfer,
            Err(e) => {
                logwise::error_sync!(
                    "descriptor publish could not stage {len} bytes: {e}",
                    len = bytes.len(),
                    e = logwise::privacy::LogIt(&e)
                );
                panic!("descriptor publish staging failed: {e}");
            }
        };
        transfer.bytes_mut().copy_from_slice(bytes);
        transfer
    }

    fn retire(&self, context: &mut CommandContext, transfer: TransferBuffer) {
        let fence = context.command_buffer_fence();
        self.services.deletion.enqueue_with(
            DeferredObject::Transfer(transfer, self.services.transfer.clone()),
            vec![fence],
        );
    }

    fn publish_copy(&self, context: &mut CommandContext, first: u32, bytes: Vec<u8>) {
        logwise::trace_sync!(
            "publishing {n} descriptor bytes from index {first}",
            n = bytes.len(),
            first = first
        );
        let transfer = self.stage(&bytes);
        context.copy_native(
            transfer.native(),
            0,
            self.resources.table(),
            first as u64 * DescriptorEntry::SIZE,
            bytes.len() as u64,
        );
        self.retire(context, transfer);
    }

    fn publish_scatter(&self, context: &mut CommandContext, entries: Vec<u8>, indices: Vec<u8>, count: u32) {
        logwise::trace_sync!("scattering {count} descriptors", count = count);
        let entries = self.stage(&entries);
        let indices = self.stage(&indices);
        context.dispatch(Kernel::ScatterDescriptors {
            entries: entries.native().clone(),
            indices: indices.native().clone(),
            table: self.resources.table().clone(),
            count,
            entry_size: DescriptorEntry::SIZE as u32,
        });
        if let Some(fence) = &self.publish_fence {
            let published = fence.next_value();
            context.signal_fence(&published);
            context.wait_before_next_render_pass(published);
        }
        self.retire(context, entries);
        self.retire(context, indices);
    }

    /// Bind both tables for `stages`, sized to their current high-water marks.
    pub fn bind_heaps(&self, context: &mut CommandContext, stages: &[ShaderStage]) {
        for &stage in stages {
            for (heap, index) in [
                (&self.resources, RESOURCE_HEAP_BIND_POINT),
                (&self.samplers, SAMPLER_HEAP_BIND_POINT),
            ] {
                let peak = heap.peak();
                if peak > 0 {
                    context.bind_heap(stage, index, heap.table(), peak as u64 * DescriptorEntry::SIZE);
                }
            }
        }
    }

    /// Read the GPU-visible table back, up to the high-water mark.  Blocks on the GPU for private tables.
    pub fn read_back(&self, kind: DescriptorKind) -> Result<Vec<DescriptorEntry>, Error> {
        let heap = self.heap(kind);
        let count = heap.peak();
        if let Some(entries) = heap.read_direct(count) {
            return Ok(entries);
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let len = count as u64 * DescriptorEntry::SIZE;
        let transfer = self.services.transfer.allocate(len)?;
        let mut context = CommandContext::new(self.services.clone(), None, "descriptor read-back");
        context.copy_native(heap.table(), 0, transfer.native(), 0, len);
        if let Some(completion) = context.submit() {
            let _stall = logwise::perfwarn_begin!("descriptor read_back");
            completion.wait();
        }
        let entries = transfer
            .bytes()
            .chunks_exact(DescriptorEntry::SIZE as usize)
            .map(DescriptorEntry::from_bytes)
            .collect();
        self.services.transfer.recycle(transfer);
        Ok(entries)
    }
}

fn buffer_backing(buffer: &Buffer, offset: u64, len: u64) -> Arc<dyn NativeBuffer> {
    assert!(
        offset + len <= buffer.size(),
        "descriptor range {offset}+{len} exceeds buffer {}",
        buffer.label()
    );
    match buffer.current_backing() {
        Some(backing) => backing,
        None => panic!("buffer {} has no GPU backing to describe", buffer.label()),
    }
}
