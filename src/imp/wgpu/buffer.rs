// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use crate::imp::{NativeBuffer, NativeSampler, NativeTexture, StorageMode};
use std::any::Any;
use std::cell::UnsafeCell;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Mutex;

/// Usage every backing gets; the layers above decide what a buffer is for.
pub(super) const BUFFER_USAGES: wgpu::BufferUsages = wgpu::BufferUsages::COPY_SRC
    .union(wgpu::BufferUsages::COPY_DST)
    .union(wgpu::BufferUsages::STORAGE)
    .union(wgpu::BufferUsages::UNIFORM)
    .union(wgpu::BufferUsages::VERTEX)
    .union(wgpu::BufferUsages::INDEX);

struct Shadow(UnsafeCell<Box<[u8]>>);

//CPU access is serialized by the buffer locks above this layer
unsafe impl Send for Shadow {}
unsafe impl Sync for Shadow {}

/**
A wgpu buffer, plus a CPU shadow for shared and managed storage.

wgpu buffers cannot stay mapped while the GPU uses them, so CPU-visible storage is emulated:
the shadow is uploaded before submissions that read the buffer, and read back after
submissions that write it (shared) or synchronize it (managed).
*/
pub struct WgpuBuffer {
    id: u64,
    label: String,
    len: u64,
    mode: StorageMode,
    pub(super) buffer: wgpu::Buffer,
    shadow: Option<Shadow>,
    //managed: CPU bytes not yet uploaded
    dirty: Mutex<Option<Range<u64>>>,
}

impl std::fmt::Debug for WgpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("len", &self.len)
            .field("mode", &self.mode)
            .finish()
    }
}

impl WgpuBuffer {
    pub(super) fn new(device: &wgpu::Device, id: u64, len: u64, mode: StorageMode, label: &str) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: len,
            usage: BUFFER_USAGES,
            mapped_at_creation: false,
        });
        let shadow = match mode {
            StorageMode::Private => None,
            StorageMode::Shared | StorageMode::Managed => {
                Some(Shadow(UnsafeCell::new(vec![0u8; len as usize].into_boxed_slice())))
            }
        };
        WgpuBuffer {
            id,
            label: label.to_string(),
            len,
            mode,
            buffer,
            shadow,
            dirty: Mutex::new(None),
        }
    }

    fn shadow_ptr(&self) -> Option<*mut u8> {
        self.shadow
            .as_ref()
            .map(|s| unsafe { (*s.0.get()).as_mut_ptr() })
    }

    /// Bytes of the CPU shadow the GPU copy needs before the next submission.
    pub(super) fn take_upload(&self) -> Option<(u64, &[u8])> {
        let ptr = self.shadow_ptr()?;
        let range = match self.mode {
            StorageMode::Shared => 0..self.len,
            StorageMode::Managed => self.dirty.lock().unwrap().take()?,
            StorageMode::Private => return None,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(ptr.add(range.start as usize), (range.end - range.start) as usize)
        };
        Some((range.start, bytes))
    }

    /// Overwrite the shadow with bytes read back from the GPU.
    pub(super) fn store_readback(&self, bytes: &[u8]) {
        if let Some(ptr) = self.shadow_ptr() {
            let len = bytes.len().min(self.len as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, len);
            }
        }
    }
}

impl NativeBuffer for WgpuBuffer {
    fn len(&self) -> u64 {
        self.len
    }

    fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    fn contents(&self) -> Option<NonNull<u8>> {
        self.shadow_ptr().and_then(NonNull::new)
    }

    fn did_modify_range(&self, range: Range<u64>) {
        if self.mode != StorageMode::Managed {
            return;
        }
        let mut dirty = self.dirty.lock().unwrap();
        *dirty = Some(match dirty.take() {
            Some(d) => d.start.min(range.start)..d.end.max(range.end),
            None => range,
        });
    }

    fn gpu_address(&self) -> u64 {
        //wgpu exposes no addresses; the id stands in
        self.id << 32
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct WgpuTexture {
    id: u64,
    label: String,
    #[allow(dead_code)]
    pub(super) texture: wgpu::Texture,
}

impl WgpuTexture {
    pub(super) fn new(device: &wgpu::Device, id: u64, label: &str, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        WgpuTexture {
            id,
            label: label.to_string(),
            texture,
        }
    }
}

impl NativeTexture for WgpuTexture {
    fn resource_id(&self) -> u64 {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug)]
pub struct WgpuSampler {
    id: u64,
    label: String,
    #[allow(dead_code)]
    pub(super) sampler: wgpu::Sampler,
}

impl WgpuSampler {
    pub(super) fn new(device: &wgpu::Device, id: u64, label: &str, linear: bool, repeat: bool) -> Self {
        let filter = if linear {
            wgpu::FilterMode::Linear
        } else {
            wgpu::FilterMode::Nearest
        };
        let address = if repeat {
            wgpu::AddressMode::Repeat
        } else {
            wgpu::AddressMode::ClampToEdge
        };
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(label),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            ..Default::default()
        });
        WgpuSampler {
            id,
            label: label.to_string(),
            sampler,
        }
    }
}

impl NativeSampler for WgpuSampler {
    fn resource_id(&self) -> u64 {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }
}
