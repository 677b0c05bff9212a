// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Bindless descriptor tables.

A [`DescriptorHeap`] is a fixed-capacity table of [`DescriptorEntry`] values with a FIFO
free list, a high-water mark and a dirty range.  The [`BindlessManager`] owns one heap per
[`DescriptorKind`] and publishes dirty entries to the GPU-visible table at render pass
boundaries, using the [`crate::PublishStrategy`] chosen at startup.
*/

mod bindless;
mod heap;

pub use bindless::{BindlessManager, DescriptorUpdate, ResourceView, RESOURCE_HEAP_BIND_POINT, SAMPLER_HEAP_BIND_POINT};
pub use heap::DescriptorHeap;

use crate::imp::{NativeBuffer, NativeSampler, NativeTexture};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Textures and buffers.
    Standard,
    Sampler,
}

/// A slot in one of the bindless tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    kind: DescriptorKind,
    index: u32,
}

impl DescriptorHandle {
    pub const INVALID_INDEX: u32 = u32::MAX;

    pub const fn invalid(kind: DescriptorKind) -> Self {
        DescriptorHandle {
            kind,
            index: Self::INVALID_INDEX,
        }
    }

    pub(crate) fn new(kind: DescriptorKind, index: u32) -> Self {
        DescriptorHandle { kind, index }
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_valid(&self) -> bool {
        self.index != Self::INVALID_INDEX
    }
}

/// One table entry as the shaders see it: address, view identity and kind-specific metadata.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DescriptorEntry {
    pub gpu_va: u64,
    pub texture_view_id: u64,
    pub metadata: u64,
}

impl DescriptorEntry {
    pub const SIZE: u64 = std::mem::size_of::<DescriptorEntry>() as u64;

    pub fn texture(texture: &dyn NativeTexture, min_lod_clamp: f32) -> Self {
        DescriptorEntry {
            gpu_va: 0,
            texture_view_id: texture.resource_id(),
            metadata: min_lod_clamp.to_bits() as u64,
        }
    }

    /// A raw buffer range.  The length travels in the metadata word.
    pub fn buffer(buffer: &dyn NativeBuffer, offset: u64, len: u64) -> Self {
        DescriptorEntry {
            gpu_va: buffer.gpu_address() + offset,
            texture_view_id: 0,
            metadata: len,
        }
    }

    /// A typed view of a buffer range; the element stride occupies the top 16 bits of the metadata.
    pub fn typed_buffer(buffer: &dyn NativeBuffer, offset: u64, len: u64, stride: u16) -> Self {
        DescriptorEntry {
            gpu_va: buffer.gpu_address() + offset,
            texture_view_id: 0,
            metadata: (len & 0x0000_FFFF_FFFF_FFFF) | ((stride as u64) << 48),
        }
    }

    pub fn sampler(sampler: &dyn NativeSampler, lod_bias: f32) -> Self {
        DescriptorEntry {
            gpu_va: sampler.resource_id(),
            texture_view_id: 0,
            metadata: lod_bias.to_bits() as u64,
        }
    }

    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&self.gpu_va.to_le_bytes());
        out[8..16].copy_from_slice(&self.texture_view_id.to_le_bytes());
        out[16..24].copy_from_slice(&self.metadata.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };
        DescriptorEntry {
            gpu_va: word(0),
            texture_view_id: word(1),
            metadata: word(2),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{kind:?} descriptor heap exhausted (capacity {capacity})")]
    HeapExhausted { kind: DescriptorKind, capacity: u32 },
    #[error(transparent)]
    Native(#[from] crate::imp::Error),
}
