/*! buffers_and_fences is the command-and-resource layer that sits between a renderer's
draw/dispatch calls and an explicit GPU API.

The CPU records work eagerly, the GPU consumes it late, and resource identities (a buffer,
a descriptor slot) still have to look stable and immediately usable to callers.  This crate
reconciles those forces with a small number of cooperating pieces:

| Piece                    | Type                                        | Job                                                        |
|--------------------------|---------------------------------------------|------------------------------------------------------------|
| Fences                   | [`fence::Fence`], [`fence::FenceWait`]      | monotonic "has signal N happened?" primitive               |
| Command queue            | [`command::CommandQueue`]                   | command buffer creation, commit policy, capture hook       |
| Encoder multiplexer      | [`command::EncoderMultiplexer`]             | one of render/compute/blit open at a time, fenced handoff  |
| Command context          | [`command::CommandContext`]                 | per-thread facade over the above                           |
| Buffers                  | [`buffer::Buffer`]                          | ring-buffered lockable GPU buffers with staged transfer    |
| Bindless descriptors     | [`descriptor::BindlessManager`]             | fixed-capacity descriptor heaps with dirty-range publish   |
| Deferred deletion        | [`deletion::DeferredDeletionQueue`]         | frees objects only after their fences signal               |

Everything hangs off an explicit [`Rhi`] object.  There is no ambient global state, so tests
construct as many isolated instances as they like.

# Backends

The native API is reached through the object-safe traits in [`imp`].  The software backend
([`imp::soft`]) is always available and is what the test suite runs against; it can run its
GPU timeline manually (deterministic) or on a worker thread.  The `backend_wgpu` feature adds
a [wgpu](https://wgpu.rs) backend.

# Example

```
use buffers_and_fences::{Rhi, Config};
use buffers_and_fences::buffer::{BufferDescriptor, BufferUsage, LockMode};
use buffers_and_fences::imp::soft::SoftDevice;

let device = SoftDevice::manual();
let rhi = Rhi::new(device.clone(), Config::default()).unwrap();
let buffer = rhi
    .create_buffer(&BufferDescriptor::new("constants", 256, BufferUsage::DYNAMIC), None)
    .unwrap();
{
    let mut lock = buffer.lock(LockMode::Write, 0, 0);
    lock.fill(7);
}
rhi.submit_command_lists(Vec::new());
rhi.end_frame();
let read = buffer.lock(LockMode::Read, 0, 0);
assert!(read.iter().all(|b| *b == 7));
```
*/

logwise::declare_logging_domain!();

pub mod buffer;
pub mod command;
pub mod config;
pub mod deletion;
pub mod descriptor;
pub mod fence;
pub mod imp;
mod multibuffer;
mod rhi;
mod submission;
mod transfer;

pub use config::{Config, DebugLevel, PublishStrategy, RingHazardPolicy};
pub use rhi::{CreateError, Rhi, Sampler, SamplerDescriptor, Texture, TextureDescriptor};
