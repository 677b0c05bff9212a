// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Command recording and submission.

* [`CommandQueue`] creates [`CommandBuffer`]s and commits them, applying the configured
  reference and error-reporting policy.
* [`EncoderMultiplexer`] keeps at most one render/compute/blit encoder open per command
  buffer and hands a fence token from each closed encoder to the next one opened.
* [`CommandContext`] is the per-thread facade that drives both and coordinates descriptor
  publishing and buffer usage tracking.
* [`UploadContext`] collects staged buffer copies and submits them ahead of graphics work.
*/

mod buffer;
mod context;
mod encoder;
mod queue;
mod upload;

pub use buffer::{CommandBuffer, CommittedCommandBuffer};
pub use context::{CommandContext, RenderPassDescriptor};
pub use encoder::{EncoderMultiplexer, EncoderState};
pub use queue::{CaptureHook, CommandQueue};
pub use upload::{UploadContext, UploadFn};
