// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use crate::imp::{EncoderFence, EncoderKind, Kernel, NativeBuffer, NativeCommandBuffer, NativeEvent, ShaderStage};
use std::any::Any;
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug)]
pub(super) enum Command {
    Copy {
        src: Arc<dyn NativeBuffer>,
        src_offset: u64,
        dst: Arc<dyn NativeBuffer>,
        dst_offset: u64,
        len: u64,
    },
    Fill {
        dst: Arc<dyn NativeBuffer>,
        range: Range<u64>,
        value: u8,
    },
    Synchronize(Arc<dyn NativeBuffer>),
    /// A binding; only matters for getting CPU shadows uploaded.
    Read(Arc<dyn NativeBuffer>),
    Dispatch(Kernel),
    Signal {
        event: Arc<dyn NativeEvent>,
        value: u64,
    },
}

/**
Records commands for a later wgpu submission.

wgpu encoders cannot outlive the borrow of their passes, so recording builds a command list
and the device encodes it in one go at commit.  Encoder boundaries become pass boundaries,
which wgpu already orders, so encoder fences are tokens only.
*/
#[derive(Debug)]
pub struct WgpuCommandBuffer {
    label: String,
    pub(super) commands: Vec<Command>,
    open: Option<EncoderKind>,
    encoders: u64,
    supports_compute: bool,
}

impl WgpuCommandBuffer {
    pub(super) fn new(label: &str, supports_compute: bool) -> Self {
        WgpuCommandBuffer {
            label: label.to_string(),
            commands: Vec::new(),
            open: None,
            encoders: 0,
            supports_compute,
        }
    }

    pub(super) fn from_native(native: Box<dyn NativeCommandBuffer>) -> Box<WgpuCommandBuffer> {
        match native.into_any().downcast::<WgpuCommandBuffer>() {
            Ok(command_buffer) => {
                assert!(
                    command_buffer.open.is_none(),
                    "command buffer {} committed with an open encoder",
                    command_buffer.label
                );
                command_buffer
            }
            Err(_) => panic!("command buffer from another backend committed to wgpu"),
        }
    }

    fn require(&self, kind: EncoderKind, what: &str) {
        assert_eq!(self.open, Some(kind), "{what} needs an open {kind:?} encoder");
    }

    fn require_any(&self, what: &str) {
        assert!(self.open.is_some(), "{what} needs an open encoder");
    }

    fn require_none(&self, what: &str) {
        assert!(self.open.is_none(), "{what} is not allowed inside an encoder");
    }
}

impl NativeCommandBuffer for WgpuCommandBuffer {
    fn label(&self) -> &str {
        &self.label
    }

    fn begin_encoder(&mut self, kind: EncoderKind, _label: &str) {
        assert!(self.open.is_none(), "begin_encoder with {:?} still open", self.open);
        self.open = Some(kind);
    }

    fn end_encoder(&mut self) -> Option<EncoderFence> {
        assert!(self.open.take().is_some(), "end_encoder with no open encoder");
        self.encoders += 1;
        Some(EncoderFence(self.encoders))
    }

    fn wait_for_encoder_fence(&mut self, fence: EncoderFence) {
        assert!(fence.0 <= self.encoders, "wait on an encoder fence that was never produced");
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: &Arc<dyn NativeBuffer>,
        src_offset: u64,
        dst: &Arc<dyn NativeBuffer>,
        dst_offset: u64,
        len: u64,
    ) {
        self.require(EncoderKind::Blit, "copy_buffer_to_buffer");
        assert!(src_offset + len <= src.len(), "copy reads past {}", src.label());
        assert!(dst_offset + len <= dst.len(), "copy writes past {}", dst.label());
        assert!(
            src_offset % wgpu::COPY_BUFFER_ALIGNMENT == 0
                && dst_offset % wgpu::COPY_BUFFER_ALIGNMENT == 0
                && len % wgpu::COPY_BUFFER_ALIGNMENT == 0,
            "wgpu copies must be {}-byte aligned",
            wgpu::COPY_BUFFER_ALIGNMENT
        );
        self.commands.push(Command::Copy {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            len,
        });
    }

    fn fill_buffer(&mut self, dst: &Arc<dyn NativeBuffer>, range: Range<u64>, value: u8) {
        self.require(EncoderKind::Blit, "fill_buffer");
        assert!(range.end <= dst.len(), "fill writes past {}", dst.label());
        assert!(
            range.start % wgpu::COPY_BUFFER_ALIGNMENT == 0 && range.end % wgpu::COPY_BUFFER_ALIGNMENT == 0,
            "wgpu fills must be {}-byte aligned",
            wgpu::COPY_BUFFER_ALIGNMENT
        );
        self.commands.push(Command::Fill {
            dst: dst.clone(),
            range,
            value,
        });
    }

    fn synchronize_resource(&mut self, buffer: &Arc<dyn NativeBuffer>) {
        self.require(EncoderKind::Blit, "synchronize_resource");
        self.commands.push(Command::Synchronize(buffer.clone()));
    }

    fn set_buffer(&mut self, _stage: ShaderStage, _index: u32, buffer: &Arc<dyn NativeBuffer>, offset: u64, len: u64) {
        self.require_any("set_buffer");
        assert!(offset + len <= buffer.len(), "binding past the end of {}", buffer.label());
        self.commands.push(Command::Read(buffer.clone()));
    }

    fn set_bytes(&mut self, _stage: ShaderStage, _index: u32, _bytes: &[u8]) {
        self.require_any("set_bytes");
    }

    fn dispatch(&mut self, kernel: Kernel) {
        self.require(EncoderKind::Compute, "dispatch");
        assert!(self.supports_compute, "dispatch on a device without compute");
        self.commands.push(Command::Dispatch(kernel));
    }

    fn signal_event(&mut self, event: &Arc<dyn NativeEvent>, value: u64) {
        self.require_none("signal_event");
        self.commands.push(Command::Signal {
            event: event.clone(),
            value,
        });
    }

    fn wait_for_event(&mut self, _event: &Arc<dyn NativeEvent>, _value: u64) {
        //one queue executes submissions in order, so events signaled by earlier
        //submissions are already satisfied
        self.require_none("wait_for_event");
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
