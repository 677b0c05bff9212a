// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::{Inner, JournalEntry, SoftBuffer, SoftEvent};
use crate::imp::{EncoderFence, EncoderKind, Kernel, NativeBuffer, NativeCommandBuffer, NativeEvent, ShaderStage};
use std::any::Any;
use std::ops::Range;
use std::sync::Arc;

enum Command {
    BeginEncoder(EncoderKind),
    EndEncoder(EncoderKind, Option<EncoderFence>),
    WaitEncoderFence(EncoderFence),
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
    SetBuffer {
        stage: ShaderStage,
        index: u32,
        buffer: Arc<dyn NativeBuffer>,
        len: u64,
    },
    SetBytes {
        stage: ShaderStage,
        index: u32,
        len: u64,
    },
    Dispatch(Kernel),
    SignalEvent(Arc<dyn NativeEvent>, u64),
    WaitEvent(Arc<dyn NativeEvent>, u64),
}

fn soft(buffer: &Arc<dyn NativeBuffer>) -> &SoftBuffer {
    buffer
        .as_any()
        .downcast_ref::<SoftBuffer>()
        .unwrap_or_else(|| panic!("buffer {} does not belong to the soft backend", buffer.label()))
}

fn event_id(event: &Arc<dyn NativeEvent>) -> u64 {
    event
        .as_any()
        .downcast_ref::<SoftEvent>()
        .map(|e| e.id())
        .unwrap_or(0)
}

pub struct SoftCommandBuffer {
    id: u64,
    label: String,
    commands: Vec<Command>,
    open: Option<EncoderKind>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SoftCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftCommandBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("commands", &self.commands.len())
            .field("open", &self.open)
            .finish()
    }
}

impl SoftCommandBuffer {
    pub(super) fn new(id: u64, label: String, inner: Arc<Inner>) -> Self {
        SoftCommandBuffer {
            id,
            label,
            commands: Vec::new(),
            open: None,
            inner,
        }
    }

    pub(super) fn from_native(native: Box<dyn NativeCommandBuffer>) -> Self {
        match native.into_any().downcast::<SoftCommandBuffer>() {
            Ok(cb) => {
                assert!(cb.open.is_none(), "command buffer {} committed with an open encoder", cb.label);
                *cb
            }
            Err(_) => panic!("command buffer does not belong to the soft backend"),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn require(&self, kind: EncoderKind, what: &str) {
        assert_eq!(
            self.open,
            Some(kind),
            "{what} requires an open {kind:?} encoder on {}",
            self.label
        );
    }

    fn require_no_encoder(&self, what: &str) {
        assert!(
            self.open.is_none(),
            "{what} cannot be encoded while a {:?} encoder is open on {}",
            self.open,
            self.label
        );
    }

    /// Run commands from `pc`.  Returns `true` once the last command has executed and
    /// `false` if stopped at an event wait that is not yet satisfied.
    pub(super) fn execute(&mut self, pc: &mut usize, inner: &Inner) -> bool {
        let id = self.id;
        while let Some(command) = self.commands.get(*pc) {
            match command {
                Command::BeginEncoder(kind) => {
                    inner.record(JournalEntry::EncoderBegan { command_buffer: id, kind: *kind })
                }
                Command::EndEncoder(kind, fence) => inner.record(JournalEntry::EncoderEnded {
                    command_buffer: id,
                    kind: *kind,
                    fence: *fence,
                }),
                Command::WaitEncoderFence(fence) => {
                    //execution is serial, so the producing encoder has already finished
                    inner.record(JournalEntry::EncoderFenceWaited { command_buffer: id, fence: *fence })
                }
                Command::Copy {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    len,
                } => {
                    let (s, d) = (soft(src), soft(dst));
                    unsafe {
                        std::ptr::copy(
                            s.gpu_ptr().add(*src_offset as usize),
                            d.gpu_ptr().add(*dst_offset as usize),
                            *len as usize,
                        );
                    }
                    inner.record(JournalEntry::Copied {
                        command_buffer: id,
                        src: s.id(),
                        dst: d.id(),
                        dst_offset: *dst_offset,
                        len: *len,
                    });
                }
                Command::Fill { dst, range, value } => {
                    let d = soft(dst);
                    let len = range.end - range.start;
                    unsafe {
                        std::ptr::write_bytes(d.gpu_ptr().add(range.start as usize), *value, len as usize);
                    }
                    inner.record(JournalEntry::Filled {
                        command_buffer: id,
                        dst: d.id(),
                        len,
                        value: *value,
                    });
                }
                Command::Synchronize(buffer) => {
                    let b = soft(buffer);
                    b.synchronize();
                    inner.record(JournalEntry::Synchronized { command_buffer: id, buffer: b.id() });
                }
                Command::SetBuffer {
                    stage,
                    index,
                    buffer,
                    len,
                } => inner.record(JournalEntry::BufferBound {
                    command_buffer: id,
                    stage: *stage,
                    index: *index,
                    buffer: soft(buffer).id(),
                    len: *len,
                }),
                Command::SetBytes { stage, index, len } => inner.record(JournalEntry::BytesBound {
                    command_buffer: id,
                    stage: *stage,
                    index: *index,
                    len: *len,
                }),
                Command::Dispatch(Kernel::ScatterDescriptors {
                    entries,
                    indices,
                    table,
                    count,
                    entry_size,
                }) => {
                    let (entries, indices, table) = (soft(entries), soft(indices), soft(table));
                    let entry_size = *entry_size as usize;
                    let slots = table.len() as usize / entry_size;
                    for i in 0..*count as usize {
                        let index_bytes = &indices.gpu_bytes()[i * 4..i * 4 + 4];
                        let index = u32::from_le_bytes([index_bytes[0], index_bytes[1], index_bytes[2], index_bytes[3]]) as usize;
                        if index >= slots {
                            logwise::warn_sync!(
                                "scatter index {index} outside table of {slots} entries",
                                index = index,
                                slots = slots
                            );
                            continue;
                        }
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                entries.gpu_ptr().add(i * entry_size),
                                table.gpu_ptr().add(index * entry_size),
                                entry_size,
                            );
                        }
                    }
                    inner.record(JournalEntry::Scattered { command_buffer: id, count: *count });
                }
                Command::SignalEvent(event, value) => {
                    event.signal(*value);
                    inner.record(JournalEntry::EventSignaled {
                        command_buffer: id,
                        event: event_id(event),
                        value: *value,
                    });
                }
                Command::WaitEvent(event, value) => {
                    if event.signaled_value() < *value {
                        return false;
                    }
                    inner.record(JournalEntry::EventWaited {
                        command_buffer: id,
                        event: event_id(event),
                        value: *value,
                    });
                }
            }
            *pc += 1;
        }
        true
    }
}

impl NativeCommandBuffer for SoftCommandBuffer {
    fn label(&self) -> &str {
        &self.label
    }

    fn begin_encoder(&mut self, kind: EncoderKind, _label: &str) {
        assert!(
            self.open.is_none(),
            "{kind:?} encoder opened while {:?} is still open on {}",
            self.open,
            self.label
        );
        self.open = Some(kind);
        self.commands.push(Command::BeginEncoder(kind));
    }

    fn end_encoder(&mut self) -> Option<EncoderFence> {
        let kind = self
            .open
            .take()
            .unwrap_or_else(|| panic!("end_encoder with no open encoder on {}", self.label));
        let fence = self
            .inner
            .capabilities
            .supports_fences
            .then(|| EncoderFence(self.inner.next_id()));
        self.commands.push(Command::EndEncoder(kind, fence));
        fence
    }

    fn wait_for_encoder_fence(&mut self, fence: EncoderFence) {
        assert!(self.open.is_some(), "encoder fence wait outside an encoder on {}", self.label);
        self.commands.push(Command::WaitEncoderFence(fence));
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: &Arc<dyn NativeBuffer>,
        src_offset: u64,
        dst: &Arc<dyn NativeBuffer>,
        dst_offset: u64,
        len: u64,
    ) {
        self.require(EncoderKind::Blit, "copy");
        assert!(src_offset + len <= src.len(), "copy reads past the end of {}", src.label());
        assert!(dst_offset + len <= dst.len(), "copy writes past the end of {}", dst.label());
        self.commands.push(Command::Copy {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            len,
        });
    }

    fn fill_buffer(&mut self, dst: &Arc<dyn NativeBuffer>, range: Range<u64>, value: u8) {
        self.require(EncoderKind::Blit, "fill");
        assert!(range.start <= range.end && range.end <= dst.len(), "fill outside {}", dst.label());
        self.commands.push(Command::Fill {
            dst: dst.clone(),
            range,
            value,
        });
    }

    fn synchronize_resource(&mut self, buffer: &Arc<dyn NativeBuffer>) {
        self.require(EncoderKind::Blit, "synchronize");
        self.commands.push(Command::Synchronize(buffer.clone()));
    }

    fn set_buffer(&mut self, stage: ShaderStage, index: u32, buffer: &Arc<dyn NativeBuffer>, offset: u64, len: u64) {
        assert!(self.open.is_some(), "set_buffer outside an encoder on {}", self.label);
        assert!(offset + len <= buffer.len(), "binding past the end of {}", buffer.label());
        self.commands.push(Command::SetBuffer {
            stage,
            index,
            buffer: buffer.clone(),
            len,
        });
    }

    fn set_bytes(&mut self, stage: ShaderStage, index: u32, bytes: &[u8]) {
        assert!(self.open.is_some(), "set_bytes outside an encoder on {}", self.label);
        self.commands.push(Command::SetBytes {
            stage,
            index,
            len: bytes.len() as u64,
        });
    }

    fn dispatch(&mut self, kernel: Kernel) {
        self.require(EncoderKind::Compute, "dispatch");
        assert!(self.inner.capabilities.supports_compute, "dispatch on a device without compute");
        self.commands.push(Command::Dispatch(kernel));
    }

    fn signal_event(&mut self, event: &Arc<dyn NativeEvent>, value: u64) {
        self.require_no_encoder("signal_event");
        self.commands.push(Command::SignalEvent(event.clone(), value));
    }

    fn wait_for_event(&mut self, event: &Arc<dyn NativeEvent>, value: u64) {
        self.require_no_encoder("wait_for_event");
        self.commands.push(Command::WaitEvent(event.clone(), value));
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
