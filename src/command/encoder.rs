// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use crate::imp::{EncoderFence, EncoderKind, NativeCommandBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncoderState {
    #[default]
    Idle,
    Render,
    Compute,
    Blit,
}

impl From<EncoderKind> for EncoderState {
    fn from(kind: EncoderKind) -> Self {
        match kind {
            EncoderKind::Render => EncoderState::Render,
            EncoderKind::Compute => EncoderState::Compute,
            EncoderKind::Blit => EncoderState::Blit,
        }
    }
}

/**
Tracks which encoder is open on a command buffer.

At most one encoder is open at a time.  Switching kinds ends the open encoder, keeps the
fence token it produced, opens the new encoder and makes it wait on that token, so work in
consecutive encoders executes in order.

A render pass may only begin from [`EncoderState::Idle`]; the caller closes any compute or
blit encoder first.
*/
#[derive(Debug, Default)]
pub struct EncoderMultiplexer {
    state: EncoderState,
    pending: Option<EncoderFence>,
    opened: u64,
}

impl EncoderMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn within_render_pass(&self) -> bool {
        self.state == EncoderState::Render
    }

    /// Encoders opened over the lifetime of this multiplexer.
    pub fn encoders_opened(&self) -> u64 {
        self.opened
    }

    fn open(&mut self, command_buffer: &mut dyn NativeCommandBuffer, kind: EncoderKind, label: &str) {
        command_buffer.begin_encoder(kind, label);
        if let Some(fence) = self.pending.take() {
            command_buffer.wait_for_encoder_fence(fence);
        }
        self.state = kind.into();
        self.opened += 1;
    }

    /// End whatever encoder is open.  Returns `true` if one was.
    pub fn close(&mut self, command_buffer: &mut dyn NativeCommandBuffer) -> bool {
        if self.state == EncoderState::Idle {
            return false;
        }
        self.pending = command_buffer.end_encoder();
        self.state = EncoderState::Idle;
        true
    }

    pub fn begin_render(&mut self, command_buffer: &mut dyn NativeCommandBuffer, label: &str) {
        assert!(
            self.state == EncoderState::Idle,
            "render pass begun while a {:?} encoder is open",
            self.state
        );
        self.open(command_buffer, EncoderKind::Render, label);
    }

    pub fn end_render(&mut self, command_buffer: &mut dyn NativeCommandBuffer) {
        assert!(
            self.state == EncoderState::Render,
            "end_render_pass without an active render pass"
        );
        self.close(command_buffer);
    }

    /// Make a compute or blit encoder current.  A no-op if one of that kind is already open.
    ///
    /// Returns `true` if a new encoder was opened.
    pub fn begin(&mut self, command_buffer: &mut dyn NativeCommandBuffer, kind: EncoderKind, label: &str) -> bool {
        assert!(kind != EncoderKind::Render, "render encoders begin through begin_render");
        assert!(
            self.state != EncoderState::Render,
            "{kind:?} encoder requested inside a render pass"
        );
        if self.state == kind.into() {
            return false;
        }
        self.close(command_buffer);
        self.open(command_buffer, kind, label);
        true
    }

    /// End the open encoder if it is of `kind`.
    pub fn end(&mut self, command_buffer: &mut dyn NativeCommandBuffer, kind: EncoderKind) -> bool {
        if self.state != kind.into() {
            return false;
        }
        self.close(command_buffer)
    }

    /// Close out a command buffer.  The pending token does not carry over to the next one.
    pub fn finalize(&mut self, command_buffer: &mut dyn NativeCommandBuffer) {
        assert!(
            self.state != EncoderState::Render,
            "command buffer finalized inside a render pass"
        );
        self.close(command_buffer);
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imp::soft::{JournalEntry, SoftDevice};
    use crate::imp::{CommandBufferDescriptor, ErrorReporting, NativeDevice, ReferencePolicy};

    fn command_buffer(device: &SoftDevice) -> Box<dyn NativeCommandBuffer> {
        device
            .new_command_buffer(&CommandBufferDescriptor {
                label: "mux".to_string(),
                references: ReferencePolicy::Retained,
                error_reporting: ErrorReporting::Default,
            })
            .unwrap()
    }

    #[test]
    fn switching_kinds_chains_fences() {
        let device = SoftDevice::manual();
        let mut cb = command_buffer(&device);
        let mut mux = EncoderMultiplexer::new();
        assert!(mux.begin(&mut *cb, EncoderKind::Blit, "blit"));
        assert!(!mux.begin(&mut *cb, EncoderKind::Blit, "blit again"));
        assert!(mux.begin(&mut *cb, EncoderKind::Compute, "compute"));
        assert_eq!(mux.state(), EncoderState::Compute);
        mux.finalize(&mut *cb);
        assert_eq!(mux.state(), EncoderState::Idle);
        assert_eq!(mux.encoders_opened(), 2);
        device.commit(cb, Box::new(|| {}));
        device.run_until_idle();

        let journal = device.journal();
        let ended = journal
            .iter()
            .find_map(|e| match e {
                JournalEntry::EncoderEnded {
                    kind: EncoderKind::Blit,
                    fence,
                    ..
                } => *fence,
                _ => None,
            })
            .expect("blit encoder ended with a fence");
        assert!(journal.iter().any(|e| matches!(
            e,
            JournalEntry::EncoderFenceWaited { fence, .. } if *fence == ended
        )));
    }

    #[test]
    #[should_panic(expected = "inside a render pass")]
    fn compute_inside_render_pass_panics() {
        let device = SoftDevice::manual();
        let mut cb = command_buffer(&device);
        let mut mux = EncoderMultiplexer::new();
        mux.begin_render(&mut *cb, "pass");
        mux.begin(&mut *cb, EncoderKind::Compute, "compute");
    }

    #[test]
    #[should_panic(expected = "render pass begun while")]
    fn render_requires_idle() {
        let device = SoftDevice::manual();
        let mut cb = command_buffer(&device);
        let mut mux = EncoderMultiplexer::new();
        mux.begin(&mut *cb, EncoderKind::Blit, "blit");
        mux.begin_render(&mut *cb, "pass");
    }
}
