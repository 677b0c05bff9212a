// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use crate::fence::{FencePool, FenceWait};
use crate::imp::{CompletionHandler, NativeCommandBuffer};

/// One native command buffer plus its lazily created completion fence.
///
/// Owned by a [`super::CommandContext`] until it is committed.
pub struct CommandBuffer {
    native: Box<dyn NativeCommandBuffer>,
    label: String,
    completion: Option<FenceWait>,
    handlers: Vec<CompletionHandler>,
    fences: FencePool,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("label", &self.label)
            .field("completion", &self.completion.as_ref().map(|c| c.value()))
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl CommandBuffer {
    pub(crate) fn new(native: Box<dyn NativeCommandBuffer>, label: String, fences: FencePool) -> Self {
        CommandBuffer {
            native,
            label,
            completion: None,
            handlers: Vec::new(),
            fences,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn native(&mut self) -> &mut dyn NativeCommandBuffer {
        &mut *self.native
    }

    /// The point that will be signaled when this command buffer completes.
    pub fn completion_fence(&mut self) -> FenceWait {
        if let Some(completion) = &self.completion {
            return completion.clone();
        }
        let completion = self.fences.acquire(&self.label).next_value();
        self.completion = Some(completion.clone());
        completion
    }

    pub fn has_completion_fence(&self) -> bool {
        self.completion.is_some()
    }

    pub fn add_completion_handler(&mut self, handler: impl FnOnce() + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub(crate) fn into_parts(mut self) -> (Box<dyn NativeCommandBuffer>, String, FenceWait, Vec<CompletionHandler>) {
        let completion = self.completion_fence();
        (self.native, self.label, completion, self.handlers)
    }
}

/// What remains of a command buffer after commit: kept in the deletion queue until it completes.
#[derive(Debug)]
pub struct CommittedCommandBuffer {
    label: String,
    completion: FenceWait,
}

impl CommittedCommandBuffer {
    pub(crate) fn new(label: String, completion: FenceWait) -> Self {
        CommittedCommandBuffer { label, completion }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn completion(&self) -> &FenceWait {
        &self.completion
    }
}
