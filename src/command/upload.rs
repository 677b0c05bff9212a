// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::buffer::CommandBuffer;
use super::context::CommandContext;
use crate::fence::{Fence, FenceWait};
use crate::rhi::Services;
use std::sync::{Arc, Mutex};

/// Recording work staged by buffer unlocks.
pub type UploadFn = Box<dyn FnOnce(&mut CommandContext) + Send>;

/**
Collects transfer-to-buffer copies and submits them ahead of the next graphics work.

When the device has GPU events, the upload command buffer signals a sync fence and a second,
empty command buffer waits on it, so everything committed afterwards observes the uploads.
*/
pub struct UploadContext {
    pending: Mutex<Vec<UploadFn>>,
    sync: Mutex<Option<Fence>>,
}

impl std::fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadContext")
            .field("pending", &self.pending.lock().unwrap().len())
            .finish()
    }
}

impl UploadContext {
    pub(crate) fn new() -> Self {
        UploadContext {
            pending: Mutex::new(Vec::new()),
            sync: Mutex::new(None),
        }
    }

    pub fn enqueue(&self, work: UploadFn) {
        self.pending.lock().unwrap().push(work);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn sync_point(&self, services: &Services) -> Option<FenceWait> {
        let mut sync = self.sync.lock().unwrap();
        if sync.is_none() {
            *sync = services.queue.create_fence("upload sync");
        }
        sync.as_ref().map(Fence::next_value)
    }

    /// Record every staged upload.  Returns the command buffers to commit, in order.
    pub(crate) fn finalize(&self, services: &Arc<Services>) -> Vec<CommandBuffer> {
        let work = std::mem::take(&mut *self.pending.lock().unwrap());
        if work.is_empty() {
            return Vec::new();
        }
        logwise::trace_sync!("recording {n} uploads", n = work.len());
        let mut context = CommandContext::new(services.clone(), None, "upload");
        for upload in work {
            upload(&mut context);
        }
        let Some(sync) = self.sync_point(services) else {
            return context.finalize();
        };
        context.signal_fence(&sync);
        let mut command_buffers = context.finalize();
        let mut waiter = CommandContext::new(services.clone(), None, "upload wait");
        waiter.wait_for_fence(&sync);
        command_buffers.extend(waiter.finalize());
        command_buffers
    }

    /// Record and commit staged uploads now.  Returns the completion of the last command buffer.
    pub(crate) fn flush(&self, services: &Arc<Services>) -> Option<FenceWait> {
        let mut last = None;
        for command_buffer in self.finalize(services) {
            last = Some(services.queue.commit(command_buffer));
        }
        last
    }
}
