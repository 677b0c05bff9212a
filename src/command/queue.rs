// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::buffer::{CommandBuffer, CommittedCommandBuffer};
use crate::config::{Config, DebugLevel};
use crate::deletion::{DeferredDeletionQueue, DeferredObject};
use crate::fence::{Fence, FencePool, FenceWait};
use crate::imp::{
    Capabilities, CommandBufferDescriptor, ErrorReporting, NativeDevice, ReferencePolicy,
};
use crate::submission::SubmissionThread;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Receives commit notifications, for frame-capture tooling.
pub trait CaptureHook: Send + Sync {
    /// A capture requested with [`CommandQueue::capture_next`] is starting.
    fn begin_capture(&self, _command_buffers: u32) {}
    /// Called for every commit while the hook is installed.
    fn on_commit(&self, label: &str, index: u64);
    fn end_capture(&self) {}
}

#[derive(Default)]
struct CaptureState {
    hook: Option<Arc<dyn CaptureHook>>,
    remaining: u32,
}

impl std::fmt::Debug for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureState")
            .field("installed", &self.hook.is_some())
            .field("remaining", &self.remaining)
            .finish()
    }
}

/**
Creates and commits command buffers.

Every commit allocates (or reuses) a completion fence for the command buffer, signals it from
the native completion handler, registers it with the deletion queue for the current frame and
defers the committed buffer itself behind that fence.
*/
#[derive(Debug)]
pub struct CommandQueue {
    device: Arc<dyn NativeDevice>,
    capabilities: Capabilities,
    fences: FencePool,
    deletion: Arc<DeferredDeletionQueue>,
    submission: Option<Arc<SubmissionThread>>,
    debug_level: DebugLevel,
    retain_references: bool,
    capture: Mutex<CaptureState>,
    committed: AtomicU64,
}

impl CommandQueue {
    pub(crate) fn new(
        device: Arc<dyn NativeDevice>,
        config: &Config,
        deletion: Arc<DeferredDeletionQueue>,
        submission: Option<Arc<SubmissionThread>>,
    ) -> Self {
        let capabilities = device.capabilities();
        CommandQueue {
            fences: FencePool::new(device.clone()),
            device,
            capabilities,
            deletion,
            submission,
            debug_level: config.debug_level,
            retain_references: config.retains_references(),
            capture: Mutex::new(CaptureState::default()),
            committed: AtomicU64::new(0),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn fence_pool(&self) -> &FencePool {
        &self.fences
    }

    /// Allocate a command buffer.  Failure here is usually fatal for the caller.
    pub fn create_command_buffer(&self, label: &str) -> Result<CommandBuffer, crate::imp::Error> {
        let descriptor = CommandBufferDescriptor {
            label: label.to_string(),
            references: if self.retain_references {
                ReferencePolicy::Retained
            } else {
                ReferencePolicy::Unretained
            },
            error_reporting: if self.debug_level >= DebugLevel::Validation {
                ErrorReporting::EncoderExecutionStatus
            } else {
                ErrorReporting::Default
            },
        };
        let native = self.device.new_command_buffer(&descriptor).inspect_err(|e| {
            logwise::error_sync!(
                "could not allocate command buffer {label}: {e}",
                label = logwise::privacy::LogIt(&label),
                e = logwise::privacy::LogIt(e)
            );
        })?;
        Ok(CommandBuffer::new(native, label.to_string(), self.fences.clone()))
    }

    /// A fence for cross-queue or CPU signaling, if the device supports GPU events.
    pub fn create_fence(&self, label: &str) -> Option<Fence> {
        if !self.capabilities.supports_fences {
            logwise::warn_sync!(
                "fence {label} requested but the device has no GPU events",
                label = logwise::privacy::LogIt(&label)
            );
            return None;
        }
        Some(self.fences.acquire(label))
    }

    /// Submit `command_buffer`.  Returns the point signaled when it completes.
    pub fn commit(&self, command_buffer: CommandBuffer) -> FenceWait {
        let (native, label, completion, handlers) = command_buffer.into_parts();
        let index = self.committed.fetch_add(1, Ordering::Relaxed);
        self.notify_capture(&label, index);

        let signal = completion.clone();
        self.device.commit(
            native,
            Box::new(move || {
                signal.signal();
                for handler in handlers {
                    handler();
                }
            }),
        );

        if self.debug_level >= DebugLevel::WaitForComplete {
            let _stall = logwise::perfwarn_begin!("CommandQueue::commit wait for complete");
            completion.wait();
            return completion;
        }

        let record = CommittedCommandBuffer::new(label, completion.clone());
        let deletion = self.deletion.clone();
        let fence = completion.clone();
        let defer = move || {
            deletion.add_fence(fence.clone());
            deletion.enqueue_with(DeferredObject::CommandBuffer(record), vec![fence]);
        };
        match &self.submission {
            Some(thread) if !thread.is_current() => thread.dispatch(Box::new(defer)),
            _ => defer(),
        }
        completion
    }

    /// Command buffers committed so far.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn set_capture_hook(&self, hook: Option<Arc<dyn CaptureHook>>) {
        let mut capture = self.capture.lock().unwrap();
        if hook.is_none() && capture.remaining > 0 {
            if let Some(old) = &capture.hook {
                old.end_capture();
            }
        }
        capture.remaining = 0;
        capture.hook = hook;
    }

    /// Ask the installed hook to capture the next `command_buffers` commits.
    pub fn capture_next(&self, command_buffers: u32) {
        let mut capture = self.capture.lock().unwrap();
        let Some(hook) = capture.hook.clone() else {
            logwise::warn_sync!("capture requested with no capture hook installed");
            return;
        };
        if command_buffers == 0 {
            return;
        }
        hook.begin_capture(command_buffers);
        capture.remaining = command_buffers;
    }

    fn notify_capture(&self, label: &str, index: u64) {
        let mut capture = self.capture.lock().unwrap();
        let Some(hook) = capture.hook.clone() else {
            return;
        };
        hook.on_commit(label, index);
        if capture.remaining > 0 {
            capture.remaining -= 1;
            if capture.remaining == 0 {
                hook.end_capture();
            }
        }
    }

    /// Block until the device has finished everything committed so far.
    pub fn wait_until_idle(&self) {
        let _stall = logwise::perfwarn_begin!("CommandQueue::wait_until_idle");
        self.device.wait_idle();
        if let Some(thread) = &self.submission {
            thread.sync();
        }
    }
}
