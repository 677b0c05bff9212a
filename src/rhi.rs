// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The entry point that ties the device, queue, heaps and deletion queue together.
*/

use crate::buffer::{self, Buffer, BufferDescriptor};
use crate::command::{CommandContext, CommandQueue, UploadContext};
use crate::config::{Config, ConfigError};
use crate::deletion::{DeferredDeletionQueue, DeferredObject};
use crate::descriptor::BindlessManager;
use crate::fence::{Fence, FenceWait};
use crate::imp::{
    self, Capabilities, NativeDevice, NativeSampler, NativeSamplerDescriptor, NativeTexture,
    NativeTextureDescriptor,
};
use crate::submission::SubmissionThread;
use crate::transfer::TransferAllocator;
use std::sync::Arc;

/// Shared state every buffer, context and heap reaches back to.
#[derive(Debug)]
pub(crate) struct Services {
    pub(crate) device: Arc<dyn NativeDevice>,
    pub(crate) capabilities: Capabilities,
    pub(crate) config: Config,
    pub(crate) queue: Arc<CommandQueue>,
    pub(crate) deletion: Arc<DeferredDeletionQueue>,
    pub(crate) transfer: Arc<TransferAllocator>,
    pub(crate) upload: UploadContext,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CreateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Native(#[from] imp::Error),
    #[error(transparent)]
    Descriptor(#[from] crate::descriptor::Error),
    #[error("could not start the submission thread: {0}")]
    SubmissionThread(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub label: String,
    pub linear: bool,
    pub repeat: bool,
}

/// A texture whose native object is released through the deletion queue.
#[derive(Debug)]
pub struct Texture {
    native: Arc<dyn NativeTexture>,
    deletion: Arc<DeferredDeletionQueue>,
}

impl Texture {
    pub fn label(&self) -> &str {
        self.native.label()
    }

    pub fn native(&self) -> &Arc<dyn NativeTexture> {
        &self.native
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.deletion
            .enqueue(DeferredObject::Texture(self.native.clone()));
    }
}

#[derive(Debug)]
pub struct Sampler {
    native: Arc<dyn NativeSampler>,
    deletion: Arc<DeferredDeletionQueue>,
}

impl Sampler {
    pub fn label(&self) -> &str {
        self.native.label()
    }

    pub fn native(&self) -> &Arc<dyn NativeSampler> {
        &self.native
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.deletion
            .enqueue(DeferredObject::Sampler(self.native.clone()));
    }
}

/**
Owns one device's worth of command and resource state.

```
use buffers_and_fences::imp::soft::SoftDevice;
use buffers_and_fences::{Config, Rhi};

let rhi = Rhi::new(SoftDevice::manual(), Config::default()).unwrap();
let mut context = rhi.command_context("frame");
let completion = context.command_buffer_fence();
rhi.submit_command_lists(vec![context]);
rhi.wait_for_gpu_idle();
assert!(completion.is_signaled());
```
*/
#[derive(Debug)]
pub struct Rhi {
    services: Arc<Services>,
    bindless: Arc<BindlessManager>,
    submission: Option<Arc<SubmissionThread>>,
}

impl Rhi {
    pub fn new(device: Arc<dyn NativeDevice>, config: Config) -> Result<Rhi, CreateError> {
        config.validate()?;
        let capabilities = device.capabilities();
        logwise::info_sync!(
            "creating rhi: unified memory {unified}, fences {fences}, debug {debug}",
            unified = logwise::privacy::LogIt(&capabilities.unified_memory),
            fences = logwise::privacy::LogIt(&capabilities.supports_fences),
            debug = logwise::privacy::LogIt(&config.debug_level)
        );
        let submission = if config.submission_thread {
            Some(SubmissionThread::spawn()?)
        } else {
            None
        };
        let deletion = Arc::new(DeferredDeletionQueue::from_config(&config));
        let queue = Arc::new(CommandQueue::new(
            device.clone(),
            &config,
            deletion.clone(),
            submission.clone(),
        ));
        let services = Arc::new(Services {
            transfer: Arc::new(TransferAllocator::new(device.clone())),
            device,
            capabilities,
            config,
            queue,
            deletion,
            upload: UploadContext::new(),
        });
        let bindless = Arc::new(BindlessManager::new(services.clone())?);
        Ok(Rhi {
            services,
            bindless,
            submission,
        })
    }

    pub fn config(&self) -> &Config {
        &self.services.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.services.capabilities
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.services.queue
    }

    pub fn deletion_queue(&self) -> &Arc<DeferredDeletionQueue> {
        &self.services.deletion
    }

    pub fn bindless(&self) -> &Arc<BindlessManager> {
        &self.bindless
    }

    /// Staged uploads not yet submitted.
    pub fn pending_uploads(&self) -> usize {
        self.services.upload.pending()
    }

    pub fn create_buffer(&self, descriptor: &BufferDescriptor, initial: Option<&[u8]>) -> Result<Buffer, buffer::CreateError> {
        Buffer::new(self.services.clone(), descriptor, initial)
    }

    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<Texture, CreateError> {
        let native = self.services.device.new_texture(&NativeTextureDescriptor {
            label: descriptor.label.clone(),
            width: descriptor.width,
            height: descriptor.height,
        })?;
        Ok(Texture {
            native,
            deletion: self.services.deletion.clone(),
        })
    }

    pub fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<Sampler, CreateError> {
        let native = self.services.device.new_sampler(&NativeSamplerDescriptor {
            label: descriptor.label.clone(),
            linear: descriptor.linear,
            repeat: descriptor.repeat,
        })?;
        Ok(Sampler {
            native,
            deletion: self.services.deletion.clone(),
        })
    }

    /// A fence for GPU/CPU signaling, or `None` if the device has no GPU events.
    pub fn create_fence(&self, label: &str) -> Option<Fence> {
        self.services.queue.create_fence(label)
    }

    /// A recording context that publishes bindless descriptors before its render passes.
    pub fn command_context(&self, label: &str) -> CommandContext {
        CommandContext::new(self.services.clone(), Some(self.bindless.clone()), label)
    }

    /// Commit staged uploads, then each context in order.  Returns the last completion point.
    pub fn submit_command_lists(&self, contexts: Vec<CommandContext>) -> Option<FenceWait> {
        let mut last = self.services.upload.flush(&self.services);
        for context in contexts {
            if let Some(completion) = context.submit() {
                last = Some(completion);
            }
        }
        last
    }

    /// Frame boundary: closes the deletion queue's frame and reaps what is ready.
    pub fn end_frame(&self) -> usize {
        if let Some(thread) = &self.submission {
            thread.sync();
        }
        self.services.deletion.end_frame()
    }

    pub fn wait_for_gpu_idle(&self) {
        self.services.upload.flush(&self.services);
        self.services.queue.wait_until_idle();
    }

    /// Wait for the GPU and destroy everything still deferred.
    pub fn shutdown(self) {
        self.wait_for_gpu_idle();
        let destroyed = self.services.deletion.flush();
        logwise::info_sync!("rhi shutdown destroyed {destroyed} deferred objects", destroyed = destroyed);
    }
}

impl Drop for Rhi {
    fn drop(&mut self) {
        self.services.queue.wait_until_idle();
        self.services.deletion.reap_signaled();
    }
}
