// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
CPU-shared staging buffers.

Staged writes, private read-backs and descriptor publishing all need short-lived
CPU-visible buffers.  They come from here in power-of-two size classes and return here
through the deferred deletion queue, once the GPU is done copying out of them.
*/

use crate::imp::{self, NativeBuffer, NativeDevice, StorageMode};
use std::sync::{Arc, Mutex};

const MIN_CLASS: u64 = 256;
const MAX_POOLED: usize = 32;

#[derive(Debug)]
pub struct TransferBuffer {
    buffer: Arc<dyn NativeBuffer>,
    len: u64,
}

impl TransferBuffer {
    pub(crate) fn native(&self) -> &Arc<dyn NativeBuffer> {
        &self.buffer
    }

    /// Requested length; the allocation may be larger.
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        //transfer buffers are always shared storage
        self.buffer
            .contents()
            .map(|p| p.as_ptr())
            .unwrap_or(std::ptr::null_mut())
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len as usize) }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.len as usize) }
    }
}

#[derive(Debug)]
pub struct TransferAllocator {
    device: Arc<dyn NativeDevice>,
    pool: Mutex<Vec<Arc<dyn NativeBuffer>>>,
}

fn size_class(len: u64) -> u64 {
    len.max(MIN_CLASS).next_power_of_two()
}

impl TransferAllocator {
    pub(crate) fn new(device: Arc<dyn NativeDevice>) -> Self {
        TransferAllocator {
            device,
            pool: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn allocate(&self, len: u64) -> Result<TransferBuffer, imp::Error> {
        let class = size_class(imp::align_copy(len));
        let pooled = {
            let mut pool = self.pool.lock().unwrap();
            pool.iter()
                .position(|b| b.len() == class)
                .map(|i| pool.swap_remove(i))
        };
        let buffer = match pooled {
            Some(b) => b,
            None => self.device.new_buffer(class, StorageMode::Shared, "transfer")?,
        };
        let transfer = TransferBuffer { buffer, len };
        assert!(
            transfer.buffer.contents().is_some(),
            "transfer buffers must be CPU visible"
        );
        Ok(transfer)
    }

    pub(crate) fn recycle(&self, transfer: TransferBuffer) {
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < MAX_POOLED {
            pool.push(transfer.buffer);
        }
    }

    pub(crate) fn pooled(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imp::soft::SoftDevice;

    #[test]
    fn recycled_buffers_are_reused_by_class() {
        let device = SoftDevice::manual();
        let allocator = TransferAllocator::new(device.clone());
        let a = allocator.allocate(100).unwrap();
        assert_eq!(a.len(), 100);
        assert_eq!(a.native().len(), 256);
        allocator.recycle(a);
        assert_eq!(allocator.pooled(), 1);
        let b = allocator.allocate(200).unwrap();
        assert_eq!(allocator.pooled(), 0);
        assert_eq!(device.live_buffers(), 1);
        let c = allocator.allocate(1000).unwrap();
        assert_eq!(c.native().len(), 1024);
        drop((b, c));
        assert_eq!(device.live_buffers(), 0);
    }
}
