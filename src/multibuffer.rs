// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Multibuffering ring.

The main idea is,

1.  A buffer owns N native backings ("slots").
2.  Each CPU write moves to the next slot, so the CPU never writes memory an in-flight
    command buffer may be reading.
3.  Each slot remembers the completion points of the command buffers that used it.  If the ring
    comes back around to a slot whose users have not completed, that is a hazard.
*/

use crate::fence::FenceWait;
use crate::imp::NativeBuffer;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct RingSlot {
    pub(crate) backing: Arc<dyn NativeBuffer>,
    uses: Vec<FenceWait>,
}

impl RingSlot {
    /// Completion points of users that have not finished yet.
    pub(crate) fn outstanding(&self) -> Vec<FenceWait> {
        self.uses.iter().filter(|u| !u.is_signaled()).cloned().collect()
    }
}

#[derive(Debug)]
pub(crate) struct BufferRing {
    slots: Vec<RingSlot>,
    current: usize,
}

impl BufferRing {
    pub(crate) fn new(backings: Vec<Arc<dyn NativeBuffer>>) -> Self {
        BufferRing {
            slots: backings
                .into_iter()
                .map(|backing| RingSlot {
                    backing,
                    uses: Vec::new(),
                })
                .collect(),
            current: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn current_index(&self) -> usize {
        self.current
    }

    pub(crate) fn current(&self) -> Option<&Arc<dyn NativeBuffer>> {
        self.slots.get(self.current).map(|s| &s.backing)
    }

    pub(crate) fn slot(&self, index: usize) -> &RingSlot {
        &self.slots[index]
    }

    /// Move to the next slot and return its index.
    pub(crate) fn advance(&mut self) -> usize {
        self.current = (self.current + 1) % self.slots.len();
        self.current
    }

    pub(crate) fn mark_used(&mut self, index: usize, fence: FenceWait) {
        let slot = &mut self.slots[index];
        slot.uses.retain(|u| !u.is_signaled());
        let duplicate = slot
            .uses
            .iter()
            .any(|u| u.fence().same_fence(fence.fence()) && u.value() >= fence.value());
        if !duplicate {
            slot.uses.push(fence);
        }
    }

    /// Swap in a fresh backing for `index`, returning the old slot with its users.
    pub(crate) fn replace(&mut self, index: usize, backing: Arc<dyn NativeBuffer>) -> RingSlot {
        std::mem::replace(
            &mut self.slots[index],
            RingSlot {
                backing,
                uses: Vec::new(),
            },
        )
    }

    pub(crate) fn drain(&mut self) -> Vec<RingSlot> {
        self.current = 0;
        std::mem::take(&mut self.slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::FencePool;
    use crate::imp::soft::SoftDevice;
    use crate::imp::{NativeDevice, StorageMode};

    fn ring(device: &Arc<SoftDevice>, n: usize) -> BufferRing {
        BufferRing::new(
            (0..n)
                .map(|i| device.new_buffer(16, StorageMode::Shared, &format!("slot{i}")).unwrap())
                .collect(),
        )
    }

    #[test]
    fn advance_wraps() {
        let device = SoftDevice::manual();
        let mut ring = ring(&device, 3);
        assert_eq!(ring.current_index(), 0);
        assert_eq!(ring.advance(), 1);
        assert_eq!(ring.advance(), 2);
        assert_eq!(ring.advance(), 0);
    }

    #[test]
    fn signaled_uses_are_pruned() {
        let device = SoftDevice::manual();
        let pool = FencePool::new(device.clone());
        let mut ring = ring(&device, 2);
        let fence = pool.acquire("cb");
        let first = fence.next_value();
        let second = fence.next_value();
        ring.mark_used(0, first.clone());
        ring.mark_used(0, first.clone());
        assert_eq!(ring.slot(0).outstanding().len(), 1);
        ring.mark_used(0, second.clone());
        first.signal();
        assert_eq!(ring.slot(0).outstanding().len(), 1);
        second.signal();
        assert!(ring.slot(0).outstanding().is_empty());
        assert!(ring.slot(1).outstanding().is_empty());
    }
}
