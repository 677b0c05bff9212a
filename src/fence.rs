// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Fences: monotonic completion signals.

A [`Fence`] wraps one native event plus the next value it will be signaled with.  Each
reservation (`next_value`) is a new point on that timeline, and a [`FenceWait`] names one
such point.  Waiting for value N implies everything signaled before N is complete.

Native events are recycled through a [`FencePool`] when the last holder of a fence goes away.
A recycled event remembers the highest value ever reserved on it, and its next fence starts
above that, so a signal still queued for the old fence cannot satisfy the new one.
*/

use crate::imp::{NativeDevice, NativeEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[derive(Debug)]
struct PoolShared {
    device: Arc<dyn NativeDevice>,
    //(event, highest value reserved on it)
    free: Mutex<Vec<(Arc<dyn NativeEvent>, u64)>>,
    created: AtomicU64,
}

/// Recycles native events.
#[derive(Debug, Clone)]
pub struct FencePool {
    shared: Arc<PoolShared>,
}

impl FencePool {
    pub fn new(device: Arc<dyn NativeDevice>) -> Self {
        FencePool {
            shared: Arc::new(PoolShared {
                device,
                free: Mutex::new(Vec::new()),
                created: AtomicU64::new(0),
            }),
        }
    }

    pub fn acquire(&self, label: &str) -> Fence {
        let recycled = self.shared.free.lock().unwrap().pop();
        let (event, reserved) = match recycled {
            Some(pooled) => pooled,
            None => {
                self.shared.created.fetch_add(1, Ordering::Relaxed);
                (self.shared.device.new_event(label), 0)
            }
        };
        let base = event.signaled_value().max(reserved);
        Fence {
            inner: Arc::new(FenceInner {
                label: label.to_string(),
                event: Some(event),
                next: AtomicU64::new(base + 1),
                pool: Arc::downgrade(&self.shared),
            }),
        }
    }

    /// Native events created so far (pooled or in use).
    pub fn events_created(&self) -> u64 {
        self.shared.created.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }
}

#[derive(Debug)]
struct FenceInner {
    label: String,
    //option for drop
    event: Option<Arc<dyn NativeEvent>>,
    next: AtomicU64,
    pool: Weak<PoolShared>,
}

impl FenceInner {
    fn event(&self) -> &Arc<dyn NativeEvent> {
        self.event.as_ref().expect("fence event taken before drop")
    }
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        if let (Some(event), Some(pool)) = (self.event.take(), self.pool.upgrade()) {
            let reserved = self.next.load(Ordering::Relaxed) - 1;
            pool.free.lock().unwrap().push((event, reserved));
        }
    }
}

/// A shared handle to a native event with a reservation counter.
#[derive(Debug, Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub(crate) fn native(&self) -> &Arc<dyn NativeEvent> {
        self.inner.event()
    }

    /// Reserve the next signal value.
    pub fn next_value(&self) -> FenceWait {
        let value = self.inner.next.fetch_add(1, Ordering::Relaxed);
        FenceWait {
            fence: self.clone(),
            value,
        }
    }

    pub fn signaled_value(&self) -> u64 {
        self.inner.event().signaled_value()
    }

    /// Signal from the CPU.
    pub fn signal(&self, wait: &FenceWait) {
        debug_assert!(Arc::ptr_eq(&self.inner, &wait.fence.inner));
        self.inner.event().signal(wait.value);
    }

    pub fn same_fence(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// One point on a fence's timeline.
#[derive(Debug, Clone)]
pub struct FenceWait {
    fence: Fence,
    value: u64,
}

impl FenceWait {
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_signaled(&self) -> bool {
        self.fence.signaled_value() >= self.value
    }

    /// Bounded wait.  `false` means "not yet", never an error.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.fence.native().wait(self.value, Some(timeout))
    }

    /// Block until signaled.  Reserved for diagnostics and shutdown.
    pub fn wait(&self) {
        let _stall = logwise::perfwarn_begin!("FenceWait::wait");
        self.fence.native().wait(self.value, None);
    }

    /// Resolve once the fence reaches this value.
    pub async fn completed(&self) {
        if self.is_signaled() {
            return;
        }
        let (sender, future) = r#continue::continuation();
        self.fence.native().notify(
            self.value,
            Box::new(move || {
                sender.send(());
            }),
        );
        future.await
    }

    /// Signal this point from the CPU.
    pub fn signal(&self) {
        self.fence.signal(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imp::soft::SoftDevice;

    #[test]
    fn values_are_monotonic_and_ordered() {
        let pool = FencePool::new(SoftDevice::manual());
        let fence = pool.acquire("test");
        let first = fence.next_value();
        let second = fence.next_value();
        assert!(second.value() > first.value());
        assert!(!first.is_signaled());
        second.signal();
        //signaling N implies everything before N
        assert!(first.is_signaled());
        assert!(second.is_signaled());
        //lower signals never move the counter backwards
        first.signal();
        assert_eq!(fence.signaled_value(), second.value());
    }

    #[test]
    fn events_are_recycled() {
        let pool = FencePool::new(SoftDevice::manual());
        let fence = pool.acquire("a");
        let wait = fence.next_value();
        wait.signal();
        drop(fence);
        assert_eq!(pool.available(), 0, "FenceWait still holds the fence");
        drop(wait);
        assert_eq!(pool.available(), 1);
        let again = pool.acquire("b");
        assert_eq!(pool.events_created(), 1);
        //a recycled event starts beyond its previous signals
        assert!(!again.next_value().is_signaled());
    }

    #[test]
    fn recycled_event_ignores_stale_signals() {
        let device = SoftDevice::manual();
        let pool = FencePool::new(device.clone());
        let fence = pool.acquire("old");
        let point = fence.next_value();
        let stale = fence.native().clone();
        let value = point.value();
        drop(point);
        drop(fence);
        assert_eq!(pool.available(), 1);

        let again = pool.acquire("new");
        let fresh = again.next_value();
        assert!(fresh.value() > value);
        //the old fence's signal arrives after its event was recycled
        stale.signal(value);
        assert!(!fresh.is_signaled());
        fresh.signal();
        assert!(fresh.is_signaled());
    }

    #[test]
    fn timeout_is_not_yet() {
        let pool = FencePool::new(SoftDevice::manual());
        let wait = pool.acquire("t").next_value();
        assert!(!wait.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn completed_future_resolves() {
        let pool = FencePool::new(SoftDevice::manual());
        let wait = pool.acquire("async").next_value();
        let signaler = wait.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler.signal();
        });
        test_executors::spin_on(wait.completed());
        assert!(wait.is_signaled());
        handle.join().unwrap();
    }
}
