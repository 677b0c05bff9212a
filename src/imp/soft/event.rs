// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::Inner;
use crate::imp::{CompletionHandler, NativeEvent};
use std::any::Any;
use std::sync::{Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

struct State {
    value: u64,
    listeners: Vec<(u64, CompletionHandler)>,
}

/// A shared event: a monotonic counter the GPU or the CPU can advance.
pub struct SoftEvent {
    id: u64,
    label: String,
    state: Mutex<State>,
    changed: Condvar,
    device: Weak<Inner>,
}

impl std::fmt::Debug for SoftEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftEvent")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("value", &self.signaled_value())
            .finish()
    }
}

impl SoftEvent {
    pub(super) fn new(id: u64, label: &str, device: Weak<Inner>) -> Self {
        SoftEvent {
            id,
            label: label.to_string(),
            state: Mutex::new(State {
                value: 0,
                listeners: Vec::new(),
            }),
            changed: Condvar::new(),
            device,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl NativeEvent for SoftEvent {
    fn signaled_value(&self) -> u64 {
        self.state.lock().unwrap().value
    }

    fn signal(&self, value: u64) {
        let ready = {
            let mut state = self.state.lock().unwrap();
            if value <= state.value {
                return;
            }
            state.value = value;
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.listeners)
                .into_iter()
                .partition(|(at, _)| *at <= value);
            state.listeners = waiting;
            self.changed.notify_all();
            ready
        };
        //listeners run outside the lock so they may touch this event again
        for (_, listener) in ready {
            listener();
        }
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> bool {
        if self.signaled_value() >= value {
            return true;
        }
        if timeout == Some(Duration::ZERO) {
            return false;
        }
        if let Some(device) = self.device.upgrade() {
            if device.is_manual() {
                while self.signaled_value() < value {
                    if !device.step() {
                        break;
                    }
                }
                //nothing else drives a manual timeline, so an unbounded wait would never end
                if timeout.is_none() && self.signaled_value() < value {
                    logwise::warn_sync!(
                        "manual soft GPU stalled waiting for {label} to reach {value}",
                        label = logwise::privacy::LogIt(&self.label),
                        value = value
                    );
                    return false;
                }
            }
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        while state.value < value {
            match deadline {
                None => state = self.changed.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self.changed.wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
        true
    }

    fn notify(&self, value: u64, callback: CompletionHandler) {
        {
            let mut state = self.state.lock().unwrap();
            if state.value < value {
                state.listeners.push((value, callback));
                return;
            }
        }
        callback();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use crate::imp::soft::SoftDevice;
    use crate::imp::{CommandBufferDescriptor, ErrorReporting, NativeDevice, ReferencePolicy};

    #[test]
    fn stalled_manual_wait_returns() {
        let device = SoftDevice::manual();
        let gate = device.new_event("gate");
        let done = device.new_event("done");
        let mut command_buffer = device
            .new_command_buffer(&CommandBufferDescriptor {
                label: "gated".to_string(),
                references: ReferencePolicy::Unretained,
                error_reporting: ErrorReporting::Default,
            })
            .unwrap();
        command_buffer.wait_for_event(&gate, 1);
        command_buffer.signal_event(&done, 1);
        device.commit(command_buffer, Box::new(|| {}));

        assert!(!done.wait(1, None));
        assert_eq!(done.signaled_value(), 0);
        gate.signal(1);
        assert!(done.wait(1, None));
    }
}
