// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use crate::imp::{CompletionHandler, NativeEvent};
use std::any::Any;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct State {
    value: u64,
    listeners: Vec<(u64, CompletionHandler)>,
}

/// wgpu has no shared events, so the counter lives on the CPU and GPU-side signals are
/// applied when the signaling submission completes.
pub struct WgpuEvent {
    label: String,
    state: Mutex<State>,
    changed: Condvar,
}

impl std::fmt::Debug for WgpuEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuEvent")
            .field("label", &self.label)
            .field("value", &self.signaled_value())
            .finish()
    }
}

impl WgpuEvent {
    pub(super) fn new(label: &str) -> Self {
        WgpuEvent {
            label: label.to_string(),
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
        }
    }
}

impl NativeEvent for WgpuEvent {
    fn signaled_value(&self) -> u64 {
        self.state.lock().unwrap().value
    }

    fn signal(&self, value: u64) {
        let ready: Vec<CompletionHandler> = {
            let mut state = self.state.lock().unwrap();
            if value <= state.value {
                return;
            }
            state.value = value;
            let (ready, waiting) = std::mem::take(&mut state.listeners)
                .into_iter()
                .partition(|(v, _)| *v <= value);
            state.listeners = waiting;
            ready.into_iter().map(|(_, handler)| handler).collect()
        };
        self.changed.notify_all();
        for handler in ready {
            handler();
        }
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> bool {
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
        let mut state = self.state.lock().unwrap();
        if state.value >= value {
            drop(state);
            callback();
        } else {
            state.listeners.push((value, callback));
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
