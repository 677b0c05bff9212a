// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The optional submission thread.

When enabled, post-commit bookkeeping (registering completion fences and deferring committed
command buffers) hops to this thread so recording threads do not contend on the deletion
queue.  Work already running on the thread executes inline.
*/

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};

pub(crate) type Task = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
pub(crate) struct SubmissionThread {
    sender: Mutex<Option<Sender<Task>>>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SubmissionThread {
    pub(crate) fn spawn() -> std::io::Result<Arc<Self>> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let handle = std::thread::Builder::new()
            .name("submission".to_string())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
                logwise::trace_sync!("submission thread exiting");
            })?;
        logwise::info_sync!("submission thread started");
        Ok(Arc::new(SubmissionThread {
            sender: Mutex::new(Some(sender)),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub(crate) fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    pub(crate) fn dispatch(&self, task: Task) {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                if let Err(mpsc::SendError(task)) = sender.send(task) {
                    logwise::warn_sync!("submission thread gone; running task inline");
                    task();
                }
            }
            None => task(),
        }
    }

    /// Block until every task dispatched before this call has run.
    pub(crate) fn sync(&self) {
        if self.is_current() {
            return;
        }
        let (done, wait) = mpsc::channel();
        self.dispatch(Box::new(move || {
            let _ = done.send(());
        }));
        let _ = wait.recv();
    }
}

impl Drop for SubmissionThread {
    fn drop(&mut self) {
        self.sender.lock().unwrap().take();
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.join().is_err() {
                logwise::error_sync!("submission thread panicked");
            }
        }
    }
}
