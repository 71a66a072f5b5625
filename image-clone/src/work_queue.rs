// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A serial queue on which request completions are delivered
//!
//! Jobs run one at a time, in the order they were queued, on a single
//! background task.  Completion callbacks queued here never run on the stack
//! of the code that produced the result.

use crate::error::Error;
use crate::request::Completion;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    // A job to run on the worker.
    Job(Job),
    // A signal for the worker to exit after everything queued so far.
    Exit,
}

struct WorkQueueWorker {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl WorkQueueWorker {
    async fn run(&mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                Message::Job(job) => job(),
                Message::Exit => return,
            }
        }
    }
}

struct Inner {
    tx: mpsc::UnboundedSender<Message>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

/// Handle on the serial completion queue
///
/// Clones share the same worker.  The worker exits once every handle has
/// been dropped and the queue has drained.
pub struct OpWorkQueue {
    inner: Arc<Mutex<Inner>>,
}

impl Clone for OpWorkQueue {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl OpWorkQueue {
    /// Creates the queue and its worker task.  Must be called from within a
    /// tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::task::spawn(async move {
            let mut worker = WorkQueueWorker { rx };
            worker.run().await;
        });
        Self { inner: Arc::new(Mutex::new(Inner { tx, handle: Some(handle) })) }
    }

    /// Run `job` on the worker after everything already queued
    ///
    /// Returns `false` if the queue has been closed and the job was dropped.
    pub fn queue<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.lock().unwrap().tx.send(Message::Job(Box::new(job))).is_ok()
    }

    /// Deliver `result` to `on_finish` on the worker
    pub fn queue_completion(
        &self,
        on_finish: Completion,
        result: Result<(), Error>,
    ) -> bool {
        self.queue(move || on_finish(result))
    }

    /// Wait until everything queued so far has run
    ///
    /// Used to leave the context of a completion callback before starting
    /// work that may itself queue completions.
    pub async fn switch_context(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }

    /// Stop the worker if this is the only handle to the queue, after it has
    /// run everything already queued
    ///
    /// If other handles exist, `self` is returned as the error.
    pub async fn try_close(self) -> Result<(), Self> {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            if Arc::strong_count(&self.inner) != 1 {
                drop(inner);
                return Err(self);
            }
            let Some(handle) = inner.handle.take() else {
                return Ok(());
            };
            // The worker only stops on `Exit` or once every sender is gone,
            // and we hold a sender, so this cannot fail.
            let _ = inner.tx.send(Message::Exit);
            handle
        };
        let _ = handle.await;
        Ok(())
    }
}

impl Default for OpWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
