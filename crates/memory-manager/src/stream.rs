// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Execution streams and completion events.
//!
//! A [`Stream`] is an in-order work queue served by one worker thread.
//! Work enqueued on a stream runs after everything enqueued before it.
//! An [`Event`] is a one-shot fence: it is signalled when the work it was
//! recorded for has finished, successfully or not.

use crate::MemoryError;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventState {
    Pending,
    Complete,
    Failed(String),
}

#[derive(Debug)]
struct EventInner {
    state: Mutex<EventState>,
    signalled: Condvar,
}

/// A completion fence for queued work.
///
/// Events are cheap to clone; all clones observe the same completion.
#[derive(Debug, Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn pending() -> Self {
        Self::with_state(EventState::Pending)
    }

    /// An event that is already signalled, as returned by synchronous work.
    pub fn completed() -> Self {
        Self::with_state(EventState::Complete)
    }

    fn with_state(state: EventState) -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(state),
                signalled: Condvar::new(),
            }),
        }
    }

    pub(crate) fn complete(&self) {
        self.signal(EventState::Complete);
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) {
        self.signal(EventState::Failed(reason.into()));
    }

    fn signal(&self, outcome: EventState) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == EventState::Pending {
            *state = outcome;
            self.inner.signalled.notify_all();
        }
    }

    /// Returns `true` once the work has finished, whatever the outcome.
    pub fn is_done(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| *s != EventState::Pending)
            .unwrap_or(true)
    }

    /// Blocks until the event is signalled.
    ///
    /// Returns `TransferFailure` if the work it tracks failed.
    pub fn wait(&self) -> Result<(), MemoryError> {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = self
            .inner
            .signalled
            .wait_while(state, |s| *s == EventState::Pending)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Self::outcome(&state)
    }

    /// Blocks for at most `timeout`.
    ///
    /// Returns `Ok(false)` if the event is still pending afterwards.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, MemoryError> {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (state, _) = self
            .inner
            .signalled
            .wait_timeout_while(state, timeout, |s| *s == EventState::Pending)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == EventState::Pending {
            return Ok(false);
        }
        Self::outcome(&state).map(|()| true)
    }

    fn outcome(state: &EventState) -> Result<(), MemoryError> {
        match state {
            EventState::Failed(reason) => Err(MemoryError::TransferFailure(reason.clone())),
            _ => Ok(()),
        }
    }
}

/// An in-order asynchronous work queue.
///
/// Dropping a stream drains it: queued work still runs to completion
/// before the worker thread exits. Work is never cancelled.
pub struct Stream {
    name: String,
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Spawns a new stream with its own worker thread.
    pub fn new(name: impl Into<String>) -> Result<Self, MemoryError> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name(format!("stream-{name}"))
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .map_err(|e| {
                MemoryError::TransferFailure(format!("cannot spawn stream '{name}': {e}"))
            })?;
        tracing::debug!("stream '{name}' created");
        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `job` behind all previously queued work.
    pub(crate) fn enqueue(&self, job: impl FnOnce() + Send + 'static) -> Result<(), MemoryError> {
        let sender = self.sender.as_ref().ok_or_else(|| self.closed())?;
        sender.send(Box::new(job)).map_err(|_| self.closed())
    }

    /// Returns an event that is signalled once all work queued so far has
    /// finished.
    pub fn record(&self) -> Result<Event, MemoryError> {
        let event = Event::pending();
        let marker = event.clone();
        self.enqueue(move || marker.complete())?;
        Ok(event)
    }

    /// Blocks until all work queued so far has finished.
    pub fn synchronize(&self) -> Result<(), MemoryError> {
        self.record()?.wait()
    }

    fn closed(&self) -> MemoryError {
        MemoryError::TransferFailure(format!("stream '{}' is no longer running", self.name))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("stream '{}' worker panicked", self.name);
            }
        }
        tracing::debug!("stream '{}' destroyed", self.name);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("running", &self.sender.is_some())
            .finish()
    }
}
