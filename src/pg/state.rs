//! Connection state machine.
//!
//! The single serialization point of a connection: at most one operation is
//! in flight at a time. The state lock is held only while reading or writing
//! the state, never across a transport call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{DriverError, Result};

/// What the connection is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No operation outstanding.
    Idle,
    /// A command was sent and its result has not been classified yet.
    RunningCommand,
    /// Rows of a result are being delivered one at a time.
    StreamingResults,
}

/// Shared flag between a result stream and the state machine.
///
/// The stream owns it; the state machine only keeps a weak reference to the
/// active one so it can stop it on a forced drain.
#[derive(Debug)]
pub struct StreamCursor {
    has_more_rows: AtomicBool,
}

impl StreamCursor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            has_more_rows: AtomicBool::new(true),
        })
    }

    #[inline]
    pub fn has_more_rows(&self) -> bool {
        self.has_more_rows.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.has_more_rows.store(false, Ordering::Release);
    }
}

/// How the caller must proceed after a successful `begin_operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Begin {
    /// The connection was idle.
    Ready,
    /// An open result stream was abandoned; the transport must discard its
    /// remaining replies before the new command is sent.
    Drain,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    active: Option<Weak<StreamCursor>>,
    /// The thread that claimed the running command
    runner: Option<ThreadId>,
}

fn is_active(inner: &Inner, cursor: &Arc<StreamCursor>) -> bool {
    inner
        .active
        .as_ref()
        .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(cursor)))
}

#[derive(Debug)]
pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                active: None,
                runner: None,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Claim the connection for a new operation.
    ///
    /// Fails with the busy error while another command is running. An open
    /// result stream is stopped and `Begin::Drain` is returned; the drain
    /// itself happens outside the lock.
    pub fn begin_operation(&self) -> Result<Begin> {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::RunningCommand => {
                debug!("Rejecting operation, connection busy");
                Err(DriverError::busy())
            }
            ConnectionState::StreamingResults => {
                if let Some(cursor) = inner.active.take().and_then(|w| w.upgrade()) {
                    cursor.stop();
                }
                inner.state = ConnectionState::RunningCommand;
                inner.runner = Some(thread::current().id());
                debug!("Abandoned result stream, forcing drain");
                Ok(Begin::Drain)
            }
            ConnectionState::Idle => {
                inner.state = ConnectionState::RunningCommand;
                inner.runner = Some(thread::current().id());
                trace!("Idle -> RunningCommand");
                Ok(Begin::Ready)
            }
        }
    }

    /// Hand the running command over to a result stream.
    pub fn start_streaming(&self, cursor: &Arc<StreamCursor>) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::StreamingResults;
        inner.active = Some(Arc::downgrade(cursor));
        inner.runner = None;
        trace!("RunningCommand -> StreamingResults");
    }

    /// Return to idle after a stream ended on its own. A stream that was
    /// already superseded leaves the state alone; returns whether the
    /// transition happened.
    pub fn finish_stream(&self, cursor: &Arc<StreamCursor>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::StreamingResults && is_active(&inner, cursor) {
            inner.state = ConnectionState::Idle;
            inner.active = None;
            trace!("StreamingResults -> Idle");
            true
        } else {
            false
        }
    }

    /// Take the connection back from a stream that is closing early, so the
    /// caller can drain it. Returns false if the stream is no longer active.
    pub fn claim_stream(&self, cursor: &Arc<StreamCursor>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::StreamingResults && is_active(&inner, cursor) {
            inner.state = ConnectionState::RunningCommand;
            inner.active = None;
            inner.runner = Some(thread::current().id());
            true
        } else {
            false
        }
    }

    /// Unconditionally return to idle.
    pub fn set_idle(&self) {
        let mut inner = self.inner.lock();
        if let Some(cursor) = inner.active.take().and_then(|w| w.upgrade()) {
            cursor.stop();
        }
        inner.state = ConnectionState::Idle;
        inner.runner = None;
    }

    /// Whether the running command was claimed by the calling thread.
    pub fn is_claimed_here(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == ConnectionState::RunningCommand
            && inner.runner == Some(thread::current().id())
    }
}
