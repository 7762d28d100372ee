//! Observer dispatch and cooperative cancellation
//!
//! The cache and execute threads share one observer behind a lock. A cancel
//! reply to a cancelable event sets the shared canceled flag; both threads
//! poll it at item boundaries. Once rollback begins, cancel replies on the
//! rolling-back thread are ignored so rollback always runs to completion; the
//! cache thread still sees cancellation and stops.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, info};

use crate::error::{BootstrapError, Result};
use crate::events::{Event, Observer, Reply};

#[derive(Debug, Default)]
struct CancelState {
    canceled: bool,
    /// Thread running a rollback
    rolling_back: Option<ThreadId>,
}

impl CancelState {
    fn rolling_back_here(&self) -> bool {
        self.rolling_back == Some(thread::current().id())
    }
}

pub struct Notifier<'o> {
    observer: Mutex<&'o mut dyn Observer>,
    state: Mutex<CancelState>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<'o> Notifier<'o> {
    pub fn new(observer: &'o mut dyn Observer) -> Self {
        Self {
            observer: Mutex::new(observer),
            state: Mutex::new(CancelState::default()),
        }
    }

    /// Deliver `event`. A cancel reply to a cancelable event becomes `UserExit`.
    pub fn notify(&self, event: &Event<'_>) -> Result<Reply> {
        let reply = lock(&self.observer).on_event(event);
        if reply != Reply::Cancel {
            return Ok(reply);
        }

        if !event.is_cancelable() {
            debug!(?event, "cancel ignored for non-cancelable event");
            return Ok(Reply::Continue);
        }

        let mut state = lock(&self.state);
        if state.rolling_back_here() {
            debug!(?event, "cancel ignored during rollback");
            return Ok(Reply::Continue);
        }
        if !state.canceled {
            info!("cancellation requested");
        }
        state.canceled = true;
        Err(BootstrapError::UserExit)
    }

    /// Deliver an event whose reply carries no decision
    pub fn inform(&self, event: &Event<'_>) {
        let _ = lock(&self.observer).on_event(event);
    }

    pub fn is_canceled(&self) -> bool {
        lock(&self.state).canceled
    }

    /// `UserExit` once cancellation was requested, unless this thread is
    /// rolling back
    pub fn check_canceled(&self) -> Result<()> {
        let state = lock(&self.state);
        if state.canceled && !state.rolling_back_here() {
            Err(BootstrapError::UserExit)
        } else {
            Ok(())
        }
    }

    /// Request cancellation from inside the engine
    pub fn cancel(&self) {
        lock(&self.state).canceled = true;
    }

    /// Exempt the calling thread from cancellation until [`Self::end_rollback`]
    pub fn begin_rollback(&self) {
        lock(&self.state).rolling_back = Some(thread::current().id());
    }

    pub fn end_rollback(&self) {
        lock(&self.state).rolling_back = None;
    }
}
