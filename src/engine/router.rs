//! Routes requests to the companion or the in-process handler

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use super::notifier::Notifier;
use crate::cache::{CacheMessage, CacheMessageHandler, CacheReply};
use crate::elevation::{NoEvents, Privileged, Request, RequestEvents, RequestHandler, Response};
use crate::error::{Result, engine::protocol};
use crate::events::Event;
use crate::packages::Restart;

/// Per-machine requests go to the elevated companion when there is one;
/// everything else runs in-process.
pub struct Router<'a> {
    local: RequestHandler<'a>,
    elevated: Option<Mutex<Box<dyn Privileged + 'a>>>,
}

impl<'a> Router<'a> {
    pub fn new(local: RequestHandler<'a>, elevated: Option<Box<dyn Privileged + 'a>>) -> Self {
        Self {
            local,
            elevated: elevated.map(Mutex::new),
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated.is_some()
    }

    pub fn call(&self, per_machine: bool, request: Request, events: &mut dyn RequestEvents) -> Result<Response> {
        match &self.elevated {
            Some(elevated) if per_machine => elevated
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .call(request, events),
            _ => self.local.handle(request, events),
        }
    }

    /// Call with no notifications expected
    pub fn call_quiet(&self, per_machine: bool, request: Request) -> Result<Response> {
        self.call(per_machine, request, &mut NoEvents)
    }

    /// Release the companion
    pub fn terminate(self) {
        if let Some(elevated) = self.elevated {
            let mut privileged = elevated.into_inner().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = privileged.call(Request::ApplyUninitialize, &mut NoEvents) {
                warn!(error = %e, "companion uninitialize failed");
            }
            if let Err(e) = privileged.terminate() {
                warn!(error = %e, "failed to terminate companion");
            }
        }
    }
}

pub fn expect_restart(response: Response) -> Result<Restart> {
    match response {
        Response::Restart { restart } => Ok(restart),
        other => Err(protocol(format!("expected a restart response, got {other:?}"))),
    }
}

pub fn expect_path(response: Response) -> Result<PathBuf> {
    match response {
        Response::Path { path } => Ok(path),
        other => Err(protocol(format!("expected a path response, got {other:?}"))),
    }
}

/// Turns cache and progress notifications into observer events
pub struct ObserverEvents<'n, 'o> {
    notifier: &'n Notifier<'o>,
}

impl<'n, 'o> ObserverEvents<'n, 'o> {
    pub fn new(notifier: &'n Notifier<'o>) -> Self {
        Self { notifier }
    }
}

impl RequestEvents for ObserverEvents<'_, '_> {
    fn cache_message(&mut self, id: &str, message: CacheMessage) -> CacheReply {
        match self.notifier.notify(&Event::CacheStep { id, message }) {
            Ok(_) => CacheReply::Continue,
            Err(_) => CacheReply::Cancel,
        }
    }

    fn execute_progress(&mut self, package_id: &str, percent: u8) -> CacheReply {
        match self
            .notifier
            .notify(&Event::ExecuteProgress { package_id, percent })
        {
            Ok(_) => CacheReply::Continue,
            Err(_) => CacheReply::Cancel,
        }
    }
}

impl CacheMessageHandler for ObserverEvents<'_, '_> {
    fn on_message(&mut self, id: &str, message: CacheMessage) -> CacheReply {
        self.cache_message(id, message)
    }
}
