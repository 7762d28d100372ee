//! Cache messages
//!
//! Every cache step reports Begin, Progress, Success or Failure and finally
//! Complete to an injected handler. The handler's reply is how the caller
//! cancels; the cache engine itself never talks to a UI or a log sink
//! through this channel.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, Result};

/// A step of the acquire/verify/promote pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStep {
    /// Locating or downloading the source into the working folder
    Acquire,
    /// Extracting payloads out of a container
    Extract,
    /// Moving or copying into the unverified staging area
    Stage,
    Verify,
    /// Promoting a verified artifact to its completed or layout path
    Finalize,
}

impl fmt::Display for CacheStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheStep::Acquire => "acquire",
            CacheStep::Extract => "extract",
            CacheStep::Stage => "stage",
            CacheStep::Verify => "verify",
            CacheStep::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// One notification from the cache engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMessage {
    Begin(CacheStep),
    Progress {
        step: CacheStep,
        transferred: u64,
        total: Option<u64>,
    },
    /// Bytes transferred by the step
    Success { step: CacheStep, bytes: u64 },
    Failure(CacheStep),
    /// End of the whole operation for one artifact
    Complete { succeeded: bool },
}

/// Handler reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheReply {
    #[default]
    Continue,
    Cancel,
}

/// Receives cache messages for an artifact identified by `id`
pub trait CacheMessageHandler {
    fn on_message(&mut self, id: &str, message: CacheMessage) -> CacheReply;
}

impl<F> CacheMessageHandler for F
where
    F: FnMut(&str, CacheMessage) -> CacheReply,
{
    fn on_message(&mut self, id: &str, message: CacheMessage) -> CacheReply {
        self(id, message)
    }
}

/// Handler that ignores every message
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreMessages;

impl CacheMessageHandler for IgnoreMessages {
    fn on_message(&mut self, _id: &str, _message: CacheMessage) -> CacheReply {
        CacheReply::Continue
    }
}

/// Messages for a single artifact, with cancellation mapped to `UserExit`
pub(crate) struct Reporter<'a> {
    id: &'a str,
    handler: &'a mut dyn CacheMessageHandler,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(id: &'a str, handler: &'a mut dyn CacheMessageHandler) -> Self {
        Self { id, handler }
    }

    pub(crate) fn begin(&mut self, step: CacheStep) -> Result<()> {
        self.send_cancelable(CacheMessage::Begin(step))
    }

    pub(crate) fn progress(&mut self, step: CacheStep, transferred: u64, total: Option<u64>) -> Result<()> {
        self.send_cancelable(CacheMessage::Progress {
            step,
            transferred,
            total,
        })
    }

    pub(crate) fn success(&mut self, step: CacheStep, bytes: u64) {
        self.handler
            .on_message(self.id, CacheMessage::Success { step, bytes });
    }

    pub(crate) fn failure(&mut self, step: CacheStep) {
        self.handler.on_message(self.id, CacheMessage::Failure(step));
    }

    pub(crate) fn complete<T>(&mut self, result: Result<T>) -> Result<T> {
        self.handler.on_message(
            self.id,
            CacheMessage::Complete {
                succeeded: result.is_ok(),
            },
        );
        result
    }

    /// Run `f` as one step, reporting Begin and then Success or Failure
    pub(crate) fn step<T>(
        &mut self,
        step: CacheStep,
        f: impl FnOnce(&mut Self) -> Result<(T, u64)>,
    ) -> Result<T> {
        self.begin(step)?;
        match f(self) {
            Ok((value, bytes)) => {
                self.success(step, bytes);
                Ok(value)
            }
            Err(e) => {
                self.failure(step);
                Err(e)
            }
        }
    }

    fn send_cancelable(&mut self, message: CacheMessage) -> Result<()> {
        match self.handler.on_message(self.id, message) {
            CacheReply::Continue => Ok(()),
            CacheReply::Cancel => Err(BootstrapError::UserExit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_reports_begin_and_success() {
        let mut seen = Vec::new();
        let mut handler = |_: &str, m: CacheMessage| {
            seen.push(m);
            CacheReply::Continue
        };

        let mut reporter = Reporter::new("p", &mut handler);
        let value = reporter.step(CacheStep::Verify, |_| Ok((7, 42))).unwrap();
        assert_eq!(value, 7);

        assert_eq!(
            seen,
            vec![
                CacheMessage::Begin(CacheStep::Verify),
                CacheMessage::Success {
                    step: CacheStep::Verify,
                    bytes: 42
                },
            ]
        );
    }

    #[test]
    fn test_cancel_on_begin_is_user_exit() {
        let mut handler = |_: &str, m: CacheMessage| match m {
            CacheMessage::Begin(_) => CacheReply::Cancel,
            _ => CacheReply::Continue,
        };

        let mut reporter = Reporter::new("p", &mut handler);
        let err = reporter
            .step(CacheStep::Stage, |_| Ok(((), 0)))
            .unwrap_err();
        assert!(err.is_user_exit());
    }

    #[test]
    fn test_failure_is_reported() {
        let mut failures = 0;
        let mut handler = |_: &str, m: CacheMessage| {
            if matches!(m, CacheMessage::Failure(CacheStep::Verify)) {
                failures += 1;
            }
            CacheReply::Continue
        };

        let mut reporter = Reporter::new("p", &mut handler);
        let result: Result<()> = reporter.step(CacheStep::Verify, |_| {
            Err(crate::error::verify::hash_mismatch("p", "aa", "bb"))
        });
        assert!(result.is_err());
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_complete_passes_result_through() {
        let mut completed = None;
        let mut handler = |_: &str, m: CacheMessage| {
            if let CacheMessage::Complete { succeeded } = m {
                completed = Some(succeeded);
            }
            CacheReply::Continue
        };

        let mut reporter = Reporter::new("p", &mut handler);
        assert_eq!(reporter.complete(Ok(3)).unwrap(), 3);
        assert_eq!(completed, Some(true));
    }
}
