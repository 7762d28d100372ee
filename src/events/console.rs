//! Console observer
//!
//! Renders apply progress with indicatif: one bar counting packages and a
//! byte bar for the artifact currently being cached. Phase summaries are
//! printed above the bars.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::{Event, Observer, Reply};
use crate::cache::{CacheMessage, CacheStep};
use crate::packages::Restart;

pub struct ConsoleObserver {
    multi: MultiProgress,
    /// Package counter for the running phase
    phase_pb: Option<ProgressBar>,
    /// Bytes of the artifact currently in the cache pipeline
    bytes_pb: Option<ProgressBar>,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// Observer that tracks state without drawing anything
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            phase_pb: None,
            bytes_pb: None,
        }
    }

    fn start_phase(&mut self, name: &str, total: usize) {
        self.finish_phase();

        let pb = self.multi.add(ProgressBar::new(total as u64));
        if let Ok(bar_style) = ProgressStyle::default_bar().template("[{bar:40.cyan/blue}] {pos}/{len} {msg}") {
            pb.set_style(bar_style.progress_chars("#>-"));
        }
        pb.set_prefix(name.to_string());
        self.phase_pb = Some(pb);
    }

    fn finish_phase(&mut self) {
        if let Some(pb) = self.phase_pb.take() {
            pb.finish_and_clear();
        }
        self.finish_bytes();
    }

    fn start_bytes(&mut self, id: &str, step: CacheStep) {
        self.finish_bytes();

        let pb = self.multi.add(ProgressBar::new(0));
        if let Ok(bar_style) =
            ProgressStyle::default_bar().template("  [{bar:40.green/yellow}] {bytes}/{total_bytes} {msg}")
        {
            pb.set_style(bar_style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        pb.set_message(format!("{step} {}", truncate(id)));
        self.bytes_pb = Some(pb);
    }

    fn finish_bytes(&mut self) {
        if let Some(pb) = self.bytes_pb.take() {
            pb.finish_and_clear();
        }
    }

    fn println(&self, line: String) {
        let _ = self.multi.println(line);
    }

    fn set_message(&self, message: String) {
        if let Some(pb) = &self.phase_pb {
            pb.set_message(message);
        }
    }

    fn inc(&self) {
        if let Some(pb) = &self.phase_pb {
            pb.inc(1);
        }
    }

    fn on_cache_message(&mut self, id: &str, message: CacheMessage) {
        match message {
            CacheMessage::Begin(step) => self.start_bytes(id, step),
            CacheMessage::Progress {
                transferred, total, ..
            } => {
                if let Some(pb) = &self.bytes_pb {
                    if let Some(total) = total {
                        pb.set_length(total);
                    }
                    pb.set_position(transferred);
                }
            }
            CacheMessage::Success { .. } => self.finish_bytes(),
            CacheMessage::Failure(step) => {
                self.finish_bytes();
                self.println(format!("  {} {step} {id}", style("✗").red()));
            }
            CacheMessage::Complete { .. } => {}
        }
    }
}

impl Default for ConsoleObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for ConsoleObserver {
    fn on_event(&mut self, event: &Event<'_>) -> Reply {
        match *event {
            Event::DetectRelatedBundle {
                bundle_id,
                relation,
                version,
            } => {
                self.println(format!(
                    "{} related bundle {} {} ({relation})",
                    style("•").dim(),
                    style(bundle_id).cyan(),
                    version
                ));
            }
            Event::DetectUpdate { version, .. } => {
                self.println(format!("{} update available: {}", style("•").dim(), style(version).green()));
            }
            Event::Elevate => self.println(format!("{} elevating", style("•").dim())),
            Event::CacheBegin { packages } => self.start_phase("cache", packages),
            Event::CachePackageBegin { package_id, .. } => self.set_message(format!("caching {package_id}")),
            Event::CacheStep { id, message } => self.on_cache_message(id, message),
            Event::CachePackageComplete { .. } => self.inc(),
            Event::CacheComplete { .. } | Event::ExecuteComplete { .. } => self.finish_phase(),
            Event::ExecuteBegin { actions } => self.start_phase("execute", actions),
            Event::ExecutePackageBegin {
                package_id,
                action,
                rollback,
            } => {
                let verb = if rollback { "rolling back" } else { "running" };
                self.set_message(format!("{verb} {action} {package_id}"));
            }
            Event::ExecutePackageComplete {
                package_id,
                succeeded,
                ..
            } => {
                self.inc();
                if !succeeded {
                    self.println(format!("  {} {}", style("✗").red(), package_id));
                }
            }
            Event::ApplyComplete { succeeded, restart } => {
                self.finish_phase();
                let status = if succeeded {
                    style("Apply completed").green().bold()
                } else {
                    style("Apply failed").red().bold()
                };
                let restart = match restart {
                    Restart::None => String::new(),
                    Restart::Required => format!(" ({})", style("restart required").yellow()),
                    Restart::Initiated => format!(" ({})", style("restart initiated").yellow()),
                };
                self.println(format!("{status}{restart}"));
            }
            _ => {}
        }
        Reply::Continue
    }
}

/// Truncate long ids for display
fn truncate(id: &str) -> String {
    let count = id.chars().count();
    if count > 50 {
        let tail: String = id.chars().skip(count - 47).collect();
        format!("...{tail}")
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_counts_packages() {
        let mut observer = ConsoleObserver::hidden();
        observer.on_event(&Event::CacheBegin { packages: 2 });
        observer.on_event(&Event::CachePackageComplete {
            package_id: "a",
            succeeded: true,
        });
        assert_eq!(observer.phase_pb.as_ref().map(ProgressBar::position), Some(1));

        observer.on_event(&Event::CacheComplete { succeeded: true });
        assert!(observer.phase_pb.is_none());
    }

    #[test]
    fn test_cache_progress_tracks_bytes() {
        let mut observer = ConsoleObserver::hidden();
        observer.on_event(&Event::CacheStep {
            id: "payload",
            message: CacheMessage::Begin(CacheStep::Acquire),
        });
        observer.on_event(&Event::CacheStep {
            id: "payload",
            message: CacheMessage::Progress {
                step: CacheStep::Acquire,
                transferred: 10,
                total: Some(40),
            },
        });

        let pb = observer.bytes_pb.as_ref().unwrap();
        assert_eq!(pb.position(), 10);
        assert_eq!(pb.length(), Some(40));

        observer.on_event(&Event::CacheStep {
            id: "payload",
            message: CacheMessage::Success {
                step: CacheStep::Acquire,
                bytes: 40,
            },
        });
        assert!(observer.bytes_pb.is_none());
    }

    #[test]
    fn test_console_observer_never_cancels() {
        let mut observer = ConsoleObserver::hidden();
        assert_eq!(
            observer.on_event(&Event::ApplyComplete {
                succeeded: false,
                restart: Restart::Required
            }),
            Reply::Continue
        );
    }

    #[test]
    fn test_truncate_long_ids() {
        let long = "x".repeat(60);
        assert_eq!(truncate(&long).chars().count(), 50);
        assert_eq!(truncate("short"), "short");
    }
}
