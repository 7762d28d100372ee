//! Companion side of the RPC channel

use std::io::BufRead;
use std::net::{SocketAddr, TcpStream};

use tracing::{debug, info, warn};

use super::channel::{self, Channel};
use super::handler::{RequestEvents, RequestHandler};
use super::protocol::{ChannelKind, CompanionMessage, ParentReply, Request, Response};
use crate::cache::{CacheMessage, CacheReply};
use crate::error::{Result, engine::protocol};

/// Both connections of a companion, already introduced to the primary
#[derive(Debug)]
pub struct Connection {
    pub rpc: Channel,
    /// Raw stream for the log subscriber
    pub log: TcpStream,
}

/// Connect the RPC and log channels to the primary
pub fn connect(address: SocketAddr, secret: &str, parent_pid: u32) -> Result<Connection> {
    let rpc = channel::open(address, secret, parent_pid, ChannelKind::Rpc)?;
    let log = channel::open(address, secret, parent_pid, ChannelKind::Log)?.into_stream();
    Ok(Connection { rpc, log })
}

/// Read the secret the primary writes to our stdin
pub fn read_secret(input: &mut dyn BufRead) -> Result<String> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .map_err(|e| protocol(format!("failed to read secret: {e}")))?;
    let secret = line.trim().to_string();
    if secret.is_empty() {
        return Err(protocol("no secret on stdin"));
    }
    Ok(secret)
}

struct ChannelEvents<'c> {
    channel: &'c mut Channel,
    broken: bool,
}

impl ChannelEvents<'_> {
    fn notify(&mut self, message: &CompanionMessage) -> CacheReply {
        if self.broken {
            return CacheReply::Cancel;
        }
        let reply = self
            .channel
            .send(message)
            .and_then(|()| self.channel.receive::<ParentReply>());
        match reply {
            Ok(ParentReply { cancel: true }) => CacheReply::Cancel,
            Ok(ParentReply { cancel: false }) => CacheReply::Continue,
            Err(e) => {
                warn!(error = %e, "lost the primary while reporting progress");
                self.broken = true;
                CacheReply::Cancel
            }
        }
    }
}

impl RequestEvents for ChannelEvents<'_> {
    fn cache_message(&mut self, id: &str, message: CacheMessage) -> CacheReply {
        self.notify(&CompanionMessage::Cache {
            id: id.to_string(),
            message,
        })
    }

    fn execute_progress(&mut self, package_id: &str, percent: u8) -> CacheReply {
        self.notify(&CompanionMessage::Progress {
            package_id: package_id.to_string(),
            percent,
        })
    }
}

/// Serve requests until the primary sends `Terminate` or goes away
pub fn serve(channel: &mut Channel, handler: &RequestHandler<'_>) -> Result<()> {
    loop {
        let request: Request = channel.receive()?;
        let name = request.name();

        if matches!(request, Request::Terminate) {
            channel.send(&CompanionMessage::Response {
                response: Response::Done,
            })?;
            info!("companion terminating");
            return Ok(());
        }

        debug!(request = name, "companion request");
        let mut events = ChannelEvents {
            channel: &mut *channel,
            broken: false,
        };
        let result = handler.handle(request, &mut events);
        if events.broken {
            return Err(protocol("primary went away during a request"));
        }

        let message = match result {
            Ok(response) => CompanionMessage::Response { response },
            Err(error) => {
                warn!(request = name, error = %error, "request failed");
                CompanionMessage::Failed { error }
            }
        };
        channel.send(&message)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, KnownFolders, RetryPolicy};
    use crate::config::{EngineCommand, Manifest, MachinePolicy};
    use crate::elevation::{Privileged, ProcessCompanion};
    use crate::error::BootstrapError;
    use crate::hash::hash_bytes;
    use crate::packages::PackageEngines;
    use std::net::TcpListener;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manifest() -> Manifest {
        Manifest::from_yaml(&format!(
            r"
bundle:
  id: acme
  name: Acme
  version: 1.0.0
  per_machine: true
  cache_id: acme-1
payloads:
  - key: tool.bin
    file_path: tool.bin
    verification:
      kind: hash
      hash: {}
packages:
  - id: tool
    kind: exe
    cache_id: tool-1
    per_machine: true
    payloads: [tool.bin]
",
            hash_bytes(b"tool")
        ))
        .unwrap()
    }

    fn cache(temp: &TempDir) -> Cache {
        let mut cache = Cache::with_folders(
            &KnownFolders {
                per_machine_data: temp.path().join("machine"),
                per_user_data: temp.path().join("user"),
            },
            &EngineCommand {
                working_directory: Some(temp.path().join("work")),
                ..EngineCommand::default()
            },
            &MachinePolicy::default(),
        )
        .with_retry(RetryPolicy::immediate(1));
        cache.ensure_base_working_folder(false).unwrap();
        cache
    }

    /// Run a companion on a thread against a connected `ProcessCompanion`
    fn with_companion(test: impl FnOnce(&mut ProcessCompanion, &Cache)) {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let manifest = manifest();
        let engines = PackageEngines::default();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        std::thread::scope(|scope| {
            let server = scope.spawn(|| {
                let mut connection = connect(address, "secret", 7).unwrap();
                let handler = RequestHandler::new(&manifest, &cache, &engines);
                let result = serve(&mut connection.rpc, &handler);
                drop(connection);
                result
            });

            let accepted =
                channel::accept(&listener, "secret", 7, Duration::from_secs(10), &mut || Ok(())).unwrap();
            let mut companion = ProcessCompanion::new(accepted, None).unwrap();
            test(&mut companion, &cache);
            companion.terminate().unwrap();
            server.join().unwrap().unwrap();
        });
    }

    struct CancelOnVerify;

    impl RequestEvents for CancelOnVerify {
        fn cache_message(&mut self, _id: &str, message: CacheMessage) -> CacheReply {
            if message == CacheMessage::Begin(crate::cache::CacheStep::Verify) {
                CacheReply::Cancel
            } else {
                CacheReply::Continue
            }
        }

        fn execute_progress(&mut self, _package_id: &str, _percent: u8) -> CacheReply {
            CacheReply::Continue
        }
    }

    #[test]
    fn test_forwarded_payload_is_cached() {
        with_companion(|companion, cache| {
            let working_path = cache.working_folder().unwrap().join("tool.bin");
            std::fs::write(&working_path, b"tool").unwrap();

            let response = companion
                .call(
                    Request::CacheCompletePayload {
                        package_id: "tool".to_string(),
                        payload_key: "tool.bin".to_string(),
                        working_path,
                        move_file: false,
                    },
                    &mut crate::elevation::NoEvents,
                )
                .unwrap();
            let expected = cache.completed_path(true, "tool-1").path.join("tool.bin");
            assert_eq!(response, Response::Path { path: expected.clone() });
            assert_eq!(std::fs::read(expected).unwrap(), b"tool");
        });
    }

    #[test]
    fn test_cancel_reply_reaches_the_companion() {
        with_companion(|companion, cache| {
            let working_path = cache.working_folder().unwrap().join("tool.bin");
            std::fs::write(&working_path, b"tool").unwrap();

            let err = companion
                .call(
                    Request::CacheCompletePayload {
                        package_id: "tool".to_string(),
                        payload_key: "tool.bin".to_string(),
                        working_path,
                        move_file: false,
                    },
                    &mut CancelOnVerify,
                )
                .unwrap_err();
            assert!(err.is_user_exit());
            assert!(!cache.completed_path(true, "tool-1").path.join("tool.bin").exists());
        });
    }

    #[test]
    fn test_companion_errors_keep_their_variant() {
        with_companion(|companion, _| {
            let err = companion
                .call(
                    Request::CacheRemovePackage {
                        package_id: "missing".to_string(),
                    },
                    &mut crate::elevation::NoEvents,
                )
                .unwrap_err();
            assert!(matches!(err, BootstrapError::PreconditionFailed { .. }));
        });
    }

    #[test]
    fn test_read_secret() {
        let mut input = std::io::Cursor::new(b"abc123\n".to_vec());
        assert_eq!(read_secret(&mut input).unwrap(), "abc123");
        let mut empty = std::io::Cursor::new(Vec::new());
        assert!(read_secret(&mut empty).is_err());
    }
}
