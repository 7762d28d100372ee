//! Re-emits the companion's log lines in the primary's log

use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::thread::JoinHandle;

use tracing::{Level, debug, error, info, trace, warn};

/// Split a formatted log line into its level and the rest.
///
/// Lines the companion formats without a recognizable level are logged at info.
pub fn split_level(line: &str) -> (Level, &str) {
    let trimmed = line.trim_start();
    let (word, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
    let level = match word {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => return (Level::INFO, line),
    };
    (level, rest.trim_start())
}

fn emit(line: &str) {
    let (level, message) = split_level(line);
    match level {
        Level::ERROR => error!(target: "elevated", "{message}"),
        Level::WARN => warn!(target: "elevated", "{message}"),
        Level::INFO => info!(target: "elevated", "{message}"),
        Level::DEBUG => debug!(target: "elevated", "{message}"),
        Level::TRACE => trace!(target: "elevated", "{message}"),
    }
}

/// Pump lines until the companion closes the log channel
pub fn spawn(stream: TcpStream) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("elevated-log".to_string())
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                match line {
                    Ok(line) if line.trim().is_empty() => {}
                    Ok(line) => emit(&line),
                    Err(e) => {
                        debug!(error = %e, "elevated log channel closed");
                        break;
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn test_split_level() {
        assert_eq!(
            split_level(" WARN bootstrapper::cache: retrying"),
            (Level::WARN, "bootstrapper::cache: retrying")
        );
        assert_eq!(split_level("DEBUG x"), (Level::DEBUG, "x"));
        assert_eq!(split_level("plain text"), (Level::INFO, "plain text"));
    }

    #[test]
    fn test_pump_ends_when_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let pump = spawn(server).unwrap();
        client.write_all(b" INFO companion ready\n\n").unwrap();
        drop(client);
        pump.join().unwrap();
    }
}
