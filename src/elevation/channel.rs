//! Line-framed JSON over a loopback TCP stream

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::protocol::{ChannelKind, Hello};
use crate::error::{BootstrapError, Result, engine::protocol};

/// One end of a connection; every message is a single JSON line
#[derive(Debug)]
pub struct Channel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Channel {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let writer = stream
            .try_clone()
            .map_err(|e| protocol(format!("failed to clone stream: {e}")))?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub fn connect(address: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .map_err(|e| protocol(format!("failed to connect to {address}: {e}")))?;
        Self::new(stream)
    }

    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|e| protocol(format!("send failed: {e}")))
    }

    /// Read the next message; a closed connection is `ElevationInterrupted`
    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|e| protocol(format!("receive failed: {e}")))?;
        if read == 0 {
            return Err(BootstrapError::ElevationInterrupted {
                reason: "channel closed by peer".to_string(),
            });
        }
        serde_json::from_str(line.trim_end())
            .map_err(|e| protocol(format!("malformed message: {e}")))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.writer
            .set_read_timeout(timeout)
            .map_err(|e| protocol(e.to_string()))
    }

    /// Hand the underlying stream over, e.g. to a log pump
    pub fn into_stream(self) -> TcpStream {
        self.reader.into_inner()
    }
}

/// Connect to the primary and introduce this connection
pub fn open(address: SocketAddr, secret: &str, parent_pid: u32, kind: ChannelKind) -> Result<Channel> {
    let mut channel = Channel::connect(address)?;
    channel.send(&Hello {
        secret: secret.to_string(),
        parent_pid,
        channel: kind,
    })?;
    Ok(channel)
}

/// The two verified connections of a companion
#[derive(Debug)]
pub struct Accepted {
    pub rpc: Channel,
    pub log: Channel,
}

/// Accept connections until both an RPC and a log channel presented the
/// expected secret and parent pid.
///
/// Connections with a wrong secret or pid are dropped. `alive` is polled
/// while waiting so a companion that died early fails fast instead of
/// waiting out the deadline.
pub fn accept(
    listener: &TcpListener,
    secret: &str,
    parent_pid: u32,
    timeout: Duration,
    alive: &mut dyn FnMut() -> Result<()>,
) -> Result<Accepted> {
    const POLL: Duration = Duration::from_millis(25);

    listener
        .set_nonblocking(true)
        .map_err(|e| protocol(e.to_string()))?;
    let deadline = Instant::now() + timeout;
    let mut rpc = None;
    let mut log = None;

    while rpc.is_none() || log.is_none() {
        if Instant::now() >= deadline {
            return Err(BootstrapError::ElevationInterrupted {
                reason: format!("companion did not connect within {}s", timeout.as_secs()),
            });
        }

        let stream = match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "companion connection");
                stream
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                alive()?;
                std::thread::sleep(POLL);
                continue;
            }
            Err(e) => return Err(protocol(format!("accept failed: {e}"))),
        };

        stream
            .set_nonblocking(false)
            .map_err(|e| protocol(e.to_string()))?;
        let mut channel = Channel::new(stream)?;
        channel.set_read_timeout(Some(deadline.saturating_duration_since(Instant::now()).max(POLL)))?;

        let hello: Hello = match channel.receive() {
            Ok(hello) => hello,
            Err(e) => {
                warn!(error = %e, "dropping connection without a valid hello");
                continue;
            }
        };
        if hello.secret != secret || hello.parent_pid != parent_pid {
            warn!(channel = ?hello.channel, "dropping connection with wrong secret or parent");
            continue;
        }

        channel.set_read_timeout(None)?;
        match hello.channel {
            ChannelKind::Rpc => rpc = Some(channel),
            ChannelKind::Log => log = Some(channel),
        }
    }

    match (rpc, log) {
        (Some(rpc), Some(log)) => Ok(Accepted { rpc, log }),
        _ => Err(protocol("handshake incomplete")),
    }
}
