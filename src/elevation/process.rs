//! Launching and talking to the elevated companion process

use std::io::Write;
use std::net::{Ipv4Addr, TcpListener};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::channel::{self, Accepted, Channel};
use super::handler::{NoEvents, RequestEvents};
use super::log_pump;
use super::protocol::{CompanionMessage, ParentReply, Request, Response};
use super::{ElevationContext, Elevator, Privileged};
use crate::cache::CacheReply;
use crate::config::MachinePolicy;
use crate::config::policy::POLICY_ENV;
use crate::error::{
    BootstrapError, Result,
    engine::{elevation_failed, protocol},
};

/// How long the companion has to connect back
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Attempts before an interrupted companion is reported as a failure
const ELEVATION_ATTEMPTS: u32 = 2;

fn default_launcher() -> Option<Vec<String>> {
    if cfg!(unix) {
        Some(vec!["sudo".to_string(), "-n".to_string()])
    } else {
        None
    }
}

/// Starts the companion through a launcher command such as `sudo -n`
#[derive(Debug, Clone)]
pub struct ProcessElevator {
    launcher: Option<Vec<String>>,
    timeout: Duration,
}

impl ProcessElevator {
    pub fn new(launcher: Option<Vec<String>>) -> Self {
        Self {
            launcher,
            timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn from_policy(policy: &MachinePolicy) -> Self {
        Self::new(policy.elevation_launcher.clone().or_else(default_launcher))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, context: &ElevationContext<'_>, address: &str, parent_pid: u32) -> Result<Command> {
        let launcher = self
            .launcher
            .as_ref()
            .ok_or_else(|| elevation_failed("no elevation launcher is configured for this platform"))?;

        let mut command = match launcher.split_first() {
            Some((program, args)) => {
                let mut command = Command::new(program);
                command.args(args).arg(context.engine_path);
                command
            }
            None => Command::new(context.engine_path),
        };

        command
            .arg("companion")
            .arg("--address")
            .arg(address)
            .arg("--parent-pid")
            .arg(parent_pid.to_string())
            .arg("--manifest")
            .arg(context.manifest_path)
            .arg("--run-id")
            .arg(context.run_id);
        if let Some(dir) = context.working_directory {
            command.arg("--working-dir").arg(dir);
        }
        // Launchers such as sudo reset the environment.
        if let Some(policy) = std::env::var_os(POLICY_ENV) {
            command.arg("--policy").arg(policy);
        }
        command.stdin(Stdio::piped());
        Ok(command)
    }

    fn spawn(&self, context: &ElevationContext<'_>) -> Result<ProcessCompanion> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| elevation_failed(format!("failed to listen for the companion: {e}")))?;
        let address = listener
            .local_addr()
            .map_err(|e| elevation_failed(e.to_string()))?
            .to_string();
        let secret = uuid::Uuid::new_v4().simple().to_string();
        let parent_pid = std::process::id();

        let mut command = self.command(context, &address, parent_pid)?;
        info!(%address, engine = %context.engine_path.display(), "launching elevated companion");
        let mut child = command
            .spawn()
            .map_err(|e| elevation_failed(format!("failed to launch companion: {e}")))?;

        // The secret travels over stdin so it never shows up in a process listing.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = writeln!(stdin, "{secret}") {
                warn!(error = %e, "failed to hand the secret to the companion");
            }
        }

        let accepted = channel::accept(&listener, &secret, parent_pid, self.timeout, &mut || {
            match child.try_wait() {
                Ok(Some(status)) => Err(exit_error(status)),
                Ok(None) => Ok(()),
                Err(e) => Err(elevation_failed(e.to_string())),
            }
        });

        match accepted {
            Ok(accepted) => ProcessCompanion::new(accepted, Some(child)),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }
}

fn exit_error(status: ExitStatus) -> BootstrapError {
    match status.code() {
        Some(code) => elevation_failed(format!("companion exited with status {code}")),
        None => BootstrapError::ElevationInterrupted {
            reason: "companion was terminated before connecting".to_string(),
        },
    }
}

impl Elevator for ProcessElevator {
    fn elevate<'a>(&self, context: ElevationContext<'a>) -> Result<Box<dyn Privileged + 'a>> {
        let mut attempt = 1;
        loop {
            match self.spawn(&context) {
                Ok(companion) => return Ok(Box::new(companion)),
                // Security software sometimes kills the fresh process; try once more.
                Err(BootstrapError::ElevationInterrupted { reason }) if attempt < ELEVATION_ATTEMPTS => {
                    warn!(reason, attempt, "elevated companion interrupted, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Client side of a connected companion
#[derive(Debug)]
pub struct ProcessCompanion {
    rpc: Channel,
    child: Option<Child>,
    log_pump: Option<JoinHandle<()>>,
    terminated: bool,
}

impl ProcessCompanion {
    /// Wrap verified channels, starting the log pump
    pub fn new(accepted: Accepted, child: Option<Child>) -> Result<Self> {
        let log_pump = log_pump::spawn(accepted.log.into_stream())
            .map_err(|e| protocol(format!("failed to start log pump: {e}")))?;
        Ok(Self {
            rpc: accepted.rpc,
            child,
            log_pump: Some(log_pump),
            terminated: false,
        })
    }

    fn reply(&mut self, reply: CacheReply) -> Result<()> {
        self.rpc.send(&ParentReply {
            cancel: reply == CacheReply::Cancel,
        })
    }
}

impl Privileged for ProcessCompanion {
    fn call(&mut self, request: Request, events: &mut dyn RequestEvents) -> Result<Response> {
        if self.terminated {
            return Err(protocol("companion already terminated"));
        }

        debug!(request = request.name(), "forwarding to companion");
        self.rpc.send(&request)?;
        loop {
            match self.rpc.receive::<CompanionMessage>()? {
                CompanionMessage::Cache { id, message } => {
                    let reply = events.cache_message(&id, message);
                    self.reply(reply)?;
                }
                CompanionMessage::Progress { package_id, percent } => {
                    let reply = events.execute_progress(&package_id, percent);
                    self.reply(reply)?;
                }
                CompanionMessage::Response { response } => return Ok(response),
                CompanionMessage::Failed { error } => return Err(error),
            }
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        let result = self.call(Request::Terminate, &mut NoEvents).map(|_| ());
        self.terminated = true;

        if let Some(mut child) = self.child.take() {
            if result.is_err() {
                let _ = child.kill();
            }
            match child.wait() {
                Ok(status) => debug!(?status, "companion exited"),
                Err(e) => warn!(error = %e, "failed to wait for companion"),
            }
        }
        if let Some(pump) = self.log_pump.take() {
            if pump.join().is_err() {
                warn!("elevated log pump panicked");
            }
        }
        info!("elevated companion released");
        result
    }
}

impl Drop for ProcessCompanion {
    fn drop(&mut self) {
        if !self.terminated {
            if let Err(e) = self.terminate() {
                warn!(error = %e, "failed to release companion");
                if let Some(child) = self.child.as_mut() {
                    let _ = child.kill();
                }
            }
        }
    }
}
