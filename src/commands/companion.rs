//! Elevated companion: serve per-machine requests for the primary

use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::{Mutex, PoisonError};

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use crate::cache::Cache;
use crate::cli::CompanionArgs;
use crate::config::{EngineCommand, MachinePolicy, Manifest};
use crate::elevation::{RequestHandler, companion};
use crate::error::Result;
use crate::packages::PackageEngines;

/// Writes formatted log lines to the primary over the log channel
struct LogChannel(Mutex<TcpStream>);

struct LogWriter<'a>(&'a Mutex<TcpStream>);

impl Write for LogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

impl<'a> MakeWriter<'a> for LogChannel {
    type Writer = LogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(&self.0)
    }
}

pub fn run(args: CompanionArgs) -> Result<()> {
    let secret = companion::read_secret(&mut io::stdin().lock())?;
    let mut connection = companion::connect(args.address, &secret, args.parent_pid)?;

    let filter = EnvFilter::try_from_env("BOOTSTRAPPER_LOG").unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(LogChannel(Mutex::new(connection.log)))
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .try_init();

    let policy = match &args.policy {
        Some(path) => MachinePolicy::load_from(path)?,
        None => MachinePolicy::load()?,
    };
    let manifest = Manifest::load(&args.manifest)?;
    let command = EngineCommand {
        working_directory: args.working_dir.clone(),
        ..EngineCommand::default()
    };
    let mut cache = Cache::initialize(&command, &policy)?.with_run_id(&args.run_id);
    cache.ensure_base_working_folder(true)?;

    info!(bundle = %manifest.bundle.id, parent = args.parent_pid, "companion ready");
    let engines = PackageEngines::default();
    let handler = RequestHandler::new(&manifest, &cache, &engines);
    let result = companion::serve(&mut connection.rpc, &handler);
    cache.remove_working_folder();
    result
}
