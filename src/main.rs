use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use structopt::StructOpt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;
use vmchannel::config::{ConfigManager, LogFormat, LoggingConfig};
use vmchannel::{ControlService, DaemonContext, TriggerLoop};

#[derive(Debug, StructOpt)]
#[structopt(name = "vmchanneld", about = "Host-to-guest key/value channel daemon")]
struct Opt {
    /// Path to configuration file; built-in defaults when omitted
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    cmd: Subcommand,
}

#[derive(Debug, StructOpt)]
enum Subcommand {
    /// Serve channel operations over HTTP
    Serve {
        /// TCP listen address
        #[structopt(long)]
        ip: Option<IpAddr>,

        /// TCP listen port
        #[structopt(long)]
        port: Option<u16>,

        /// Listen on the toolstack plugin socket
        #[structopt(long)]
        service: bool,

        /// Also run the guest-start watcher as a child process
        #[structopt(long)]
        watch: bool,
    },

    /// Re-establish channels whenever guests start
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let mut config_manager = match &opt.config {
        Some(path) => ConfigManager::load_from_file(path)?,
        None => ConfigManager::new(),
    };

    if let Subcommand::Serve { ip, port, service, .. } = &opt.cmd {
        let listen = &mut config_manager.get_config_mut().listen;
        if ip.is_some() {
            listen.ip = *ip;
        }
        if port.is_some() {
            listen.port = *port;
        }
        if *service {
            listen.service = true;
        }
    }

    init_tracing(&config_manager.get_config().logging)?;

    info!("Starting vmchanneld...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = config_manager.config_path() {
        info!("Configuration loaded from: {}", path);
    }

    config_manager.validate().map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;

    let config = config_manager.get_config().clone();
    if let Some(pid_file) = &config.pid_file {
        record_pid(pid_file);
    }

    let ctx = Arc::new(DaemonContext::from_config(&config_manager)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Set up signal handling
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            }
            let _ = shutdown_tx.send(true);
        });
    }

    match opt.cmd {
        Subcommand::Serve { watch: with_watcher, .. } => {
            let transport = config.listen.transport()?;

            let mut watcher = if with_watcher {
                Some(spawn_watcher(opt.config.as_deref())?)
            } else {
                None
            };

            let service = Arc::new(ControlService::new(ctx, config.listen.handler_prefix()));
            let result = service.serve(transport, shutdown_rx).await;

            if let Some(child) = watcher.as_mut() {
                stop_watcher(child).await;
            }
            result?;
        }
        Subcommand::Watch => {
            let trigger = TriggerLoop::standard(ctx, &config.inventory_path, config.timing.event_retry_delay()).await?;
            trigger.run(shutdown_rx).await?;
        }
    }

    info!("vmchanneld has been shut down.");
    Ok(())
}

/// Installs the global subscriber; `RUST_LOG` wins over the configured level
fn init_tracing(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.as_directive()));

    let writer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Plain => builder.init(),
    }
    Ok(())
}

/// Appends our pid; failures are only logged
fn record_pid(path: &Path) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", std::process::id()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to record pid");
    }
}

/// Starts `vmchanneld watch` with the same configuration
fn spawn_watcher(config: Option<&Path>) -> Result<Child, std::io::Error> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    if let Some(path) = config {
        cmd.arg("--config").arg(path);
    }
    cmd.arg("watch").kill_on_drop(true);

    let child = cmd.spawn()?;
    info!(pid = child.id(), "Guest-start watcher started");
    Ok(child)
}

async fn stop_watcher(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = child.kill().await {
        warn!(pid, error = %e, "Failed to stop guest-start watcher");
    } else {
        info!(pid, "Guest-start watcher stopped");
    }
}
