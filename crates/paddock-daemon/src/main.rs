//! paddockd - the paddock container supervisor daemon.
//!
//! A long-lived privileged process that creates, starts, monitors and
//! destroys isolated workloads on a single host.
//!
//! # Fork safety
//!
//! Daemonization via `fork()` MUST happen before any thread exists: only
//! the calling thread survives a fork and mutexes held elsewhere stay
//! locked forever in the child. `main` is synchronous and performs the
//! whole daemonization (fork, setsid, chdir) first; the event loop and
//! every spawn come after.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use nix::unistd::{fork, ForkResult};
use paddock_core::cgroup::CgroupLayer;
use paddock_core::config::DaemonConfig;
use paddock_core::event::{Event, EventLoop};
use paddock_core::kv::KvStore;
use paddock_core::net::Network;
use paddock_core::Holder;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// paddockd - container supervisor
#[derive(Parser, Debug)]
#[command(name = "paddockd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/paddockd.toml")]
    config: PathBuf,

    /// Run in foreground (don't daemonize)
    #[arg(long)]
    no_daemon: bool,

    /// Path to the pid file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        DaemonConfig::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        DaemonConfig::default()
    };

    if !args.no_daemon {
        daemonize()?;
    }

    init_tracing(&args)?;
    write_pid_file(args.pid_file.as_deref().unwrap_or(&config.daemon.pid_file))?;

    // Re-parented grandchildren from the triple fork must land on us, not
    // on init, or their exits would go unseen.
    nix::sys::prctl::set_child_subreaper(true).context("cannot become child subreaper")?;

    run(config)
}

fn daemonize() -> Result<()> {
    // SAFETY: single-threaded here, per the fork-safety note above.
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    nix::unistd::setsid().context("setsid failed")?;
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    nix::unistd::chdir("/").context("chdir / failed")?;
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));

    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

fn write_pid_file(path: &std::path::Path) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("cannot create pid file {}", path.display()))?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

fn run(config: DaemonConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting paddockd");

    // Both of these are fatal: without the record store or the controller
    // tree the daemon cannot make any promise about recovery.
    let kv = KvStore::mount(&config.keyvalue.path, config.keyvalue.size)
        .context("cannot mount key-value tmpfs")?;
    let cgroups = CgroupLayer::probe(&config.container.cgroup_segment)
        .context("cannot probe cgroup controllers")?;

    let net = if config.network.enabled {
        match Network::connect(config.network.clone()) {
            Ok(mut net) => match net.prepare() {
                Ok(()) => Some(net),
                Err(e) => {
                    warn!(error = %e, "cannot prepare shaper, network disabled");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "cannot connect netlink, network disabled");
                None
            }
        }
    } else {
        None
    };

    let events = EventLoop::new(config.container.rotate_interval)
        .context("cannot build event loop")?;
    let mut holder = Holder::new(config, cgroups, kv, net)?;
    holder
        .restore_all(&events)
        .context("restore from key-value store failed")?;

    info!("entering event loop");
    loop {
        let batch = match events.wait() {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "event wait failed");
                continue;
            }
        };
        for event in batch {
            if event == Event::Shutdown {
                info!("shutdown requested");
                return Ok(());
            }
            holder.handle_event(event, &events);
        }
    }
}
