use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use lanrtt::agent::Agent;
use lanrtt::config::Config;
use lanrtt::pidfile::PidFile;

/// LAN round-trip time exporter driven by conntrack events.
#[derive(Parser)]
#[command(name = "lanrtt", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// LAN network address to track (conntrack --orig-src).
    #[arg(long)]
    network: Option<String>,

    /// Subnet mask for the network (conntrack --mask-src).
    #[arg(long)]
    mask: Option<String>,

    /// Run until stopped instead of for the configured polling time.
    #[arg(long)]
    continuous: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

impl Cli {
    /// Loads the config file (or defaults) and applies flag overrides.
    fn load_config(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
        if let Some(network) = &self.network {
            cfg.conntrack.network = network.clone();
        }
        if let Some(mask) = &self.mask {
            cfg.conntrack.mask = mask.clone();
        }
        if self.continuous {
            cfg.conntrack.continuous = true;
        }

        cfg.validate()?;

        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("lanrtt {}", version::full());
        return Ok(());
    }

    let cfg = cli.load_config()?;

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        network = %cfg.conntrack.network,
        mask = %cfg.conntrack.mask,
        continuous = cfg.conntrack.continuous,
        stats_period = ?cfg.stats.period,
        exporter = %cfg.exporter.addr,
        "starting lanrtt",
    );

    let _pid_file = PidFile::acquire(&cfg.pid_file)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let result = tokio::select! {
        _ = shutdown_rx => Ok(()),
        res = agent.wait() => res,
    };

    agent.stop().await?;

    tracing::info!("lanrtt stopped");

    result
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, shutting down");
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
