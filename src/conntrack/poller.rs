use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConntrackConfig;

use super::stream::{drive_diagnostics, drive_events, EventPipeline};

/// How a poll run ended.
#[derive(Debug)]
pub enum PollerExit {
    /// conntrack exited on its own.
    Exited(ExitStatus),
    /// The polling time elapsed and conntrack was killed.
    Elapsed,
    /// The run was cancelled and conntrack was killed.
    Cancelled,
}

/// Runs `conntrack -E` and feeds its output through an [`EventPipeline`].
pub struct ConntrackPoller {
    cfg: ConntrackConfig,
}

impl ConntrackPoller {
    pub fn new(cfg: ConntrackConfig) -> Self {
        Self { cfg }
    }

    /// Command line arguments for the event listener.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-E".to_string(),
            "-e".to_string(),
            "UPDATES".to_string(),
            "-o".to_string(),
            "timestamp,id".to_string(),
            "--buffer-size".to_string(),
            self.cfg.netlink_buffer_size.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "--orig-src".to_string(),
            self.cfg.network.clone(),
            "--mask-src".to_string(),
            self.cfg.mask.clone(),
        ]
    }

    fn spawn(&self) -> Result<Child> {
        Command::new(&self.cfg.binary)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.cfg.binary))
    }

    /// Spawns conntrack and drives both of its output streams until it
    /// exits, the polling time elapses (unless continuous) or `cancel`
    /// fires.
    pub async fn run(
        &self,
        mut pipeline: EventPipeline,
        cancel: CancellationToken,
    ) -> Result<PollerExit> {
        let mut child = self.spawn()?;

        let stdout = child
            .stdout
            .take()
            .context("conntrack stdout not captured")?;
        let stderr = child
            .stderr
            .take()
            .context("conntrack stderr not captured")?;

        info!(
            binary = %self.cfg.binary,
            network = %self.cfg.network,
            mask = %self.cfg.mask,
            continuous = self.cfg.continuous,
            polling_time = ?self.cfg.polling_time,
            "conntrack poller started",
        );

        let events =
            tokio::spawn(async move { drive_events(BufReader::new(stdout), &mut pipeline).await });
        let diagnostics = tokio::spawn(drive_diagnostics(BufReader::new(stderr)));

        let polling_time = (!self.cfg.continuous).then_some(self.cfg.polling_time);
        let deadline = async move {
            match polling_time {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let exit = tokio::select! {
            status = child.wait() => {
                PollerExit::Exited(status.context("waiting for conntrack")?)
            }
            _ = deadline => PollerExit::Elapsed,
            _ = cancel.cancelled() => PollerExit::Cancelled,
        };

        if !matches!(exit, PollerExit::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "killing conntrack");
            }
        }

        let lines = events.await.context("event stream task panicked")??;
        diagnostics
            .await
            .context("diagnostic stream task panicked")??;

        match &exit {
            PollerExit::Exited(status) if !status.success() => {
                warn!(%status, lines, "conntrack exited with failure");
            }
            _ => info!(?exit, lines, "polling finished"),
        }

        Ok(exit)
    }
}
