use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::conntrack::poller::{ConntrackPoller, PollerExit};
use crate::conntrack::stream::EventPipeline;
use crate::export::MetricsServer;
use crate::flow::FlowStore;
use crate::stats::{Aggregator, RttSink};

/// Agent wires the poller, flow store, aggregator and metrics server.
pub struct Agent {
    cfg: Config,
    server: MetricsServer,
    store: Arc<FlowStore>,
    cancel: CancellationToken,
    aggregator: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<Result<PollerExit>>>,
}

enum Finished {
    Poller(Result<Result<PollerExit>, JoinError>),
    Aggregator(Result<(), JoinError>),
}

impl Agent {
    pub fn new(cfg: Config) -> Result<Self> {
        let server = MetricsServer::new(&cfg.exporter.addr).context("creating metrics server")?;
        let store = Arc::new(FlowStore::new(cfg.flows.capacity));

        Ok(Self {
            cfg,
            server,
            store,
            cancel: CancellationToken::new(),
            aggregator: None,
            poller: None,
        })
    }

    /// The flow store shared by the event pipeline and the aggregator.
    pub fn store(&self) -> Arc<FlowStore> {
        Arc::clone(&self.store)
    }

    /// Start the metrics server, the aggregator and the conntrack poller.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Metrics server first so scrapes succeed from the start.
        self.server
            .start()
            .await
            .context("starting metrics server")?;

        // 2. Aggregator.
        let sink: Arc<dyn RttSink> = self.server.rtt();
        let aggregator = Aggregator::new(
            Arc::clone(&self.store),
            sink,
            self.cfg.stats.period,
            self.cfg.stats.verbose,
        );
        self.aggregator = Some(tokio::spawn(aggregator.run(self.cancel.child_token())));

        // 3. Poller, owning the event pipeline and its correlator.
        let pipeline = EventPipeline::from_config(
            &self.cfg.conntrack,
            &self.cfg.flows,
            Arc::clone(&self.store),
            self.server.health(),
        )?;
        let poller = ConntrackPoller::new(self.cfg.conntrack.clone());
        let cancel = self.cancel.child_token();
        self.poller = Some(tokio::spawn(
            async move { poller.run(pipeline, cancel).await },
        ));

        info!("agent fully started");

        Ok(())
    }

    /// Waits until polling finishes. An aggregator that stops on its own is
    /// an error.
    pub async fn wait(&mut self) -> Result<()> {
        let (Some(poller), Some(aggregator)) = (self.poller.as_mut(), self.aggregator.as_mut())
        else {
            return Ok(());
        };

        let finished = tokio::select! {
            res = poller => Finished::Poller(res),
            res = aggregator => Finished::Aggregator(res),
        };

        match finished {
            Finished::Poller(res) => {
                self.poller = None;
                res.context("conntrack poller task panicked")??;
                Ok(())
            }
            Finished::Aggregator(res) => {
                self.aggregator = None;
                res.context("aggregator task failed")?;
                bail!("aggregator stopped unexpectedly");
            }
        }
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        if let Some(poller) = self.poller.take() {
            match poller.await {
                Ok(Ok(exit)) => info!(?exit, "conntrack poller stopped"),
                Ok(Err(e)) => error!(error = %e, "conntrack poller failed"),
                Err(e) => error!(error = %e, "conntrack poller task panicked"),
            }
        }

        if let Some(aggregator) = self.aggregator.take() {
            aggregator.await.context("aggregator task failed")?;
        }

        self.server.stop();

        Ok(())
    }
}
