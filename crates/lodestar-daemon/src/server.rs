//! Process lifecycle around one registry engine.

use lodestar_engine::{Registry, RegistryMetrics, UnreachableConnector};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DaemonConfig;
use crate::error::DaemonResult;

pub struct Server {
    config: DaemonConfig,
    registry: Registry,
}

impl Server {
    /// Open the registry described by `config`, recovering persisted state.
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let registry = Registry::open(config.registry.clone(), Arc::new(UnreachableConnector)).await?;
        Ok(Self { config, registry })
    }

    /// Run until a shutdown signal, then shut the registry down.
    pub async fn run(self) -> DaemonResult<()> {
        let signal = shutdown_signal();
        tokio::pin!(signal);

        let interval_secs = self.config.metrics.interval_secs;
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                received = &mut signal => break received?,
                _ = ticker.tick(), if interval_secs > 0 => {
                    log_metrics(&self.registry.metrics().await);
                }
            }
        };

        tracing::info!(signal = reason, "Shutdown signal received");
        self.registry.shutdown().await?;
        log_metrics(&self.registry.metrics().await);
        tracing::info!("lodestard stopped");
        Ok(())
    }
}

fn log_metrics(m: &RegistryMetrics) {
    tracing::info!(
        services = m.services,
        events = m.events,
        max_service_lease_ms = m.max_service_lease.as_millis() as u64,
        max_event_lease_ms = m.max_event_lease.as_millis() as u64,
        log_records_since_snapshot = m.log_records_since_snapshot,
        snapshots_taken = m.snapshots_taken,
        delivery_queues = m.delivery_queues,
        "Registry metrics"
    );
}

/// Wait for Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() -> DaemonResult<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            received = tokio::signal::ctrl_c() => {
                received?;
                Ok("ctrl-c")
            }
            _ = terminate.recv() => Ok("terminate"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}
