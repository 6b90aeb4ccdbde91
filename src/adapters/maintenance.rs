use std::{future::Future, sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use tokio::{task::JoinHandle, time::sleep};
use tracing::Instrument;

use crate::{
    core::GatewayService,
    ports::{node_discovery::NodeDiscovery, tx_status_sink::TxStatusSink},
    utils::graceful_shutdown::ShutdownToken,
};

/// Run `task` every `period` until shutdown.
///
/// Each tick runs in its own task, so an error or a panic is logged and the
/// schedule carries on.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: ShutdownToken,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(
        async move {
            tracing::info!(period = ?period, "Periodic task started");
            loop {
                tokio::select! {
                    _ = sleep(period) => {}
                    _ = shutdown.wait_for_shutdown() => break,
                }

                match tokio::spawn(task()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Periodic task failed"),
                    Err(e) => tracing::error!(error = %e, "Periodic task panicked"),
                }
            }
            tracing::info!("Periodic task stopped");
        }
        .instrument(tracing::info_span!("maintenance", task = name)),
    )
}

/// The gateway's background upkeep: node list refresh, health probing,
/// bad-node pruning, transaction status flushing and admission eviction.
pub struct MaintenanceTasks {
    gateway: Arc<GatewayService>,
    discovery: Arc<dyn NodeDiscovery>,
    tx_sink: Arc<dyn TxStatusSink>,
}

impl MaintenanceTasks {
    pub fn new(
        gateway: Arc<GatewayService>,
        discovery: Arc<dyn NodeDiscovery>,
        tx_sink: Arc<dyn TxStatusSink>,
    ) -> Self {
        Self {
            gateway,
            discovery,
            tx_sink,
        }
    }

    pub async fn refresh_nodes(&self) -> Result<()> {
        let count = self
            .gateway
            .nodes()
            .refresh_from(self.discovery.as_ref())
            .await
            .wrap_err("Node list refresh failed")?;
        tracing::debug!(nodes = count, "Node list refreshed");
        Ok(())
    }

    pub async fn check_health(&self) -> Result<()> {
        let removed = self
            .gateway
            .nodes()
            .health_check(self.discovery.as_ref())
            .await;
        if removed > 0 {
            tracing::warn!(removed, "Removed unresponsive nodes");
        }
        Ok(())
    }

    pub fn prune_bad_nodes(&self) -> Result<()> {
        let pruned = self.gateway.nodes().prune_bad();
        if !pruned.is_empty() {
            tracing::warn!(
                nodes = ?pruned.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Pruned nodes with repeated proxy errors"
            );
        }
        Ok(())
    }

    pub async fn flush_tx_statuses(&self) -> Result<()> {
        let flushed = self
            .gateway
            .tx_recorder()
            .flush(self.tx_sink.as_ref())
            .await
            .wrap_err("Transaction status flush failed")?;
        if flushed > 0 {
            tracing::debug!(flushed, "Transaction statuses flushed");
        }
        Ok(())
    }

    pub fn evict_idle_sources(&self) -> Result<()> {
        let evicted = self.gateway.admission().evict_idle();
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle admission sources");
        }
        Ok(())
    }

    /// Start one independent schedule per upkeep job.
    pub fn spawn_all(self: &Arc<Self>, shutdown: &ShutdownToken) -> Vec<JoinHandle<()>> {
        let config = self.gateway.config();
        let secs = |s: u64| Duration::from_secs(s.max(1));

        let refresh = Arc::clone(self);
        let health = Arc::clone(self);
        let prune = Arc::clone(self);
        let flush = Arc::clone(self);
        let evict = Arc::clone(self);

        vec![
            spawn_periodic(
                "node_refresh",
                secs(config.discovery.refresh_interval_secs),
                shutdown.clone(),
                move || {
                    let tasks = Arc::clone(&refresh);
                    async move { tasks.refresh_nodes().await }
                },
            ),
            spawn_periodic(
                "health_check",
                secs(config.maintenance.health_check_interval_secs),
                shutdown.clone(),
                move || {
                    let tasks = Arc::clone(&health);
                    async move { tasks.check_health().await }
                },
            ),
            spawn_periodic(
                "bad_node_prune",
                secs(config.maintenance.bad_node_prune_interval_secs),
                shutdown.clone(),
                move || {
                    let tasks = Arc::clone(&prune);
                    async move { tasks.prune_bad_nodes() }
                },
            ),
            spawn_periodic(
                "tx_status_flush",
                secs(config.maintenance.tx_flush_interval_secs),
                shutdown.clone(),
                move || {
                    let tasks = Arc::clone(&flush);
                    async move { tasks.flush_tx_statuses().await }
                },
            ),
            spawn_periodic(
                "admission_eviction",
                secs(config.rate_limit.eviction_interval_secs),
                shutdown.clone(),
                move || {
                    let tasks = Arc::clone(&evict);
                    async move { tasks.evict_idle_sources() }
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::utils::graceful_shutdown::{GracefulShutdown, ShutdownReason};

    #[tokio::test(start_paused = true)]
    async fn test_failing_tick_keeps_schedule() {
        let shutdown = GracefulShutdown::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        let handle = spawn_periodic(
            "flaky",
            Duration::from_secs(1),
            shutdown.shutdown_token(),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    let tick = counter.fetch_add(1, Ordering::SeqCst);
                    if tick == 0 {
                        eyre::bail!("first tick fails");
                    }
                    if tick == 1 {
                        panic!("second tick panics");
                    }
                    Ok(())
                }
            },
        );

        for _ in 0..4 {
            sleep(Duration::from_millis(1_001)).await;
        }
        assert!(ticks.load(Ordering::SeqCst) >= 3);

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        handle.await.unwrap();
    }
}
