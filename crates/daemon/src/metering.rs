//! Periodic traffic reporting

use std::sync::Arc;
use std::time::Duration;

use stealthwire_core::{Result as CoreResult, TrafficRegistry, TrafficSink, TrafficSnapshot, TunnelError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Sink that writes each snapshot to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl TrafficSink for LogSink {
    async fn report(&self, snapshot: &TrafficSnapshot) -> CoreResult<()> {
        let json = serde_json::to_string(snapshot).map_err(|e| TunnelError::ReportFailed(e.to_string()))?;
        let total: u64 = snapshot.values().map(|delta| delta.total()).sum();
        info!(tasks = snapshot.len(), bytes = total, traffic = %json, "traffic report");
        Ok(())
    }
}

/// Drains a [`TrafficRegistry`] into a sink at a fixed interval.
pub struct MeteringReporter<S> {
    registry: Arc<TrafficRegistry>,
    sink: S,
    interval: Duration,
}

impl<S: TrafficSink> MeteringReporter<S> {
    pub fn new(registry: Arc<TrafficRegistry>, sink: S) -> Self {
        Self {
            registry,
            sink,
            interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Report once. Failures leave the counters in place for the next round.
    pub async fn report_once(&self) -> Option<TrafficSnapshot> {
        // report_with already logs a failed report
        self.registry.report_with(&self.sink).await.ok()
    }

    /// Report every interval until `shutdown`, then flush one last time.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        debug!(interval_secs = self.interval.as_secs_f64(), "metering reporter started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.report_once().await;
                }
            }
        }

        self.report_once().await;
        debug!("metering reporter stopped");
    }
}
