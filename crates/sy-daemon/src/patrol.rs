use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sy_broker::QueueRegistry;
use sy_core::shutdown::{DrainGuard, ShutdownSignal};
use sy_hitl::HitlService;
use sy_telemetry::metrics::{global_metrics, ENVELOPES_DEAD_LETTERED};
use tracing::{debug, error, info};

// ---------------------------------------------------------------------------
// TtlSweeper
// ---------------------------------------------------------------------------

/// Periodic TTL sweep over every queue: anything unclaimed or unacked past
/// its queue's message TTL moves to the paired dead-letter queue.
pub struct TtlSweeper {
    registry: Arc<QueueRegistry>,
    interval: Duration,
}

impl TtlSweeper {
    pub fn new(registry: Arc<QueueRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// One sweep pass. Returns the number of envelopes dead-lettered.
    pub fn run_once(&self) -> usize {
        let report = self.registry.sweep_all(Utc::now());
        for (queue, moved) in &report.dead_lettered {
            global_metrics().increment_counter_by(
                ENVELOPES_DEAD_LETTERED,
                &[("queue", queue)],
                *moved as u64,
            );
            info!(queue = %queue, moved, "TTL sweep dead-lettered envelopes");
        }
        report.total()
    }

    /// Sweep on the configured interval until shutdown.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut shutdown_rx = shutdown.subscribe();
        let _guard = DrainGuard::new(shutdown.clone());
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "TTL sweeper started");

        loop {
            if shutdown.is_shutting_down() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let moved = self.run_once();
                    if moved > 0 {
                        debug!(moved, "TTL sweep pass finished");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("TTL sweeper stopped");
    }
}

// ---------------------------------------------------------------------------
// ReviewPatrol
// ---------------------------------------------------------------------------

/// Periodic sweep over the review store: promotes pending requests past
/// their urgency SLA, flags overdue high-urgency requests, and purges
/// decided records past retention.
pub struct ReviewPatrol {
    hitl: Arc<HitlService>,
    interval: Duration,
}

impl ReviewPatrol {
    pub fn new(hitl: Arc<HitlService>, interval: Duration) -> Self {
        Self { hitl, interval }
    }

    /// One patrol pass.
    pub async fn run_once(&self) {
        let now = Utc::now();
        match self.hitl.run_promotion_sweep(now).await {
            Ok(report) => {
                if report.promoted_to_medium > 0
                    || report.promoted_to_high > 0
                    || !report.overdue_high.is_empty()
                {
                    info!(
                        promoted_to_medium = report.promoted_to_medium,
                        promoted_to_high = report.promoted_to_high,
                        overdue_high = report.overdue_high.len(),
                        "review patrol pass finished"
                    );
                }
            }
            Err(e) => error!(error = %e, "promotion sweep failed"),
        }
        if let Err(e) = self.hitl.purge_expired(now).await {
            error!(error = %e, "retention purge failed");
        }
    }

    /// Patrol on the configured interval until shutdown.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut shutdown_rx = shutdown.subscribe();
        let _guard = DrainGuard::new(shutdown.clone());
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "review patrol started");

        loop {
            if shutdown.is_shutting_down() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.run_once().await,
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("review patrol stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
