use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sy_bridge::http_api::{api_router, ApiState};
use sy_bridge::ingest::IngestService;
use sy_broker::QueueRegistry;
use sy_core::config::EngineConfig;
use sy_core::shutdown::ShutdownSignal;
use sy_escalation::EscalationEngine;
use sy_events::EventLog;
use sy_hitl::{HitlDb, HitlService};
use sy_worker::{TaskProcessor, Worker};
use tracing::{info, warn};

use crate::patrol::{ReviewPatrol, TtlSweeper};

/// The assembled engine: queue registry, event log, review service, the
/// escalation engine, and every background loop.
///
/// Construction validates the whole topology up front; anything conflicting
/// is fatal before a single envelope moves. `run()` spawns the workers,
/// the sweeps, and the HTTP API, then parks until shutdown and drains.
pub struct Daemon {
    config: EngineConfig,
    registry: Arc<QueueRegistry>,
    events: EventLog,
    hitl: Arc<HitlService>,
    escalation: EscalationEngine,
    shutdown: ShutdownSignal,
    processors: HashMap<String, Arc<dyn TaskProcessor>>,
}

impl Daemon {
    /// Build the engine, opening (or creating) the review store from config.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate().context("invalid engine configuration")?;
        let db = if config.hitl.store_path == ":memory:" {
            HitlDb::new_in_memory().await
        } else {
            HitlDb::new(&config.hitl.store_path).await
        }
        .context("failed to open review store")?;
        Self::with_store(config, db)
    }

    /// Build the engine around an already-open review store.
    pub fn with_store(config: EngineConfig, db: HitlDb) -> Result<Self> {
        config.validate().context("invalid engine configuration")?;
        let registry =
            Arc::new(QueueRegistry::from_config(&config.broker).context("queue topology")?);
        let events = EventLog::new();
        let hitl = Arc::new(HitlService::new(
            db,
            events.clone(),
            Arc::clone(&registry),
            config.hitl.clone(),
        ));
        let escalation = EscalationEngine::new(config.escalation.clone());
        Ok(Self {
            config,
            registry,
            events,
            hitl,
            escalation,
            shutdown: ShutdownSignal::new(),
            processors: HashMap::new(),
        })
    }

    /// Bind a task processor to a declared queue. Workers spawn only for
    /// queues that have one.
    pub fn register_processor(&mut self, queue: &str, processor: Arc<dyn TaskProcessor>) {
        self.processors.insert(queue.to_string(), processor);
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn hitl(&self) -> &Arc<HitlService> {
        &self.hitl
    }

    fn api_state(&self) -> Arc<ApiState> {
        let ingest = Arc::new(IngestService::new(
            Arc::clone(&self.registry),
            self.escalation.clone(),
            Arc::clone(&self.hitl),
            self.config.broker.clone(),
        ));
        Arc::new(ApiState::new(
            Arc::clone(&self.hitl),
            Arc::clone(&self.registry),
            ingest,
        ))
    }

    /// Spawn workers, sweeps, and the API server; returns the bound API
    /// port and the number of drain participants.
    async fn start(&self, bind: &str) -> Result<(u16, usize)> {
        let mut drain_participants = 0;

        // Workers, per queue configuration.
        for queue_cfg in &self.config.broker.queues {
            let Some(processor) = self.processors.get(&queue_cfg.name) else {
                continue;
            };
            let queue = self
                .registry
                .get(&queue_cfg.name)
                .with_context(|| format!("queue '{}' not declared", queue_cfg.name))?;
            for _ in 0..queue_cfg.workers {
                Worker::new(
                    Arc::clone(&queue),
                    Arc::clone(processor),
                    Arc::clone(&self.hitl),
                    self.events.clone(),
                    self.escalation.clone(),
                    self.config.worker.max_attempts,
                )
                .spawn(self.shutdown.clone());
                drain_participants += 1;
            }
        }
        if drain_participants == 0 {
            warn!("no task processors registered; queues will only feed the review surface");
        }

        // Background sweeps.
        let sweeper = TtlSweeper::new(
            Arc::clone(&self.registry),
            Duration::from_secs(self.config.broker.sweep_interval_secs),
        );
        tokio::spawn(sweeper.run(self.shutdown.clone()));
        drain_participants += 1;

        let patrol = ReviewPatrol::new(
            Arc::clone(&self.hitl),
            Duration::from_secs(self.config.hitl.patrol_interval_secs),
        );
        tokio::spawn(patrol.run(self.shutdown.clone()));
        drain_participants += 1;

        // HTTP API.
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind API server on {bind}"))?;
        let port = listener.local_addr().context("no local addr")?.port();
        let router = api_router(self.api_state());
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let mut rx = shutdown.subscribe();
                let _ = rx.recv().await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "API server error");
            }
        });

        info!(port, "engine started");
        Ok((port, drain_participants))
    }

    /// Start everything in embedded mode on an OS-assigned port and return
    /// it immediately. The caller owns shutdown.
    pub async fn start_embedded(&self) -> Result<u16> {
        let (port, _) = self.start("127.0.0.1:0").await?;
        Ok(port)
    }

    /// Run until the shutdown signal fires, then drain.
    pub async fn run(&self) -> Result<()> {
        let bind = format!("{}:{}", self.config.bridge.bind, self.config.bridge.port);
        let (_, drain_participants) = self.start(&bind).await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        if !self.shutdown.is_shutting_down() {
            let _ = shutdown_rx.recv().await;
        }

        info!("shutting down, waiting for drain");
        let mut shutdown = self.shutdown.clone();
        shutdown
            .wait_for_drain(drain_participants, Duration::from_secs(10))
            .await;
        info!("engine stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
