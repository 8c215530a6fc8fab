//! Services container and process lifecycle
//!
//! Everything with state is constructed here once, at startup, and handed
//! to consumers through constructors; there are no process-wide singletons.
//! One shutdown signal fans out to every background task, and `shutdown()`
//! flushes what can be flushed before the process exits.

use crate::agent::AgentApi;
use crate::api::AppState;
use crate::auth::AuthService;
use crate::config::Config;
use crate::error::AppResult;
use crate::filelog::FileLog;
use crate::hub::FanoutHub;
use crate::ingest::Ingestor;
use crate::metrics::Aggregator;
use crate::query::QuerySurface;
use crate::store::Store;
use crate::supervisor::SupervisorManager;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How often the raw SSE event buffer is purged
const EVENT_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Everything the process runs on
pub struct Services {
    pub config: Config,
    pub store: Store,
    pub filelog: Arc<FileLog>,
    pub hub: FanoutHub,
    pub aggregator: Arc<Aggregator>,
    pub ingestor: Arc<Ingestor>,
    pub agent: AgentApi,
    pub supervisors: Arc<SupervisorManager>,
    pub auth: AuthService,
    pub query: QuerySurface,
    shutdown_tx: watch::Sender<bool>,
}

impl Services {
    /// Construct the full object graph; no tasks are spawned yet
    pub fn init(config: Config) -> Result<Arc<Self>> {
        let store = Store::open(&config.db_path)
            .map_err(|e| anyhow::anyhow!("open store: {e}"))?;
        let filelog =
            Arc::new(FileLog::new(config.filelog.clone()).context("init file log ring")?);
        let hub = FanoutHub::new(config.hub.buffer_capacity);
        let aggregator = Arc::new(Aggregator::new(store.clone(), config.metrics.flush_grace));
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            filelog.clone(),
            hub.clone(),
            aggregator.clone(),
        ));
        let agent = AgentApi::new()?;
        let supervisors = Arc::new(SupervisorManager::new(
            store.clone(),
            agent.clone(),
            ingestor.clone(),
            config.supervisor.clone(),
        ));
        let auth = AuthService::new(store.clone(), config.auth.clone());
        let query = QuerySurface::new(store.clone(), filelog.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            filelog,
            hub,
            aggregator,
            ingestor,
            agent,
            supervisors,
            auth,
            query,
            shutdown_tx,
        }))
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn the background tasks and connect every stored endpoint
    pub fn start_background(self: &Arc<Self>) -> AppResult<()> {
        // Aggregator stale-bucket sweep
        tokio::spawn(
            self.aggregator
                .clone()
                .run(self.config.metrics.tick_interval, self.shutdown_receiver()),
        );

        // File-log retention cleanup
        if self.config.filelog.enabled {
            tokio::spawn(self.filelog.clone().run_cleanup_task(self.shutdown_receiver()));
        }

        // Raw SSE event purge
        {
            let store = self.store.clone();
            let retention = self.config.events.clone();
            let mut shutdown = self.shutdown_receiver();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(EVENT_PURGE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let store = store.clone();
                            let retention = retention.clone();
                            let result = tokio::task::spawn_blocking(move || {
                                store
                                    .purge_sse_events(retention.retention_days, retention.max_per_day)
                                    .and_then(|stats| {
                                        store.prune_orphan_history().map(|orphans| (stats, orphans))
                                    })
                            })
                            .await;
                            if let Ok(Err(e)) = result {
                                tracing::warn!("SSE event purge failed: {}", e);
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // One supervisor per stored endpoint
        self.supervisors.start_all()
    }

    /// Build the HTTP state handed to the router
    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            query: self.query.clone(),
            hub: self.hub.clone(),
            hub_config: self.config.hub.clone(),
            agent: self.agent.clone(),
            supervisors: self.supervisors.clone(),
            filelog: self.filelog.clone(),
            auth: self.auth.clone(),
        }
    }

    /// Orderly shutdown: stop streams, flush open minute buckets and logs
    pub fn shutdown(&self) {
        tracing::info!("Shutting down services");
        self.supervisors.shutdown_all();
        let _ = self.shutdown_tx.send(true);
        self.aggregator.flush_all();
        if let Err(e) = self.filelog.sync() {
            tracing::warn!("File log flush on shutdown failed: {}", e);
        }
        tracing::info!("Services shut down");
    }
}
