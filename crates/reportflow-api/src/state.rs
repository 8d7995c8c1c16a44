//! Engine context wiring every component together.
//!
//! `EngineContext` is the one place that owns the database pool, queue,
//! breaker registry, engine and scheduler. Components receive what they need
//! from it explicitly; nothing is global.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use reportflow_core::clock::{SharedClock, SystemClock};
use reportflow_core::event::EventBus;
use reportflow_core::queue::JobQueue;
use reportflow_core::repository::breaker::BoxBreakerStore;
use reportflow_core::resilience::{BreakerConfig, BreakerRegistry};
use reportflow_core::scheduler::Scheduler;
use reportflow_core::workflow::WorkflowEngine;
use reportflow_infra::config::{load_config, resolve_data_dir};
use reportflow_infra::sqlite::breaker::SqliteBreakerStore;
use reportflow_infra::sqlite::pool::{DatabasePool, default_database_url};
use reportflow_infra::sqlite::queue::SqliteQueueConnector;
use reportflow_infra::sqlite::schedule::SqliteScheduleRepository;
use reportflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use reportflow_infra::tools::default_tools;
use reportflow_types::config::ReportflowConfig;

/// Engine pinned to the SQLite workflow repository.
pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowRepository>;

/// Scheduler pinned to the SQLite schedule repository.
pub type ConcreteScheduler = Scheduler<SqliteScheduleRepository>;

#[derive(Clone)]
pub struct EngineContext {
    pub config: ReportflowConfig,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
    pub events: EventBus,
    pub queue: JobQueue,
    pub breakers: Arc<BreakerRegistry>,
    pub engine: Arc<ConcreteEngine>,
    pub scheduler: ConcreteScheduler,
}

impl EngineContext {
    /// Load configuration, open the database and wire all components.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;

        let db_url = default_database_url(&data_dir);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database at {db_url}"))?;

        let clock: SharedClock = Arc::new(SystemClock);
        let events = EventBus::default();

        // The queue may live in its own database; by default it shares the main one.
        let queue_url = config.queue.database_url.clone().unwrap_or(db_url);
        let queue = JobQueue::initialize(
            &SqliteQueueConnector::new(queue_url),
            config.queue.clone(),
            clock.clone(),
            events.clone(),
        )
        .await;

        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig::from(&config.breaker),
            BoxBreakerStore::new(SqliteBreakerStore::new(db_pool.clone())),
            clock.clone(),
            events.clone(),
        ));

        let tools = default_tools().context("failed to build step tools")?;
        let engine = WorkflowEngine::new(
            Arc::new(SqliteWorkflowRepository::new(db_pool.clone())),
            tools,
            breakers.clone(),
            events.clone(),
            clock.clone(),
            config.engine.clone(),
        )
        .with_queue(queue.clone(), config.scheduler.workflow_queue.clone());

        let scheduler = Scheduler::new(
            Arc::new(SqliteScheduleRepository::new(db_pool.clone())),
            queue.clone(),
            clock,
            events.clone(),
            config.scheduler.clone(),
        );

        Ok(Self {
            config,
            data_dir,
            db_pool,
            events,
            queue,
            breakers,
            engine: Arc::new(engine),
            scheduler,
        })
    }

    /// Queue that workflow runs are dispatched to.
    pub fn workflow_queue(&self) -> &str {
        &self.config.scheduler.workflow_queue
    }
}
