//! Assembly of the engine: one value owning every subsystem, created at
//! startup and handed to the HTTP layer and the background loops.

use std::sync::Arc;

use anyhow::Context;
use foreman_core::model::SystemStatus;
use foreman_core::{Config, Result};

use crate::alarm::{channels_from_config, AlarmEngine};
use crate::broker::{Broker, PgBroker};
use crate::flag::ShutdownFlag;
use crate::health::HealthMonitor;
use crate::manager::QueueManager;
use crate::registry::TaskRegistry;
use crate::store::{status, Store};
use crate::worker::{Worker, WorkerBuilder};

pub struct Engine {
    config: Config,
    store: Store,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    manager: Arc<QueueManager>,
    health: Arc<HealthMonitor>,
    alarms: Arc<AlarmEngine>,
    shutdown: Arc<crate::shutdown::ShutdownController>,
}

impl Engine {
    /// Connect to the database, apply migrations, seed the default queue
    /// and the status row, and assemble all subsystems.
    pub async fn connect(config: Config, registry: Arc<TaskRegistry>) -> anyhow::Result<Self> {
        let store = Store::connect(&config.database)
            .await
            .context("failed to connect to the database")?;

        store
            .migrate()
            .await
            .context("failed to migrate the database")?;

        let engine = Self::assemble(config, store, registry);

        status::init(
            engine.store.pool(),
            env!("CARGO_PKG_VERSION"),
            &engine.config.environment,
        )
        .await
        .context("failed to initialize the system status row")?;

        engine
            .manager
            .ensure_default_queue()
            .await
            .context("failed to create the default queue")?;

        tracing::info!(environment = %engine.config.environment, "engine initialized");
        Ok(engine)
    }

    /// Wire the subsystems over an existing store without touching the
    /// schema or seed rows. Useful for tests and read-only tools.
    pub fn assemble(config: Config, store: Store, registry: Arc<TaskRegistry>) -> Self {
        let flag = ShutdownFlag::new();
        let shutdown = Arc::new(crate::shutdown::ShutdownController::new(
            store.clone(),
            flag,
        ));

        let channels = channels_from_config(&config.alerts);
        let alarms = Arc::new(AlarmEngine::new(
            store.clone(),
            config.clone(),
            channels,
            shutdown.clone(),
        ));

        let broker: Arc<dyn Broker> = Arc::new(PgBroker::new(store.pool().clone()));

        let manager = Arc::new(QueueManager::new(
            store.clone(),
            broker.clone(),
            config.clone(),
        ));
        manager.add_observer(alarms.clone());

        let health = Arc::new(HealthMonitor::new(
            store.clone(),
            registry.clone(),
            config.clone(),
        ));

        Self {
            config,
            store,
            registry,
            broker,
            manager,
            health,
            alarms,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn alarms(&self) -> &Arc<AlarmEngine> {
        &self.alarms
    }

    pub fn shutdown(&self) -> &Arc<crate::shutdown::ShutdownController> {
        &self.shutdown
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.flag().clone()
    }

    /// Spawn the two monitoring loops. They stop when the shutdown flag is
    /// raised.
    pub fn start_monitoring(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let flag = self.shutdown_flag();

        vec![
            tokio::spawn(self.manager.clone().run_monitor(flag.clone())),
            tokio::spawn(self.health.clone().run(self.alarms.clone(), flag)),
        ]
    }

    /// Build a worker bound to this engine's store, registry, and alarm
    /// engine.
    pub async fn build_worker(&self) -> anyhow::Result<Worker> {
        WorkerBuilder::new(self.store.pool().clone(), self.registry.clone())
            .config(self.config.clone())
            .alarms(self.alarms.clone())
            .build()
            .await
    }

    pub async fn system_status(&self) -> Result<Option<SystemStatus>> {
        Ok(status::get(self.store.pool()).await?)
    }
}
