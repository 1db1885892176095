//! Wiring of the job service.
//!
//! [`App::build`] connects to Redis and assembles the components; [`App::start`] brings
//! the schema up to date and launches every background loop; [`App::shutdown`] cancels
//! them and waits until they are gone.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::rds::{KeySpace, RedisPool};
use crate::config::Config;
use crate::error::{JobServiceError, Result};
use crate::hook::{Agent, HookClient};
use crate::job::HookCallback;
use crate::jobs::register_builtins;
use crate::lcm::Controller;
use crate::migration::{MigrationManager, Outcome, PolicyMigratorV181};
use crate::period::{PeriodicEnqueuer, PolicyStore, Scheduler};
use crate::runner::RedisJobRunner;
use crate::worker::{BasicWorker, Registry, WorkerPool};

pub struct App {
    keys: KeySpace,
    redis: RedisPool,
    agent: Arc<Agent>,
    controller: Arc<Controller>,
    worker: Arc<BasicWorker>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Connect to Redis and assemble the components. Built-in jobs are registered;
    /// more can be added through [`App::worker`] until [`App::start`].
    pub async fn build(config: &Config) -> Result<Self> {
        config.validate()?;

        let redis = tokio::time::timeout(
            config.redis.connect_timeout,
            RedisPool::connect(&config.redis.url),
        )
        .await
        .map_err(|_| {
            JobServiceError::internal(format!("Timed out connecting to {}", config.redis.url))
        })??;

        let keys = KeySpace::new(config.redis.namespace.clone());

        let agent = Arc::new(Agent::new(
            keys.clone(),
            redis.clone(),
            HookClient::new(&config.hook)?,
        ));
        let callback: Arc<dyn HookCallback> = agent.clone();
        let controller = Arc::new(Controller::new(
            keys.clone(),
            redis.clone(),
            Some(callback),
            config.lifecycle.clone(),
        ));

        let store = Arc::new(PolicyStore::new(keys.clone(), redis.clone()));
        let periodic = Arc::new(PeriodicEnqueuer::new(
            keys.clone(),
            redis.clone(),
            Arc::clone(&store),
            Arc::clone(&controller),
            config.period.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            keys.clone(),
            redis.clone(),
            store,
            periodic,
            Arc::clone(&controller),
        ));

        let registry = Arc::new(Registry::new());
        register_builtins(&registry)?;

        let runner = Arc::new(RedisJobRunner::new(Arc::clone(&controller), Arc::clone(&registry)));
        let pool = Arc::new(WorkerPool::new(
            config.worker_pool.pool_id.clone(),
            config.worker_pool.workers,
            keys.clone(),
            redis.clone(),
            Arc::clone(&registry),
            runner,
        ));
        let worker = Arc::new(BasicWorker::new(
            keys.clone(),
            redis.clone(),
            registry,
            pool,
            Arc::clone(&controller),
            scheduler,
        ));

        tracing::info!(
            namespace = %keys.namespace(),
            pool_id = %worker.pool_id(),
            workers = config.worker_pool.workers,
            "Job service assembled"
        );

        Ok(Self {
            keys,
            redis,
            agent,
            controller,
            worker,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn worker(&self) -> &Arc<BasicWorker> {
        &self.worker
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn redis(&self) -> &RedisPool {
        &self.redis
    }

    /// Token cancelled by [`App::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Upgrade the persisted data to the current schema version.
    pub async fn migrate(&self) -> Result<Outcome> {
        let mut manager = MigrationManager::new(self.keys.clone(), self.redis.clone());
        manager.register(Box::new(PolicyMigratorV181::new(self.keys.clone(), self.redis.clone())));
        manager.migrate().await
    }

    /// Migrate, then launch the hook agent, the lifecycle retry loop and the worker.
    pub async fn start(&self) -> Result<()> {
        let outcome = self.migrate().await?;
        tracing::info!(outcome = ?outcome, "Data migration done");

        let mut handles = vec![
            self.agent.serve(self.shutdown.clone()),
            self.controller.serve(self.shutdown.clone()),
        ];
        handles.extend(self.worker.start(self.shutdown.clone()).await?);

        let count = handles.len();
        self.handles.lock().extend(handles);
        tracing::info!(tasks = count, "Job service started");
        Ok(())
    }

    /// Cancel every loop and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Job service stopped");
    }
}
