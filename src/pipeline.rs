//! Wiring of the production pipeline from configuration.
//!
//! ```text
//! arrival_queue ──▶ ActivationController ──▶ executions
//!                                               │
//!                         Orchestrator ◀────────┘
//!                          │        │
//!               ImportTransformer  NotificationEmitter
//!                 │          │          │
//!           ObjectStore  SqliteImportSink  Outbox / Webhook
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use level0_core::models::FileDescriptor;
use level0_core::ports::{ExecutionStore, ObjectStore};
use level0_core::routing::ImportRouter;

use crate::activation::ActivationController;
use crate::buffer::SqliteBuffer;
use crate::config::Config;
use crate::executions::SqliteExecutionStore;
use crate::import::ImportTransformer;
use crate::notify::{build_emitter, OutboxDelivery};
use crate::orchestrator::{DriveOutcome, DriveSettings, Orchestrator};
use crate::sqlite_store::SqliteImportSink;
use crate::storage::build_object_store;
use crate::worker::{Worker, WorkerSettings};
use crate::{db, migrate};

/// Retries are always waited for when importing a single file by hand.
const INTERACTIVE_INLINE_WAIT: Duration = Duration::from_secs(u32::MAX as u64);

#[derive(Clone)]
pub struct Pipeline {
    pub config: Config,
    pub pool: SqlitePool,
    pub objects: Arc<dyn ObjectStore>,
    pub buffer: SqliteBuffer,
    pub executions: SqliteExecutionStore,
    pub sink: SqliteImportSink,
    pub activation: ActivationController,
    pub orchestrator: Orchestrator,
}

impl Pipeline {
    /// Connect to the database (creating the schema if needed) and build
    /// every component from `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let objects = build_object_store(config)?;
        Self::from_parts(config, pool, objects)
    }

    /// Build the pipeline over an existing pool and object store.
    pub fn from_parts(config: &Config, pool: SqlitePool, objects: Arc<dyn ObjectStore>) -> Result<Self> {
        let buffer = SqliteBuffer::new(
            pool.clone(),
            config.visibility_timeout(),
            config.buffer.max_receive_count,
        );
        let executions = SqliteExecutionStore::new(pool.clone());
        let sink = SqliteImportSink::new(pool.clone());
        let importer = ImportTransformer::new(
            ImportRouter::standard(),
            Arc::clone(&objects),
            Arc::new(sink.clone()),
        );
        let emitter = build_emitter(config, &pool)?;
        let store: Arc<dyn ExecutionStore> = Arc::new(executions.clone());
        let activation = ActivationController::new(Arc::clone(&store));
        let orchestrator = Orchestrator::new(
            store,
            importer,
            emitter,
            DriveSettings::from_config(config),
        );

        Ok(Self {
            config: config.clone(),
            pool,
            objects,
            buffer,
            executions,
            sink,
            activation,
            orchestrator,
        })
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            Arc::new(self.buffer.clone()),
            self.activation.clone(),
            self.orchestrator.clone(),
            WorkerSettings::from_config(&self.config),
        )
    }

    pub fn outbox(&self) -> OutboxDelivery {
        OutboxDelivery::new(self.pool.clone())
    }

    /// Start (or find) the execution for one stored file and drive it to
    /// the end, waiting through any retries.
    pub async fn import_one(&self, object_key: &str, object_version: &str) -> Result<DriveOutcome> {
        let descriptor = FileDescriptor::new(object_key, object_version, Utc::now());
        let id = descriptor.execution_id();
        let outcome = self.executions.start(&id, &descriptor).await?;
        if !outcome.created {
            tracing::info!(execution_id = %id, state = %outcome.execution.state, "execution exists");
        }
        let driver = self
            .orchestrator
            .clone()
            .with_max_inline_wait(INTERACTIVE_INLINE_WAIT);
        Ok(driver.drive(&id).await?)
    }
}
