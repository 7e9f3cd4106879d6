//! Collaborator traits the pipeline is wired against.
//!
//! Each external system the pipeline talks to is a trait here, so the
//! same components run against production adapters (SQLite, S3, HTTP) in
//! the `odin-level0` crate or against the in-memory doubles in
//! [`memory`].
//!
//! | Trait | Stands in for |
//! |-------|---------------|
//! | [`ObjectStore`] | Raw file storage (versioned objects) |
//! | [`ArrivalBuffer`] | Durable queue of arrival notifications |
//! | [`ExecutionStore`] | Workflow engine: durable execution records |
//! | [`ImportSink`] | Relational store of measurement rows |
//! | [`Delivery`] | Downstream messaging for one subscriber |
//! | [`SubscriberPolicy`] | Which subscribers care about an import |
//!
//! Async traits use `async-trait` and must be `Send + Sync`.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::error::{ReadError, StoreError};
use crate::format::rows::MeasurementRows;
use crate::machine::{Execution, ExecutionState};
use crate::models::{ExecutionId, FileDescriptor, FileType, ImportSummary, NotificationEvent};

/// One object returned by [`ObjectStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredObject {
    pub key: String,
    pub etag: Option<String>,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read one version of an object.
    ///
    /// A version that no longer exists is [`ReadError::NotFound`], never an
    /// empty payload.
    async fn read(&self, key: &str, version: &str) -> Result<Vec<u8>, ReadError>;

    /// List current objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, ReadError>;
}

/// A message handed out by [`ArrivalBuffer::receive`].
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage {
    /// Opaque handle for ack/release.
    pub receipt: String,
    pub body: String,
    /// How many times this message has been handed out, this time included.
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Durable at-least-once queue between object storage and activation.
///
/// A received message stays invisible until it is acknowledged, released,
/// or its visibility timeout lapses.
#[async_trait]
pub trait ArrivalBuffer: Send + Sync {
    async fn receive(&self, max: usize) -> Result<Vec<BufferedMessage>, StoreError>;

    /// Delete a message for good.
    async fn ack(&self, receipt: &str) -> Result<(), StoreError>;

    /// Make a message visible again after `delay`.
    async fn release(&self, receipt: &str, delay: Duration) -> Result<(), StoreError>;
}

/// Result of [`ExecutionStore::start`].
#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    /// The stored execution: new, or whatever already existed under the id.
    pub execution: Execution,
    pub created: bool,
}

/// Durable execution records.
///
/// Updates use compare-and-swap on [`Execution::version`]; records in a
/// terminal state are never modified again.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create the execution if no record exists under `id`.
    async fn start(
        &self,
        id: &ExecutionId,
        descriptor: &FileDescriptor,
    ) -> Result<StartOutcome, StoreError>;

    async fn load(&self, id: &ExecutionId) -> Result<Option<Execution>, StoreError>;

    /// Replace the stored record if its version is still `expected_version`
    /// and it is not terminal. On success the stored version becomes
    /// `expected_version + 1`. Returns false on a lost race.
    async fn save(&self, expected_version: i64, execution: &Execution)
        -> Result<bool, StoreError>;

    /// Take or renew the driving lease. False if another owner holds an
    /// unexpired lease.
    async fn claim(
        &self,
        id: &ExecutionId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn release(&self, id: &ExecutionId, owner: &str) -> Result<(), StoreError>;

    /// Executions ordered by most recently updated first.
    async fn list(
        &self,
        state: Option<ExecutionState>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Non-terminal executions that have no live lease and no retry
    /// scheduled in the future.
    async fn resumable(&self, limit: usize) -> Result<Vec<ExecutionId>, StoreError>;
}

/// Rows produced from one file, written as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBatch {
    pub source_object_key: String,
    pub source_object_version: String,
    pub file_type: FileType,
    pub rows: MeasurementRows,
    pub import_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { rows: u64 },
    /// The (key, version) pair was committed before; nothing was written.
    AlreadyCommitted,
}

/// Idempotent writer keyed by (`source_object_key`, `source_object_version`).
#[async_trait]
pub trait ImportSink: Send + Sync {
    async fn commit(&self, batch: &ImportBatch) -> Result<CommitOutcome, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Sends notification events to one downstream consumer.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError>;
}

/// Maps an import to the ids of the subscribers to notify.
pub trait SubscriberPolicy: Send + Sync {
    fn select(&self, summary: &ImportSummary) -> Vec<String>;
}

impl<F> SubscriberPolicy for F
where
    F: Fn(&ImportSummary) -> Vec<String> + Send + Sync,
{
    fn select(&self, summary: &ImportSummary) -> Vec<String> {
        self(summary)
    }
}
