//! The execution driver.
//!
//! [`Orchestrator::drive`] takes the lease on one execution and runs it
//! forward: load the record, run the step its state calls for, feed the
//! outcome to [`transition`], persist the result with compare-and-swap,
//! then act on the returned [`Directive`]. The loop ends on a terminal
//! state, when a scheduled retry is too far away to wait for (the
//! execution is parked until the resume sweep finds it due), or when the
//! lease is lost.
//!
//! Steps run under the step timeout while a heartbeat renews the lease.
//! Backoff waits poll the record, so a cancellation ends them early.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::Instrument;

use level0_core::backoff::RetryPolicies;
use level0_core::error::{ErrorKind, NotifyError, StoreError, TransitionError};
use level0_core::machine::{transition, Directive, Event, Execution, ExecutionState, StepFailure};
use level0_core::models::ExecutionId;
use level0_core::ports::ExecutionStore;

use crate::config::Config;
use crate::import::ImportTransformer;
use crate::notify::NotificationEmitter;

/// Longest single sleep while waiting for a retry to come due.
const RETRY_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DriveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    /// The execution is terminal.
    Finished(Execution),
    /// A retry is scheduled beyond the inline wait window.
    Parked(Execution),
    /// Another driver holds the lease.
    Busy,
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(Execution),
    AlreadyTerminal(Execution),
    NotFound,
}

/// How a step run under [`Orchestrator::with_heartbeat`] ended.
enum Heartbeat<T> {
    Done(T),
    TimedOut(String),
    /// A renewal found another driver holding the lease; the step was dropped.
    LeaseLost,
}

/// The lease went to another driver mid-step.
struct LeaseLost;

#[derive(Debug, Clone)]
pub struct DriveSettings {
    pub policies: RetryPolicies,
    pub step_timeout: Duration,
    pub lease_ttl: Duration,
    pub max_inline_wait: Duration,
}

impl DriveSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policies: config.retry_policies(),
            step_timeout: config.step_timeout(),
            lease_ttl: config.lease_ttl(),
            max_inline_wait: config.max_inline_wait(),
        }
    }
}

impl Default for DriveSettings {
    fn default() -> Self {
        Self {
            policies: RetryPolicies::default(),
            step_timeout: Duration::from_secs(900),
            lease_ttl: Duration::from_secs(60),
            max_inline_wait: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    executions: Arc<dyn ExecutionStore>,
    importer: ImportTransformer,
    emitter: NotificationEmitter,
    settings: DriveSettings,
}

impl Orchestrator {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        importer: ImportTransformer,
        emitter: NotificationEmitter,
        settings: DriveSettings,
    ) -> Self {
        Self {
            executions,
            importer,
            emitter,
            settings,
        }
    }

    /// Same driver with a different inline wait window.
    pub fn with_max_inline_wait(mut self, wait: Duration) -> Self {
        self.settings.max_inline_wait = wait;
        self
    }

    pub fn executions(&self) -> &Arc<dyn ExecutionStore> {
        &self.executions
    }

    /// Drive one execution as far as it can go.
    pub async fn drive(&self, id: &ExecutionId) -> Result<DriveOutcome, DriveError> {
        let span = tracing::info_span!("execution", execution_id = %id);
        self.drive_leased(id).instrument(span).await
    }

    async fn drive_leased(&self, id: &ExecutionId) -> Result<DriveOutcome, DriveError> {
        let owner = uuid::Uuid::new_v4().to_string();
        if !self
            .executions
            .claim(id, &owner, self.settings.lease_ttl)
            .await?
        {
            return Ok(match self.executions.load(id).await? {
                None => DriveOutcome::NotFound,
                Some(e) if e.is_terminal() => DriveOutcome::Finished(e),
                Some(_) => {
                    tracing::debug!("lease held by another driver");
                    DriveOutcome::Busy
                }
            });
        }
        let result = self.drive_claimed(id, &owner).await;
        if let Err(e) = self.executions.release(id, &owner).await {
            tracing::warn!(error = %e, "failed to release execution lease");
        }
        result
    }

    async fn drive_claimed(&self, id: &ExecutionId, owner: &str) -> Result<DriveOutcome, DriveError> {
        loop {
            let Some(current) = self.executions.load(id).await? else {
                return Ok(DriveOutcome::NotFound);
            };
            if current.is_terminal() {
                return Ok(DriveOutcome::Finished(current));
            }

            if let Some(due) = current.retry_at {
                let now = Utc::now();
                if due > now {
                    let wait = (due - now).to_std().unwrap_or_default();
                    if wait > self.settings.max_inline_wait {
                        tracing::info!(retry_at = %due, state = %current.state, "parking until retry is due");
                        return Ok(DriveOutcome::Parked(current));
                    }
                    if !self.wait_for_retry(id, owner, due).await? {
                        return Ok(lost_lease());
                    }
                    continue;
                }
            }

            let event = match self.run_step(&current, owner).await {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(DriveOutcome::Finished(current)),
                Err(LeaseLost) => return Ok(lost_lease()),
            };
            let step = transition(&current, event, &self.settings.policies, Utc::now())?;
            if !self.executions.save(current.version, &step.execution).await? {
                tracing::debug!("record changed while the step ran; reloading");
                if !self
                    .executions
                    .claim(id, owner, self.settings.lease_ttl)
                    .await?
                {
                    return Ok(lost_lease());
                }
                continue;
            }
            log_transition(&current, &step.execution);

            match step.directive {
                Directive::Stop => {
                    let mut finished = step.execution;
                    finished.version = current.version + 1;
                    return Ok(DriveOutcome::Finished(finished));
                }
                Directive::RetryAfter(delay) => {
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "retry scheduled");
                }
                Directive::Route | Directive::Import | Directive::Notify => {}
            }

            if !self
                .executions
                .claim(id, owner, self.settings.lease_ttl)
                .await?
            {
                return Ok(lost_lease());
            }
        }
    }

    /// Run the step the current state calls for and report it as an event.
    /// Terminal states have no step.
    async fn run_step(&self, current: &Execution, owner: &str) -> Result<Option<Event>, LeaseLost> {
        let event = match current.state {
            ExecutionState::Pending => Event::Start,
            ExecutionState::Routing => match self.importer.route(&current.descriptor) {
                Some(_) => Event::Routed,
                None => Event::Unroutable {
                    file_type: current.descriptor.file_type.to_string(),
                },
            },
            ExecutionState::Importing => {
                let attempt = current.import_attempts + 1;
                let run = self.importer.import(&current.descriptor);
                let span = tracing::info_span!("import", object_key = %current.descriptor.object_key, attempt);
                match self
                    .with_heartbeat(&current.id, owner, run)
                    .instrument(span)
                    .await
                {
                    Heartbeat::Done(Ok(summary)) => Event::ImportSucceeded(summary),
                    Heartbeat::Done(Err(e)) => {
                        Event::ImportFailed(StepFailure::new(e.kind(), e.to_string()))
                    }
                    Heartbeat::TimedOut(elapsed) => {
                        Event::ImportFailed(StepFailure::new(ErrorKind::Timeout, elapsed))
                    }
                    Heartbeat::LeaseLost => return Err(LeaseLost),
                }
            }
            ExecutionState::Notifying => {
                let Some(summary) = current.summary.as_ref() else {
                    let e = NotifyError::MissingSummary;
                    return Ok(Some(Event::NotifyFailed(StepFailure::permanent(
                        e.kind(),
                        e.to_string(),
                    ))));
                };
                let attempt = current.notify_attempts + 1;
                let run = self.emitter.notify(summary);
                let span = tracing::info_span!("notify", object_key = %summary.object_key, attempt);
                match self
                    .with_heartbeat(&current.id, owner, run)
                    .instrument(span)
                    .await
                {
                    Heartbeat::Done(Ok(delivered)) => Event::NotifySucceeded { delivered },
                    Heartbeat::Done(Err(e)) if e.is_permanent() => {
                        Event::NotifyFailed(StepFailure::permanent(e.kind(), e.to_string()))
                    }
                    Heartbeat::Done(Err(e)) => {
                        Event::NotifyFailed(StepFailure::new(e.kind(), e.to_string()))
                    }
                    Heartbeat::TimedOut(elapsed) => {
                        Event::NotifyFailed(StepFailure::new(ErrorKind::Timeout, elapsed))
                    }
                    Heartbeat::LeaseLost => return Err(LeaseLost),
                }
            }
            ExecutionState::Succeeded | ExecutionState::Failed => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Run `step` under the step timeout, renewing the lease meanwhile.
    /// The step is abandoned as soon as a renewal finds the lease taken.
    async fn with_heartbeat<F>(&self, id: &ExecutionId, owner: &str, step: F) -> Heartbeat<F::Output>
    where
        F: Future,
    {
        let limit = self.settings.step_timeout;
        let step = tokio::time::timeout(limit, step);
        tokio::pin!(step);

        let period = (self.settings.lease_ttl / 3).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                out = &mut step => {
                    return match out {
                        Ok(output) => Heartbeat::Done(output),
                        Err(_) => Heartbeat::TimedOut(format!("step exceeded {}s", limit.as_secs_f64())),
                    };
                }
                _ = heartbeat.tick() => {
                    match self.executions.claim(id, owner, self.settings.lease_ttl).await {
                        Ok(true) => {}
                        Ok(false) => return Heartbeat::LeaseLost,
                        Err(e) => tracing::warn!(error = %e, "lease renewal failed"),
                    }
                }
            }
        }
    }

    /// Sleep until `due`, renewing the lease and watching the record.
    /// Returns false if the lease was lost.
    async fn wait_for_retry(
        &self,
        id: &ExecutionId,
        owner: &str,
        due: DateTime<Utc>,
    ) -> Result<bool, DriveError> {
        loop {
            let remaining = (due - Utc::now()).to_std().unwrap_or_default();
            if remaining.is_zero() {
                return Ok(true);
            }
            tokio::time::sleep(remaining.min(RETRY_POLL)).await;

            if !self
                .executions
                .claim(id, owner, self.settings.lease_ttl)
                .await?
            {
                return Ok(false);
            }
            match self.executions.load(id).await? {
                Some(e) if !e.is_terminal() && e.retry_at == Some(due) => {}
                _ => return Ok(true),
            }
        }
    }

    /// Cancel a non-terminal execution. Scheduled retries are dropped and
    /// a running driver stops at its next save.
    pub async fn cancel(&self, id: &ExecutionId, reason: &str) -> Result<CancelOutcome, DriveError> {
        loop {
            let Some(current) = self.executions.load(id).await? else {
                return Ok(CancelOutcome::NotFound);
            };
            if current.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(current));
            }
            let event = Event::Cancel {
                reason: reason.to_string(),
            };
            let step = transition(&current, event, &self.settings.policies, Utc::now())?;
            if self.executions.save(current.version, &step.execution).await? {
                tracing::info!(execution_id = %id, reason, "execution cancelled");
                let mut cancelled = step.execution;
                cancelled.version = current.version + 1;
                return Ok(CancelOutcome::Cancelled(cancelled));
            }
        }
    }

    /// Executions that need a driver: non-terminal, unleased and due.
    pub async fn resumable(&self, limit: usize) -> Result<Vec<ExecutionId>, StoreError> {
        self.executions.resumable(limit).await
    }
}

fn lost_lease() -> DriveOutcome {
    tracing::warn!("execution lease lost; leaving it to its new driver");
    DriveOutcome::Busy
}

fn log_transition(from: &Execution, to: &Execution) {
    match (&to.last_error, to.state) {
        (Some(err), ExecutionState::Failed) => tracing::warn!(
            object_key = %to.descriptor.object_key,
            from = %from.state,
            state = %to.state,
            attempt = to.attempt_count(),
            error_kind = %err.kind,
            error = %err.message,
            "execution failed"
        ),
        (Some(err), _) if to.retry_at.is_some() => tracing::info!(
            object_key = %to.descriptor.object_key,
            state = %to.state,
            attempt = to.attempt_count(),
            error_kind = %err.kind,
            retry_at = ?to.retry_at,
            "step failed; retry scheduled"
        ),
        _ => tracing::info!(
            object_key = %to.descriptor.object_key,
            from = %from.state,
            state = %to.state,
            attempt = to.attempt_count(),
            "transition"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationController;
    use level0_core::backoff::RetryPolicy;
    use level0_core::format::blocks::BlockKind;
    use level0_core::format::synth;
    use level0_core::models::{FileDescriptor, FileType, ImportSummary};
    use level0_core::ports::memory::{
        InMemoryExecutionStore, InMemoryImportSink, InMemoryObjectStore, RecordingDelivery,
    };
    use level0_core::models::NotificationEvent;
    use level0_core::ports::{Delivery, DeliveryError, StartOutcome};
    use level0_core::routing::ImportRouter;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    const KEY: &str = "L0/2024-01-01/0ce86a42.ac1";

    struct Harness {
        store: Arc<InMemoryExecutionStore>,
        objects: Arc<InMemoryObjectStore>,
        sink: Arc<InMemoryImportSink>,
        delivery: Arc<RecordingDelivery>,
        orchestrator: Orchestrator,
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 5,
            multiplier: 2.0,
            max_delay_ms: 20,
        }
    }

    fn harness_with(delivery: RecordingDelivery, settings: DriveSettings) -> Harness {
        let store = Arc::new(InMemoryExecutionStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let sink = Arc::new(InMemoryImportSink::new());
        let delivery = Arc::new(delivery);
        let importer = ImportTransformer::new(ImportRouter::standard(), objects.clone(), sink.clone());
        let mut emitter = NotificationEmitter::new(Arc::new(|s: &ImportSummary| {
            if s.file_type == FileType::Ac1 {
                vec!["level1".to_string()]
            } else {
                Vec::new()
            }
        }));
        emitter.register("level1", delivery.clone());
        let orchestrator = Orchestrator::new(store.clone(), importer, emitter, settings);
        Harness {
            store,
            objects,
            sink,
            delivery,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(
            RecordingDelivery::new(),
            DriveSettings {
                policies: RetryPolicies {
                    import: fast_policy(3),
                    notify: fast_policy(2),
                },
                ..DriveSettings::default()
            },
        )
    }

    async fn start(h: &Harness, key: &str, version: &str) -> ExecutionId {
        let d = FileDescriptor::new(key, version, Utc::now());
        let id = d.execution_id();
        h.store.start(&id, &d).await.unwrap();
        id
    }

    fn finished(outcome: DriveOutcome) -> Execution {
        match outcome {
            DriveOutcome::Finished(e) => e,
            other => panic!("expected a finished execution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_happy_path() {
        let h = harness();
        h.objects.put(KEY, "v1", synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 4));
        let id = start(&h, KEY, "v1").await;

        let e = finished(h.orchestrator.drive(&id).await.unwrap());
        assert_eq!(e.state, ExecutionState::Succeeded);
        assert_eq!(e.import_attempts, 1);
        assert_eq!(e.notify_attempts, 1);
        assert_eq!(e.summary.as_ref().unwrap().row_count, 4);
        assert_eq!(h.sink.row_count(FileType::Ac1), 4);
        assert_eq!(h.delivery.events().len(), 1);

        let stored = h.store.load(&id).await.unwrap().unwrap();
        assert_eq!(stored, e);

        // A terminal execution is left alone.
        let again = finished(h.orchestrator.drive(&id).await.unwrap());
        assert_eq!(again, e);
        assert_eq!(h.delivery.events().len(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_fails_without_attempts() {
        let h = harness();
        let id = start(&h, "L0/2024-01-01/notes.txt", "v1").await;
        let e = finished(h.orchestrator.drive(&id).await.unwrap());
        assert_eq!(e.state, ExecutionState::Failed);
        assert_eq!(e.last_error.unwrap().kind, ErrorKind::UnroutableFileType);
        assert_eq!(e.import_attempts, 0);
        assert_eq!(h.sink.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_import_failure_recovers() {
        let h = harness();
        h.objects.put(KEY, "v1", synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 2));
        h.objects.fail_next_reads(2);
        let id = start(&h, KEY, "v1").await;

        let e = finished(h.orchestrator.drive(&id).await.unwrap());
        assert_eq!(e.state, ExecutionState::Succeeded);
        assert_eq!(e.import_attempts, 3);
        assert_eq!(h.sink.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_import_retries_are_bounded() {
        let h = harness();
        h.objects.put(KEY, "v1", synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 2));
        h.objects.fail_next_reads(10);
        let id = start(&h, KEY, "v1").await;

        let e = finished(h.orchestrator.drive(&id).await.unwrap());
        assert_eq!(e.state, ExecutionState::Failed);
        assert_eq!(e.import_attempts, 3);
        assert_eq!(e.last_error.as_ref().unwrap().kind, ErrorKind::StoreUnavailable);
        assert!(e.summary.is_none());
        assert!(!e.is_partial_success());
    }

    #[tokio::test]
    async fn test_permanent_import_failure_is_not_retried() {
        let h = harness();
        h.objects.put(KEY, "v1", vec![0u8; 9]);
        let id = start(&h, KEY, "v1").await;

        let e = finished(h.orchestrator.drive(&id).await.unwrap());
        assert_eq!(e.state, ExecutionState::Failed);
        assert_eq!(e.import_attempts, 1);
        assert_eq!(e.last_error.unwrap().kind, ErrorKind::MalformedFile);
    }

    #[tokio::test]
    async fn test_notification_failure_is_partial_success() {
        let h = harness();
        h.delivery.fail_next(5);
        h.objects.put(KEY, "v1", synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 2));
        let id = start(&h, KEY, "v1").await;

        let e = finished(h.orchestrator.drive(&id).await.unwrap());
        assert_eq!(e.state, ExecutionState::Failed);
        assert_eq!(e.notify_attempts, 2);
        assert!(e.is_partial_success());
        assert_eq!(e.last_error.as_ref().unwrap().kind, ErrorKind::NotificationFailed);
        assert_eq!(h.sink.row_count(FileType::Ac1), 2);
    }

    #[tokio::test]
    async fn test_rejection_fails_notify_immediately() {
        let h = harness_with(RecordingDelivery::rejecting(), DriveSettings::default());
        h.objects.put(KEY, "v1", synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 1));
        let id = start(&h, KEY, "v1").await;

        let e = finished(h.orchestrator.drive(&id).await.unwrap());
        assert!(e.is_partial_success());
        assert_eq!(e.notify_attempts, 1);
    }

    #[tokio::test]
    async fn test_distant_retry_parks() {
        let h = harness_with(
            RecordingDelivery::new(),
            DriveSettings {
                max_inline_wait: Duration::from_millis(1),
                ..DriveSettings::default()
            },
        );
        h.objects.put(KEY, "v1", synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 1));
        h.objects.fail_next_reads(1);
        let id = start(&h, KEY, "v1").await;

        match h.orchestrator.drive(&id).await.unwrap() {
            DriveOutcome::Parked(e) => {
                assert_eq!(e.state, ExecutionState::Importing);
                assert_eq!(e.import_attempts, 1);
                assert!(e.retry_at.is_some());
            }
            other => panic!("expected parked, got {:?}", other),
        }
        assert!(h.orchestrator.resumable(10).await.unwrap().is_empty());

        let cancelled = h.orchestrator.cancel(&id, "operator").await.unwrap();
        match cancelled {
            CancelOutcome::Cancelled(e) => {
                assert_eq!(e.state, ExecutionState::Failed);
                assert!(e.retry_at.is_none());
                assert_eq!(e.last_error.unwrap().kind, ErrorKind::Cancelled);
            }
            other => panic!("expected cancelled, got {:?}", other),
        }
        assert!(matches!(
            h.orchestrator.cancel(&id, "again").await.unwrap(),
            CancelOutcome::AlreadyTerminal(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff_wait() {
        let h = harness_with(
            RecordingDelivery::new(),
            DriveSettings {
                policies: RetryPolicies {
                    import: RetryPolicy {
                        max_attempts: 3,
                        base_delay_ms: 60_000,
                        multiplier: 2.0,
                        max_delay_ms: 120_000,
                    },
                    notify: fast_policy(2),
                },
                ..DriveSettings::default()
            },
        );
        h.objects.fail_next_reads(1);
        h.objects.put(KEY, "v1", synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 1));
        let id = start(&h, KEY, "v1").await;

        let driver = h.orchestrator.clone();
        let driven = id.clone();
        let task = tokio::spawn(async move { driver.drive(&driven).await });

        loop {
            let e = h.store.load(&id).await.unwrap().unwrap();
            if e.retry_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.orchestrator.cancel(&id, "operator").await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let e = finished(outcome);
        assert_eq!(e.last_error.unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(h.sink.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_when_leased_elsewhere() {
        let h = harness();
        let id = start(&h, KEY, "v1").await;
        h.store.claim(&id, "someone", Duration::from_secs(60)).await.unwrap();
        assert_eq!(h.orchestrator.drive(&id).await.unwrap(), DriveOutcome::Busy);

        let missing = ExecutionId::derive("L0/none.ac1", "v1");
        assert_eq!(h.orchestrator.drive(&missing).await.unwrap(), DriveOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_redelivered_arrival_is_a_no_op() {
        let h = harness();
        h.objects.put(KEY, "v1", synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 3));
        let controller = ActivationController::new(h.store.clone());
        let raw = serde_json::json!({
            "object_key": KEY,
            "object_version": "v1"
        })
        .to_string();

        let activations = controller.activate(&raw).await.unwrap();
        let id = activations[0].started().unwrap().clone();
        finished(h.orchestrator.drive(&id).await.unwrap());

        let again = controller.activate(&raw).await.unwrap();
        assert!(again[0].started().is_none());
        finished(h.orchestrator.drive(&id).await.unwrap());
        assert_eq!(h.sink.row_count(FileType::Ac1), 3);
        assert_eq!(h.sink.commit_count(), 1);
        assert_eq!(h.delivery.events().len(), 1);
    }

    /// Execution store whose lease can be handed to another driver: once
    /// taken, claims by anyone else and their saves both lose.
    struct ContestedStore {
        inner: InMemoryExecutionStore,
        taken: AtomicBool,
    }

    #[async_trait]
    impl ExecutionStore for ContestedStore {
        async fn start(
            &self,
            id: &ExecutionId,
            descriptor: &FileDescriptor,
        ) -> Result<StartOutcome, StoreError> {
            self.inner.start(id, descriptor).await
        }

        async fn load(&self, id: &ExecutionId) -> Result<Option<Execution>, StoreError> {
            self.inner.load(id).await
        }

        async fn save(&self, expected_version: i64, execution: &Execution) -> Result<bool, StoreError> {
            if self.taken.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.save(expected_version, execution).await
        }

        async fn claim(&self, id: &ExecutionId, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
            if self.taken.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.claim(id, owner, ttl).await
        }

        async fn release(&self, id: &ExecutionId, owner: &str) -> Result<(), StoreError> {
            self.inner.release(id, owner).await
        }

        async fn list(
            &self,
            state: Option<ExecutionState>,
            limit: usize,
        ) -> Result<Vec<Execution>, StoreError> {
            self.inner.list(state, limit).await
        }

        async fn resumable(&self, limit: usize) -> Result<Vec<ExecutionId>, StoreError> {
            self.inner.resumable(limit).await
        }
    }

    /// Hands the lease away on every delivery, then takes `delay` to finish.
    struct TakeoverDelivery {
        store: Arc<ContestedStore>,
        delay: Duration,
        calls: AtomicU32,
        completed: AtomicU32,
    }

    #[async_trait]
    impl Delivery for TakeoverDelivery {
        async fn deliver(&self, _event: &NotificationEvent) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.store.taken.store(true, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn contested(delay: Duration) -> (Arc<ContestedStore>, Arc<TakeoverDelivery>, ExecutionId, Orchestrator) {
        let store = Arc::new(ContestedStore {
            inner: InMemoryExecutionStore::new(),
            taken: AtomicBool::new(false),
        });
        let objects = Arc::new(InMemoryObjectStore::new());
        objects.put(KEY, "v1", synth::ac_file(BlockKind::Ac1, 0x0ce86a42, 2));
        let delivery = Arc::new(TakeoverDelivery {
            store: store.clone(),
            delay,
            calls: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        });
        let importer = ImportTransformer::new(
            ImportRouter::standard(),
            objects,
            Arc::new(InMemoryImportSink::new()),
        );
        let mut emitter = NotificationEmitter::new(Arc::new(|_: &ImportSummary| vec!["level1".to_string()]));
        emitter.register("level1", delivery.clone());
        let settings = DriveSettings {
            lease_ttl: Duration::from_millis(60),
            ..DriveSettings::default()
        };
        let orchestrator = Orchestrator::new(store.clone(), importer, emitter, settings);

        let d = FileDescriptor::new(KEY, "v1", Utc::now());
        let id = d.execution_id();
        store.start(&id, &d).await.unwrap();
        (store, delivery, id, orchestrator)
    }

    #[tokio::test]
    async fn test_lease_taken_mid_step_abandons_the_step() {
        let (store, delivery, id, orchestrator) = contested(Duration::from_secs(5)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), orchestrator.drive(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, DriveOutcome::Busy);
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.completed.load(Ordering::SeqCst), 0);

        let e = store.load(&id).await.unwrap().unwrap();
        assert_eq!(e.state, ExecutionState::Notifying);
        assert_eq!(e.notify_attempts, 0);
    }

    #[tokio::test]
    async fn test_lost_save_does_not_rerun_the_step() {
        let (store, delivery, id, orchestrator) = contested(Duration::ZERO).await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), orchestrator.drive(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, DriveOutcome::Busy);
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.completed.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.load(&id).await.unwrap().unwrap().state,
            ExecutionState::Notifying
        );
    }
}
