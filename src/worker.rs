//! The pipeline worker: poll the arrival buffer, activate, and drive
//! executions concurrently.
//!
//! Each execution runs in its own task, bounded by a semaphore of
//! `max_parallel_executions` permits. Every pass also sweeps for resumable
//! executions (lease expired or retry due), so work interrupted by a crash
//! or parked on a long backoff is picked up again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use level0_core::machine::ExecutionState;
use level0_core::models::ExecutionId;
use level0_core::ports::ArrivalBuffer;

use crate::activation::ActivationController;
use crate::config::Config;
use crate::orchestrator::{DriveError, DriveOutcome, Orchestrator};

/// Executions picked up per resume sweep.
const RESUME_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_parallel: usize,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.buffer.batch_size,
            poll_interval: config.poll_interval(),
            max_parallel: config.orchestration.max_parallel_executions,
        }
    }
}

/// What a worker run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub messages: usize,
    pub started: usize,
    pub driven: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub parked: usize,
    pub errors: usize,
}

pub struct Worker {
    buffer: Arc<dyn ArrivalBuffer>,
    activation: ActivationController,
    orchestrator: Orchestrator,
    settings: WorkerSettings,
}

type Driven = (ExecutionId, Result<DriveOutcome, DriveError>);

impl Worker {
    pub fn new(
        buffer: Arc<dyn ArrivalBuffer>,
        activation: ActivationController,
        orchestrator: Orchestrator,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            buffer,
            activation,
            orchestrator,
            settings,
        }
    }

    /// Run until interrupted, or with `once` until the buffer is drained
    /// and every execution found has been driven as far as it can go.
    pub async fn run(&self, once: bool) -> Result<RunReport> {
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut tasks: JoinSet<Driven> = JoinSet::new();
        let mut in_flight: HashSet<ExecutionId> = HashSet::new();
        let mut seen: HashSet<ExecutionId> = HashSet::new();
        let mut report = RunReport::default();

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            while let Some(joined) = tasks.try_join_next() {
                record(joined, &mut in_flight, &mut report);
            }

            let mut queue = Vec::new();
            let mut received = 0;
            match self.buffer.receive(self.settings.batch_size).await {
                Ok(messages) => {
                    received = messages.len();
                    report.messages += received;
                    let started = self.activation.process(&*self.buffer, messages).await;
                    report.started += started.len();
                    queue.extend(started);
                }
                Err(e) => tracing::warn!(error = %e, "arrival buffer unavailable"),
            }
            match self.orchestrator.resumable(RESUME_BATCH).await {
                Ok(ids) => queue.extend(ids),
                Err(e) => tracing::warn!(error = %e, "resume sweep failed"),
            }

            let mut spawned = 0;
            for id in queue {
                if in_flight.contains(&id) || (once && seen.contains(&id)) {
                    continue;
                }
                let permit = Arc::clone(&permits).acquire_owned().await?;
                let orchestrator = self.orchestrator.clone();
                in_flight.insert(id.clone());
                seen.insert(id.clone());
                spawned += 1;
                tasks.spawn(async move {
                    let outcome = orchestrator.drive(&id).await;
                    drop(permit);
                    (id, outcome)
                });
            }

            if once {
                match tasks.join_next().await {
                    Some(joined) => record(joined, &mut in_flight, &mut report),
                    None if spawned == 0 && received == 0 => break,
                    None => {}
                }
                continue;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(in_flight = in_flight.len(), "shutting down worker");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record(joined, &mut in_flight, &mut report);
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        // Interrupted drivers keep their records; the resume sweep of the
        // next run continues them once their leases lapse.
        tasks.shutdown().await;
        Ok(report)
    }
}

fn record(
    joined: Result<Driven, tokio::task::JoinError>,
    in_flight: &mut HashSet<ExecutionId>,
    report: &mut RunReport,
) {
    let (id, outcome) = match joined {
        Ok(driven) => driven,
        Err(e) => {
            tracing::error!(error = %e, "execution task panicked");
            report.errors += 1;
            return;
        }
    };
    in_flight.remove(&id);
    report.driven += 1;
    match outcome {
        Ok(DriveOutcome::Finished(e)) if e.state == ExecutionState::Succeeded => {
            report.succeeded += 1
        }
        Ok(DriveOutcome::Finished(_)) => report.failed += 1,
        Ok(DriveOutcome::Parked(_)) => report.parked += 1,
        Ok(DriveOutcome::Busy) | Ok(DriveOutcome::NotFound) => {}
        Err(e) => {
            tracing::error!(execution_id = %id, error = %e, "driving execution failed");
            report.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::ImportTransformer;
    use crate::notify::NotificationEmitter;
    use crate::orchestrator::DriveSettings;
    use level0_core::format::blocks::BlockKind;
    use level0_core::format::synth;
    use level0_core::models::ImportSummary;
    use level0_core::ports::memory::{
        InMemoryBuffer, InMemoryExecutionStore, InMemoryImportSink, InMemoryObjectStore,
    };
    use level0_core::routing::ImportRouter;

    #[tokio::test]
    async fn test_failed_ack_keeps_the_worker_running() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let sink = Arc::new(InMemoryImportSink::new());
        let buffer = Arc::new(InMemoryBuffer::new(Duration::from_secs(3600), 4));
        for key in ["L0/a/0ce80001.fba", "L0/a/0ce80002.fba"] {
            objects.put(key, "v1", synth::fba_file(0x0ce80000, 2));
            buffer.push(
                serde_json::json!({ "object_key": key, "object_version": "v1" }).to_string(),
            );
        }
        buffer.fail_next_acks(1);

        let importer = ImportTransformer::new(ImportRouter::standard(), objects, sink.clone());
        let emitter = NotificationEmitter::new(Arc::new(|_: &ImportSummary| Vec::<String>::new()));
        let orchestrator =
            Orchestrator::new(store.clone(), importer, emitter, DriveSettings::default());
        let worker = Worker::new(
            buffer.clone(),
            ActivationController::new(store),
            orchestrator,
            WorkerSettings {
                batch_size: 10,
                poll_interval: Duration::from_millis(10),
                max_parallel: 2,
            },
        );

        let report = worker.run(true).await.unwrap();
        assert_eq!(report.messages, 2);
        assert_eq!(report.started, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.errors, 0);
        assert_eq!(sink.commit_count(), 2);
        assert_eq!(buffer.len(), 1);
    }
}
