//! Turning arrival notifications into executions.
//!
//! Every object in a notification maps to the deterministic id
//! `ExecutionId::derive(key, version)` and a create-if-absent start, so a
//! notification delivered twice starts one execution. A buffered message
//! is acknowledged once all its objects are started (or already existed);
//! on an infrastructure error it goes back to the buffer for redelivery.
//! Messages that cannot be decoded are acknowledged and dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use level0_core::error::StoreError;
use level0_core::event::decode_notification;
use level0_core::models::ExecutionId;
use level0_core::ports::{ArrivalBuffer, BufferedMessage, ExecutionStore};

/// Outcome of activating one object.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    Started(ExecutionId),
    /// An execution with this id exists already, in whatever state.
    AlreadyExists(ExecutionId),
    Discarded(String),
}

impl Activation {
    pub fn started(&self) -> Option<&ExecutionId> {
        match self {
            Activation::Started(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ActivationController {
    executions: Arc<dyn ExecutionStore>,
    release_delay: Duration,
}

impl ActivationController {
    pub fn new(executions: Arc<dyn ExecutionStore>) -> Self {
        Self {
            executions,
            release_delay: Duration::from_secs(5),
        }
    }

    /// How long a message that hit a store error stays hidden.
    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    /// Start an execution for every object announced in `raw`.
    ///
    /// # Errors
    ///
    /// A [`StoreError`] from the execution store. Objects started before
    /// the error stay started; activating the same message again is safe.
    pub async fn activate(&self, raw: &str) -> Result<Vec<Activation>, StoreError> {
        let records = match decode_notification(raw) {
            Ok(records) => records,
            Err(e) => return Ok(vec![Activation::Discarded(e.to_string())]),
        };

        let received_at = Utc::now();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let descriptor = record.into_descriptor(received_at);
            let id = descriptor.execution_id();
            let outcome = self.executions.start(&id, &descriptor).await?;
            if outcome.created {
                tracing::info!(
                    execution_id = %id,
                    object_key = %descriptor.object_key,
                    object_version = %descriptor.object_version,
                    "execution started"
                );
                out.push(Activation::Started(id));
            } else {
                tracing::debug!(
                    execution_id = %id,
                    state = %outcome.execution.state,
                    "duplicate activation"
                );
                out.push(Activation::AlreadyExists(id));
            }
        }
        Ok(out)
    }

    /// Activate a batch received from the buffer, acknowledging or
    /// releasing each message. Returns the newly started executions.
    ///
    /// A failed ack or release is logged and the batch carries on; the
    /// message comes back after its visibility timeout and activates as a
    /// duplicate.
    pub async fn process(
        &self,
        buffer: &dyn ArrivalBuffer,
        messages: Vec<BufferedMessage>,
    ) -> Vec<ExecutionId> {
        let mut started = Vec::new();
        for message in messages {
            match self.activate(&message.body).await {
                Ok(activations) => {
                    for activation in &activations {
                        if let Activation::Discarded(reason) = activation {
                            tracing::warn!(
                                receive_count = message.receive_count,
                                reason = %reason,
                                "discarding undecodable arrival notification"
                            );
                        }
                    }
                    if let Err(e) = buffer.ack(&message.receipt).await {
                        tracing::warn!(
                            receive_count = message.receive_count,
                            error = %e,
                            "failed to acknowledge arrival message"
                        );
                    }
                    started.extend(activations.iter().filter_map(Activation::started).cloned());
                }
                Err(e) => {
                    tracing::warn!(
                        receive_count = message.receive_count,
                        error = %e,
                        "activation failed; returning message to the buffer"
                    );
                    if let Err(e) = buffer.release(&message.receipt, self.release_delay).await {
                        tracing::warn!(error = %e, "failed to release arrival message");
                    }
                }
            }
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use level0_core::event::synthetic_s3_event;
    use level0_core::machine::ExecutionState;
    use level0_core::ports::memory::{InMemoryBuffer, InMemoryExecutionStore};

    const KEY: &str = "L0/2024-01-01/0ce86a42.ac1";

    fn event(version: &str) -> String {
        serde_json::json!({
            "Records": [{
                "eventTime": "2024-01-01T12:00:00.000Z",
                "s3": {
                    "bucket": { "name": "odin-l0" },
                    "object": { "key": KEY, "versionId": version, "size": 10 }
                }
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_activation_is_idempotent() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let controller = ActivationController::new(store.clone());

        let first = controller.activate(&event("v1")).await.unwrap();
        let id = ExecutionId::derive(KEY, "v1");
        assert_eq!(first, vec![Activation::Started(id.clone())]);

        let second = controller.activate(&event("v1")).await.unwrap();
        assert_eq!(second, vec![Activation::AlreadyExists(id.clone())]);
        assert_eq!(store.len(), 1);
        let stored = store.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExecutionState::Pending);
        assert_eq!(stored.descriptor.size, Some(10));

        let other = controller.activate(&event("v2")).await.unwrap();
        assert!(matches!(other[0], Activation::Started(_)));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_every_record_starts_an_execution() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let controller = ActivationController::new(store.clone());
        let a = synthetic_s3_event("odin-l0", "L0/a/00000001.fba", Some("\"aa\""), 1);
        let b = synthetic_s3_event("odin-l0", "L0/a/00000002.fba", None, 1);
        let raw = serde_json::json!({
            "Records": [a["Records"][0].clone(), b["Records"][0].clone()]
        })
        .to_string();

        let activations = controller.activate(&raw).await.unwrap();
        assert_eq!(activations.len(), 2);
        assert!(activations.iter().all(|a| a.started().is_some()));
        assert!(store
            .load(&ExecutionId::derive("L0/a/00000001.fba", "etag:aa"))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .load(&ExecutionId::derive("L0/a/00000002.fba", "null"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_process_acks_releases_and_discards() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let controller =
            ActivationController::new(store.clone()).with_release_delay(Duration::ZERO);
        let buffer = InMemoryBuffer::new(Duration::from_secs(3600), 4);
        buffer.push(event("v1"));
        buffer.push("not json");

        store.fail_next_starts(1);
        let messages = buffer.receive(10).await.unwrap();
        let started = controller.process(&buffer, messages).await;
        assert!(started.is_empty());
        assert_eq!(buffer.len(), 1, "undecodable message is acked, failed one kept");

        let messages = buffer.receive(10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].receive_count, 2);
        let started = controller.process(&buffer, messages).await;
        assert_eq!(started, vec![ExecutionId::derive(KEY, "v1")]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_failed_ack_does_not_strand_the_batch() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let controller = ActivationController::new(store.clone());
        let buffer = InMemoryBuffer::new(Duration::from_secs(3600), 4);
        for version in ["v1", "v2", "v3"] {
            buffer.push(event(version));
        }

        buffer.fail_next_acks(1);
        let messages = buffer.receive(10).await.unwrap();
        let started = controller.process(&buffer, messages).await;
        assert_eq!(started.len(), 3);
        assert_eq!(store.len(), 3);
        // Only the message whose ack failed is still waiting for redelivery.
        assert_eq!(buffer.len(), 1);
    }
}
