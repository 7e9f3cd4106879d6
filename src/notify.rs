//! The notification step.
//!
//! [`NotificationEmitter`] asks a [`SubscriberPolicy`] which subscribers
//! care about an import and sends each one a [`NotificationEvent`] through
//! the [`Delivery`] registered under its id. Two deliveries ship here:
//!
//! - [`OutboxDelivery`] appends the event to the `notifications` table;
//! - [`WebhookDelivery`] POSTs the event as JSON.
//!
//! Subscribers come from `[[subscribers]]` via [`ConfiguredSubscribers`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sqlx::{Row, SqlitePool};

use level0_core::error::{NotifyError, StoreError};
use level0_core::models::{FileType, ImportSummary, NotificationEvent};
use level0_core::ports::{Delivery, DeliveryError, SubscriberPolicy};

use crate::config::{Config, SubscriberConfig};
use crate::db::store_error;

#[derive(Clone)]
pub struct NotificationEmitter {
    policy: Arc<dyn SubscriberPolicy>,
    deliveries: HashMap<String, Arc<dyn Delivery>>,
}

impl NotificationEmitter {
    pub fn new(policy: Arc<dyn SubscriberPolicy>) -> Self {
        Self {
            policy,
            deliveries: HashMap::new(),
        }
    }

    pub fn register(&mut self, subscriber_id: &str, delivery: Arc<dyn Delivery>) -> &mut Self {
        self.deliveries.insert(subscriber_id.to_string(), delivery);
        self
    }

    /// Notify every selected subscriber. Returns how many were notified.
    ///
    /// Subscribers are resolved before anything is sent, so a missing
    /// delivery fails the step without partial sends.
    pub async fn notify(&self, summary: &ImportSummary) -> Result<usize, NotifyError> {
        let mut targets = Vec::new();
        for id in self.policy.select(summary) {
            let delivery = self
                .deliveries
                .get(&id)
                .ok_or_else(|| NotifyError::UnknownSubscriber(id.clone()))?;
            targets.push((id, Arc::clone(delivery)));
        }

        let now = Utc::now();
        for (id, delivery) in &targets {
            let event = NotificationEvent::for_summary(id, summary, now);
            match delivery.deliver(&event).await {
                Ok(()) => {
                    tracing::debug!(subscriber = %id, object_key = %summary.object_key, "notified");
                }
                Err(DeliveryError::Rejected(reason)) => {
                    return Err(NotifyError::Rejected {
                        subscriber: id.clone(),
                        reason,
                    })
                }
                Err(DeliveryError::Transient(reason)) => {
                    return Err(NotifyError::Undelivered {
                        subscriber: id.clone(),
                        reason,
                    })
                }
            }
        }
        Ok(targets.len())
    }
}

// ── Subscriber selection ────────────────────────────────────────────────

struct Subscription {
    id: String,
    file_types: HashSet<FileType>,
    keys: Option<GlobSet>,
}

/// Subscriber policy read from configuration: a subscriber is selected when
/// the file type is in its list and, if it has key globs, the object key
/// matches one of them.
pub struct ConfiguredSubscribers {
    subscriptions: Vec<Subscription>,
}

impl ConfiguredSubscribers {
    pub fn from_config(subscribers: &[SubscriberConfig]) -> Result<Self> {
        let mut subscriptions = Vec::with_capacity(subscribers.len());
        for sub in subscribers {
            let mut file_types = HashSet::new();
            for ft in &sub.file_types {
                file_types.insert(
                    ft.parse::<FileType>()
                        .map_err(|e| anyhow::anyhow!("subscriber '{}': {}", sub.id, e))?,
                );
            }
            let keys = if sub.key_globs.is_empty() {
                None
            } else {
                Some(build_globset(&sub.key_globs)?)
            };
            subscriptions.push(Subscription {
                id: sub.id.clone(),
                file_types,
                keys,
            });
        }
        Ok(Self { subscriptions })
    }
}

impl SubscriberPolicy for ConfiguredSubscribers {
    fn select(&self, summary: &ImportSummary) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|s| s.file_types.contains(&summary.file_type))
            .filter(|s| {
                s.keys
                    .as_ref()
                    .map_or(true, |set| set.is_match(&summary.object_key))
            })
            .map(|s| s.id.clone())
            .collect()
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

// ── Deliveries ──────────────────────────────────────────────────────────

/// Appends events to the `notifications` table for consumers that poll.
#[derive(Clone)]
pub struct OutboxDelivery {
    pool: SqlitePool,
}

impl OutboxDelivery {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Events in the outbox, oldest first, optionally for one subscriber.
    pub async fn events(&self, subscriber: Option<&str>) -> Result<Vec<NotificationEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT payload FROM notifications WHERE (?1 IS NULL OR subscriber_id = ?1) ORDER BY id",
        )
        .bind(subscriber)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter()
            .map(|row| {
                serde_json::from_str(&row.get::<String, _>("payload"))
                    .map_err(|e| StoreError::Corrupt(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl Delivery for OutboxDelivery {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let payload =
            serde_json::to_string(event).map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO notifications (subscriber_id, trigger_object_key, trigger_object_version,
                                       file_type, row_count, payload, emitted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.subscriber_id)
        .bind(&event.trigger_object_key)
        .bind(&event.trigger_object_version)
        .bind(event.file_type.to_string())
        .bind(event.row_count as i64)
        .bind(&payload)
        .bind(event.emitted_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| DeliveryError::Transient(e.to_string()))?;
        Ok(())
    }
}

/// POSTs events as JSON. Client errors other than 408 and 429 are
/// permanent rejections; everything else is retried.
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let reason = format!("{} responded {}: {}", self.url, status, body);
        if status.is_client_error() && status.as_u16() != 408 && status.as_u16() != 429 {
            Err(DeliveryError::Rejected(reason))
        } else {
            Err(DeliveryError::Transient(reason))
        }
    }
}

/// Build the emitter described by `[[subscribers]]`.
pub fn build_emitter(config: &Config, pool: &SqlitePool) -> Result<NotificationEmitter> {
    let policy = ConfiguredSubscribers::from_config(&config.subscribers)?;
    let mut emitter = NotificationEmitter::new(Arc::new(policy));
    for sub in &config.subscribers {
        let delivery: Arc<dyn Delivery> = match sub.delivery.as_str() {
            "outbox" => Arc::new(OutboxDelivery::new(pool.clone())),
            "webhook" => {
                let url = sub
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("subscriber '{}' has no url", sub.id))?;
                Arc::new(WebhookDelivery::new(url, config.step_timeout())?)
            }
            other => bail!("subscriber '{}': unknown delivery '{}'", sub.id, other),
        };
        emitter.register(&sub.id, delivery);
    }
    Ok(emitter)
}
