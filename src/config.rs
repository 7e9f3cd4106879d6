//! Configuration parsing and validation.
//!
//! Settings are read from a TOML file (default `./config/level0.toml`).
//! Every section except `[db]` and `[storage]` has defaults, so a minimal
//! file is:
//!
//! ```toml
//! [db]
//! path = "./data/level0.sqlite"
//!
//! [storage]
//! backend = "filesystem"
//! root = "./data/level0"
//! ```
//!
//! Without any `[[subscribers]]` entry, the `level1` consumer is
//! subscribed to spectrum files (`ac1`, `ac2`) through the outbox.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use level0_core::backoff::{RetryPolicies, RetryPolicy};
use level0_core::models::FileType;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_subscribers")]
    pub subscribers: Vec<SubscriberConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `filesystem` or `s3`.
    pub backend: String,
    /// Root directory of the filesystem mirror.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    /// Deliveries before a message moves to the dead-letter table.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout(),
            max_receive_count: default_max_receive_count(),
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_visibility_timeout() -> u64 {
    43200
}
fn default_max_receive_count() -> u32 {
    4
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestrationConfig {
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_executions: usize,
    /// Retries due within this window are waited for by the driving task;
    /// later ones are parked and picked up by the resume sweep.
    #[serde(default = "default_max_inline_wait")]
    pub max_inline_wait_secs: u64,
    #[serde(default = "RetryPolicy::import_default")]
    pub import_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::notify_default")]
    pub notify_retry: RetryPolicy,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            lease_ttl_secs: default_lease_ttl(),
            max_parallel_executions: default_max_parallel(),
            max_inline_wait_secs: default_max_inline_wait(),
            import_retry: RetryPolicy::import_default(),
            notify_retry: RetryPolicy::notify_default(),
        }
    }
}

fn default_step_timeout() -> u64 {
    900
}
fn default_lease_ttl() -> u64 {
    60
}
fn default_max_parallel() -> usize {
    8
}
fn default_max_inline_wait() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7420".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriberConfig {
    pub id: String,
    /// File type extensions this subscriber wants (`ac1`, `fba`, ...).
    pub file_types: Vec<String>,
    /// Optional object-key globs; when set, a key must match one of them.
    #[serde(default)]
    pub key_globs: Vec<String>,
    /// `outbox` or `webhook`.
    #[serde(default = "default_delivery")]
    pub delivery: String,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_delivery() -> String {
    "outbox".to_string()
}

fn default_subscribers() -> Vec<SubscriberConfig> {
    vec![SubscriberConfig {
        id: "level1".to_string(),
        file_types: vec!["ac1".to_string(), "ac2".to_string()],
        key_globs: Vec::new(),
        delivery: default_delivery(),
        url: None,
    }]
}

impl Config {
    /// A filesystem-backed configuration with every other setting at its
    /// default.
    pub fn minimal(db_path: PathBuf, storage_root: PathBuf) -> Self {
        Self {
            db: DbConfig { path: db_path },
            storage: StorageConfig {
                backend: "filesystem".to_string(),
                root: Some(storage_root),
                bucket: None,
                region: default_region(),
                endpoint_url: None,
            },
            buffer: BufferConfig::default(),
            orchestration: OrchestrationConfig::default(),
            server: ServerConfig::default(),
            subscribers: default_subscribers(),
        }
    }

    pub fn retry_policies(&self) -> RetryPolicies {
        RetryPolicies {
            import: self.orchestration.import_retry.clone(),
            notify: self.orchestration.notify_retry.clone(),
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestration.step_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.orchestration.lease_ttl_secs)
    }

    pub fn max_inline_wait(&self) -> Duration {
        Duration::from_secs(self.orchestration.max_inline_wait_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.buffer.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.buffer.poll_interval_ms)
    }

    /// Check cross-field rules that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        match self.storage.backend.as_str() {
            "filesystem" => {
                if self.storage.root.is_none() {
                    bail!("storage.root is required for the filesystem backend");
                }
            }
            "s3" => {
                if self.storage.bucket.as_deref().map_or(true, str::is_empty) {
                    bail!("storage.bucket is required for the s3 backend");
                }
            }
            other => bail!(
                "Unknown storage backend: '{}'. Must be filesystem or s3.",
                other
            ),
        }

        if self.buffer.max_receive_count == 0 {
            bail!("buffer.max_receive_count must be >= 1");
        }
        if self.buffer.batch_size == 0 {
            bail!("buffer.batch_size must be >= 1");
        }
        if self.orchestration.step_timeout_secs == 0 {
            bail!("orchestration.step_timeout_secs must be > 0");
        }
        if self.orchestration.lease_ttl_secs == 0 {
            bail!("orchestration.lease_ttl_secs must be > 0");
        }
        if self.orchestration.max_parallel_executions == 0 {
            bail!("orchestration.max_parallel_executions must be >= 1");
        }
        self.orchestration
            .import_retry
            .validate()
            .map_err(|e| anyhow::anyhow!("orchestration.import_retry: {}", e))?;
        self.orchestration
            .notify_retry
            .validate()
            .map_err(|e| anyhow::anyhow!("orchestration.notify_retry: {}", e))?;

        let mut ids = HashSet::new();
        for sub in &self.subscribers {
            if sub.id.trim().is_empty() {
                bail!("subscriber id must not be empty");
            }
            if !ids.insert(sub.id.as_str()) {
                bail!("duplicate subscriber id '{}'", sub.id);
            }
            for ft in &sub.file_types {
                ft.parse::<FileType>()
                    .map_err(|e| anyhow::anyhow!("subscriber '{}': {}", sub.id, e))?;
            }
            match sub.delivery.as_str() {
                "outbox" => {}
                "webhook" => {
                    if sub.url.as_deref().map_or(true, str::is_empty) {
                        bail!("subscriber '{}' uses webhook delivery but has no url", sub.id);
                    }
                }
                other => bail!(
                    "subscriber '{}': unknown delivery '{}'. Must be outbox or webhook.",
                    sub.id,
                    other
                ),
            }
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
