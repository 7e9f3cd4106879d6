//! The import step: read one file version, verify it, parse it with the
//! branch registered for its type, and commit the rows.
//!
//! Parsing is CPU-bound and runs on the blocking pool. Commits go through
//! [`ImportSink`], which is idempotent per (key, version), so a retried or
//! replayed import never duplicates rows.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use level0_core::error::ImportError;
use level0_core::models::{FileDescriptor, ImportSummary};
use level0_core::ports::{CommitOutcome, ImportBatch, ImportSink, ObjectStore};
use level0_core::routing::{ImportBranch, ImportRouter};

#[derive(Clone)]
pub struct ImportTransformer {
    router: ImportRouter,
    objects: Arc<dyn ObjectStore>,
    sink: Arc<dyn ImportSink>,
}

impl ImportTransformer {
    pub fn new(router: ImportRouter, objects: Arc<dyn ObjectStore>, sink: Arc<dyn ImportSink>) -> Self {
        Self {
            router,
            objects,
            sink,
        }
    }

    pub fn router(&self) -> &ImportRouter {
        &self.router
    }

    /// The branch for a descriptor, if its file type is routable.
    pub fn route(&self, descriptor: &FileDescriptor) -> Option<Arc<dyn ImportBranch>> {
        self.router.route(&descriptor.file_type)
    }

    pub async fn import(&self, descriptor: &FileDescriptor) -> Result<ImportSummary, ImportError> {
        let branch = self
            .route(descriptor)
            .ok_or_else(|| ImportError::Unroutable(descriptor.file_type.to_string()))?;
        let file_type = branch.file_type();

        let bytes = self
            .objects
            .read(&descriptor.object_key, &descriptor.object_version)
            .await?;
        verify(descriptor, &bytes)?;

        let file_name = descriptor.file_name().to_string();
        let parse_branch = Arc::clone(&branch);
        let rows = tokio::task::spawn_blocking(move || parse_branch.parse(&file_name, &bytes))
            .await
            .map_err(|e| ImportError::StoreUnavailable(format!("parser task failed: {}", e)))??;

        let batch = ImportBatch {
            source_object_key: descriptor.object_key.clone(),
            source_object_version: descriptor.object_version.clone(),
            file_type,
            rows,
            import_timestamp: Utc::now(),
        };
        let outcome = self.sink.commit(&batch).await?;
        let newly_committed = matches!(outcome, CommitOutcome::Committed { .. });

        tracing::debug!(
            object_key = %descriptor.object_key,
            file_type = %file_type,
            rows = batch.rows.len(),
            newly_committed,
            "import committed"
        );
        Ok(batch.rows.summarize(descriptor, file_type, newly_committed))
    }
}

/// Check the announced size and SHA-256, when the arrival carried them.
fn verify(descriptor: &FileDescriptor, bytes: &[u8]) -> Result<(), ImportError> {
    if let Some(size) = descriptor.size {
        if size != bytes.len() as u64 {
            return Err(ImportError::ChecksumMismatch(format!(
                "expected {} bytes, read {}",
                size,
                bytes.len()
            )));
        }
    }
    if let Some(expected) = &descriptor.checksum_sha256 {
        let actual = hex::encode(Sha256::digest(bytes));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ImportError::ChecksumMismatch(format!(
                "expected sha256 {}, got {}",
                expected, actual
            )));
        }
    }
    Ok(())
}
