//! Re-announcing stored files.
//!
//! `level0 resend <prefix>` lists the objects under `<type>/<prefix>` for
//! every file type and enqueues one synthetic S3 event per object, so files
//! that are already in storage go through the pipeline again. Objects are
//! announced with their entity tag, which makes a re-announcement of an
//! unchanged file activate the execution that already exists.

use anyhow::{bail, Result};

use level0_core::event::synthetic_s3_event;
use level0_core::models::FileType;
use level0_core::ports::ObjectStore;

use crate::buffer::SqliteBuffer;

/// Listing order of the file types.
pub const RESEND_ORDER: [FileType; 5] = [
    FileType::Ac2,
    FileType::Ac1,
    FileType::Att,
    FileType::Shk,
    FileType::Fba,
];

/// A satellite-time prefix: exactly three hex digits.
pub fn parse_prefix(raw: &str) -> Result<String> {
    let prefix = raw.trim();
    if prefix.len() != 3 || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!(
            "stw prefix must be a three-digit hex value, e.g. 001 or 39a (got '{}')",
            raw
        );
    }
    Ok(prefix.to_string())
}

/// Enqueue an arrival event for every stored object under `prefix`.
/// Returns the number of messages enqueued.
pub async fn resend_prefix(
    objects: &dyn ObjectStore,
    buffer: &SqliteBuffer,
    bucket: &str,
    prefix: &str,
) -> Result<usize> {
    let prefix = parse_prefix(prefix)?;
    let mut sent = 0;
    for file_type in RESEND_ORDER {
        let listed = objects
            .list(&format!("{}/{}", file_type.extension(), prefix))
            .await?;
        for object in listed {
            let event = synthetic_s3_event(bucket, &object.key, object.etag.as_deref(), object.size);
            buffer.enqueue(&event.to_string()).await?;
            sent += 1;
        }
        tracing::debug!(file_type = %file_type, prefix = %prefix, sent, "listed objects");
    }
    Ok(sent)
}
