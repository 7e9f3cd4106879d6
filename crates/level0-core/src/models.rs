//! Core data models for the Level 0 pipeline.
//!
//! These types flow through every stage: an arrival becomes a
//! [`FileDescriptor`], the import produces an [`ImportSummary`], and the
//! notification stage emits one [`NotificationEvent`] per subscriber.
//!
//! # File Types
//!
//! | Extension | [`FileType`] | [`FileCategory`] |
//! |-----------|--------------|------------------|
//! | `.ac1`    | `Ac1`        | spectrum         |
//! | `.ac2`    | `Ac2`        | spectrum         |
//! | `.fba`    | `Fba`        | mechanism        |
//! | `.shk`    | `Shk`        | housekeeping     |
//! | `.att`    | `Att`        | attitude         |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ═══════════════════════════════════════════════════════════════════════
// File types
// ═══════════════════════════════════════════════════════════════════════

/// The closed set of Level 0 file types the pipeline knows how to import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Ac1,
    Ac2,
    Fba,
    Shk,
    Att,
}

impl FileType {
    pub const ALL: [FileType; 5] = [
        FileType::Ac1,
        FileType::Ac2,
        FileType::Fba,
        FileType::Shk,
        FileType::Att,
    ];

    /// The object-key extension (without the dot) for this type.
    pub fn extension(self) -> &'static str {
        match self {
            FileType::Ac1 => "ac1",
            FileType::Ac2 => "ac2",
            FileType::Fba => "fba",
            FileType::Shk => "shk",
            FileType::Att => "att",
        }
    }

    pub fn category(self) -> FileCategory {
        match self {
            FileType::Ac1 | FileType::Ac2 => FileCategory::Spectrum,
            FileType::Fba => FileCategory::Mechanism,
            FileType::Shk => FileCategory::Housekeeping,
            FileType::Att => FileCategory::Attitude,
        }
    }

    /// Look up a type by extension. Matching is case-insensitive.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let lower = ext.to_ascii_lowercase();
        FileType::ALL
            .into_iter()
            .find(|t| t.extension() == lower.as_str())
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileType::from_extension(s).ok_or_else(|| format!("unknown file type '{}'", s))
    }
}

/// Data category served by a file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Spectrum,
    Mechanism,
    Housekeeping,
    Attitude,
}

impl FileCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FileCategory::Spectrum => "spectrum",
            FileCategory::Mechanism => "mechanism",
            FileCategory::Housekeeping => "housekeeping",
            FileCategory::Attitude => "attitude",
        }
    }
}

/// The file type derived from an object key.
///
/// Keys whose extension is not a known [`FileType`] are carried as
/// `Unrecognized` so the execution can fail with an explicit routing
/// error instead of being dropped at activation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileKind {
    Known(FileType),
    Unrecognized(String),
}

impl FileKind {
    /// Derive the kind from the extension of the key's last path segment.
    pub fn from_object_key(key: &str) -> Self {
        let name = key.rsplit('/').next().unwrap_or(key);
        let ext = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext,
            _ => "",
        };
        FileKind::from_label(ext)
    }

    pub fn from_label(label: &str) -> Self {
        match FileType::from_extension(label) {
            Some(t) => FileKind::Known(t),
            None => FileKind::Unrecognized(label.to_string()),
        }
    }

    pub fn known(&self) -> Option<FileType> {
        match self {
            FileKind::Known(t) => Some(*t),
            FileKind::Unrecognized(_) => None,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Known(t) => write!(f, "{}", t),
            FileKind::Unrecognized(label) => f.write_str(label),
        }
    }
}

impl From<String> for FileKind {
    fn from(label: String) -> Self {
        FileKind::from_label(&label)
    }
}

impl From<FileKind> for String {
    fn from(kind: FileKind) -> Self {
        kind.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Identity
// ═══════════════════════════════════════════════════════════════════════

/// Deterministic execution identifier.
///
/// Two arrivals of the same (`object_key`, `object_version`) always map to
/// the same id, which is what makes activation idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub const PREFIX: &'static str = "l0-";

    /// `l0-` followed by the first 32 hex chars of
    /// `sha256(object_key NUL object_version)`.
    pub fn derive(object_key: &str, object_version: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(object_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(object_version.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        ExecutionId(format!("{}{}", Self::PREFIX, &digest[..32]))
    }

    /// Wrap an id read back from storage or supplied by an operator.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let hex = raw
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| format!("execution id '{}' must start with '{}'", raw, Self::PREFIX))?;
        if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("execution id '{}' is not 32 hex digits", raw));
        }
        Ok(ExecutionId(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity and metadata of one stored file instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub object_key: String,
    /// Storage version token; `"null"` for unversioned objects.
    pub object_version: String,
    pub file_type: FileKind,
    pub arrival_timestamp: DateTime<Utc>,
    /// Size announced by the arrival event, verified on read when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Hex SHA-256 announced by the arrival event, verified on read when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_sha256: Option<String>,
}

impl FileDescriptor {
    pub fn new(
        object_key: impl Into<String>,
        object_version: impl Into<String>,
        arrival_timestamp: DateTime<Utc>,
    ) -> Self {
        let object_key = object_key.into();
        let file_type = FileKind::from_object_key(&object_key);
        Self {
            object_key,
            object_version: object_version.into(),
            file_type,
            arrival_timestamp,
            size: None,
            checksum_sha256: None,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        ExecutionId::derive(&self.object_key, &self.object_version)
    }

    /// The last path segment of the object key.
    pub fn file_name(&self) -> &str {
        self.object_key
            .rsplit('/')
            .next()
            .unwrap_or(&self.object_key)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Import results and notifications
// ═══════════════════════════════════════════════════════════════════════

/// The span of satellite time (and, when known, UTC time) a batch covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedRange {
    pub stw_start: u64,
    pub stw_end: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<DateTime<Utc>>,
}

/// What an import step produced. Stored on the execution so a resumed
/// execution can notify without importing again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub object_key: String,
    pub object_version: String,
    pub file_type: FileType,
    pub category: FileCategory,
    pub row_count: u64,
    /// Backend or instrument label (`AC1`, `AC2`, `FBA`, `SHK`, `ATT`).
    pub instrument: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<AffectedRange>,
    /// `false` when the same (key, version) had already been committed.
    pub newly_committed: bool,
}

/// A message informing one downstream consumer about new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub subscriber_id: String,
    pub trigger_object_key: String,
    pub trigger_object_version: String,
    pub file_type: FileType,
    pub row_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_range: Option<AffectedRange>,
    pub emitted_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn for_summary(
        subscriber_id: &str,
        summary: &ImportSummary,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subscriber_id: subscriber_id.to_string(),
            trigger_object_key: summary.object_key.clone(),
            trigger_object_version: summary.object_version.clone(),
            file_type: summary.file_type,
            row_count: summary.row_count,
            affected_range: summary.range.clone(),
            emitted_at,
        }
    }
}
