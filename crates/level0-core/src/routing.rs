//! Per-type import branches.
//!
//! The router is a registration table from [`FileType`] to an
//! [`ImportBranch`]. Routing an execution succeeds exactly when its file
//! kind is a known type with a registered branch; everything else is an
//! unroutable file.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ParseError;
use crate::format::{self, rows::MeasurementRows};
use crate::models::{FileKind, FileType};

/// Parses raw bytes of one file type into measurement rows.
pub trait ImportBranch: Send + Sync {
    fn file_type(&self) -> FileType;

    fn parse(&self, file_name: &str, bytes: &[u8]) -> Result<MeasurementRows, ParseError>;
}

/// Branch backed by the built-in Level 0 parsers.
#[derive(Debug, Clone, Copy)]
pub struct Level0Branch(pub FileType);

impl ImportBranch for Level0Branch {
    fn file_type(&self) -> FileType {
        self.0
    }

    fn parse(&self, file_name: &str, bytes: &[u8]) -> Result<MeasurementRows, ParseError> {
        format::parse(self.0, file_name, bytes)
    }
}

#[derive(Clone, Default)]
pub struct ImportRouter {
    branches: HashMap<FileType, Arc<dyn ImportBranch>>,
}

impl ImportRouter {
    /// A router with no branches.
    pub fn new() -> Self {
        Self::default()
    }

    /// A router with the Level 0 branch for every file type.
    pub fn standard() -> Self {
        let mut router = Self::new();
        for ft in FileType::ALL {
            router.register(Arc::new(Level0Branch(ft)));
        }
        router
    }

    /// Register a branch, replacing any previous one for the same type.
    pub fn register(&mut self, branch: Arc<dyn ImportBranch>) -> &mut Self {
        self.branches.insert(branch.file_type(), branch);
        self
    }

    pub fn branch(&self, file_type: FileType) -> Option<Arc<dyn ImportBranch>> {
        self.branches.get(&file_type).cloned()
    }

    pub fn route(&self, kind: &FileKind) -> Option<Arc<dyn ImportBranch>> {
        kind.known().and_then(|ft| self.branch(ft))
    }

    pub fn file_types(&self) -> Vec<FileType> {
        let mut types: Vec<FileType> = self.branches.keys().copied().collect();
        types.sort_by_key(|ft| ft.extension());
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_routes_every_type() {
        let router = ImportRouter::standard();
        for ft in FileType::ALL {
            let branch = router.route(&FileKind::Known(ft)).unwrap();
            assert_eq!(branch.file_type(), ft);
        }
        assert_eq!(router.file_types().len(), FileType::ALL.len());
    }

    #[test]
    fn test_unknown_kind_is_unroutable() {
        let router = ImportRouter::standard();
        assert!(router
            .route(&FileKind::from_object_key("L0/2024/notes.txt"))
            .is_none());
    }

    #[test]
    fn test_missing_branch_is_unroutable() {
        let mut router = ImportRouter::new();
        router.register(Arc::new(Level0Branch(FileType::Fba)));
        assert!(router.route(&FileKind::Known(FileType::Fba)).is_some());
        assert!(router.route(&FileKind::Known(FileType::Shk)).is_none());
    }
}
