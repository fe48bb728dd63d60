//! Error types for the blockio engine.

use crate::types::ObjVer;
use thiserror::Error;

/// Common result type for blockio operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blockio.
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no such object version: {0}")]
    NotFound(ObjVer),

    #[error("object version not synced yet: {0}")]
    Busy(ObjVer),

    #[error("data region is full")]
    OutOfSpace,

    #[error("on-disk corruption: {0}")]
    Corrupt(String),

    #[error("blockstore is read-only")]
    ReadOnly,

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Check if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error means the caller should retry after a sync.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectId;

    #[test]
    fn test_predicates() {
        let ov = ObjVer::new(ObjectId::new(1, 0), 2);
        assert!(Error::NotFound(ov).is_not_found());
        assert!(Error::Busy(ov).is_busy());
        assert!(!Error::OutOfSpace.is_not_found());
    }

    #[test]
    fn test_display() {
        let ov = ObjVer::new(ObjectId::new(1, 0), 2);
        assert_eq!(
            Error::NotFound(ov).to_string(),
            "no such object version: 1:0 v2"
        );
    }
}
