//! Resource (attachment) model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{MemoId, SyncState};

/// A local, opaque resource identifier, using UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a new unique resource ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID.
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Local mirror of an attachment, owned by at most one memo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResource {
    /// Local identifier.
    pub id: ResourceId,
    /// Owning account.
    pub account_key: String,
    /// Server identifier, absent until uploaded.
    pub server_id: Option<String>,
    /// Owning memo, if attached.
    pub memo_id: Option<MemoId>,
    /// Original file name.
    pub filename: String,
    /// Content MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: i64,
    /// Creation timestamp (Unix ms).
    pub created_at: i64,
    /// Last update timestamp (Unix ms).
    pub updated_at: i64,
    /// Remote download URL, once known.
    pub url: Option<String>,
    /// Cached blob location in the resource file store.
    pub local_path: Option<PathBuf>,
    /// Sticky local delete flag.
    pub soft_deleted: bool,
    pub sync_state: SyncState,
    /// Last server `updated_at` this copy is known to be consistent with.
    pub last_synced_at: Option<i64>,
    pub local_revision: i64,
}

/// Validated fields for a new local resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResource {
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
}

impl NewResource {
    /// Trim and validate user-provided attachment metadata.
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, size: usize) -> Result<Self> {
        let filename = filename.into().trim().to_string();
        let mime_type = mime_type.into().trim().to_string();

        if filename.is_empty() {
            return Err(Error::InvalidInput(
                "Resource filename cannot be empty".to_string(),
            ));
        }
        if mime_type.is_empty() {
            return Err(Error::InvalidInput(
                "Resource mime_type cannot be empty".to_string(),
            ));
        }
        let size = i64::try_from(size)
            .map_err(|_| Error::InvalidInput("Resource is too large".to_string()))?;

        Ok(Self {
            filename,
            mime_type,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_parse() {
        let id = ResourceId::new();
        let parsed: ResourceId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_new_resource_trims_fields() {
        let resource = NewResource::new(" photo.png ", " image/png ", 1234).unwrap();
        assert_eq!(resource.filename, "photo.png");
        assert_eq!(resource.mime_type, "image/png");
        assert_eq!(resource.size, 1234);
    }

    #[test]
    fn test_new_resource_validation() {
        assert!(NewResource::new("", "image/png", 1).is_err());
        assert!(NewResource::new("file", " ", 1).is_err());
    }
}
