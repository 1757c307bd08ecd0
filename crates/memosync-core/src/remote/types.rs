//! Wire-level data transfer types shared by every backend dialect.

use serde::{Deserialize, Serialize};

use crate::models::{RowStatus, Visibility};

/// A memo as the server reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMemo {
    pub remote_id: String,
    pub content: String,
    pub pinned: bool,
    pub row_status: RowStatus,
    pub visibility: Visibility,
    #[serde(default)]
    pub resources: Vec<RemoteResource>,
    /// Unix ms
    pub created_at: i64,
    /// Unix ms
    pub updated_at: i64,
}

impl RemoteMemo {
    /// Server identifiers of the attached resources, in order.
    pub fn resource_ids(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(|resource| resource.remote_id.as_str())
    }

    /// The same memo after an archive or restore call, which returns no body.
    #[must_use]
    pub fn with_row_status(mut self, row_status: RowStatus) -> Self {
        self.row_status = row_status;
        self
    }
}

/// An attachment as the server reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResource {
    pub remote_id: String,
    pub filename: String,
    pub size: i64,
    pub mime_type: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMemoRequest {
    pub content: String,
    pub visibility: Visibility,
    /// Server ids of attached resources; every entry is already confirmed.
    pub resource_ids: Vec<String>,
    pub tags: Vec<String>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

/// Partial memo update; `None` fields are left untouched by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMemoRequest {
    pub content: Option<String>,
    pub resource_ids: Option<Vec<String>>,
    pub visibility: Option<Visibility>,
    pub tags: Option<Vec<String>>,
    pub pinned: Option<bool>,
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResourceRequest {
    pub filename: String,
    pub data: Vec<u8>,
    pub mime_type: String,
    /// Server id of the owning memo, when it already has one.
    pub memo_id: Option<String>,
}
