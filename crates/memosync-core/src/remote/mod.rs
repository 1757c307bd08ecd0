//! Remote memo service interface.
//!
//! One implementation exists per backend dialect; the engine only ever talks
//! to this trait. Every call may fail with a [`RemoteError`], which background
//! pushes treat as "unchanged, retry on the next sync".

mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use types::{
    CreateMemoRequest, CreateResourceRequest, RemoteMemo, RemoteResource, UpdateMemoRequest,
};

use crate::models::User;

/// Errors surfaced by a remote service implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Remote record not found: {0}")]
    NotFound(String),
    #[error("Remote API error: {message} ({status})")]
    Api { status: u16, message: String },
}

impl RemoteError {
    /// Whether the user has to sign in again before anything can sync.
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Api { status: 401 | 403, .. })
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Calls the sync engine makes against the server.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// List every non-archived memo of the signed-in user.
    async fn list_memos(&self) -> RemoteResult<Vec<RemoteMemo>>;

    /// List every archived memo of the signed-in user.
    async fn list_archived_memos(&self) -> RemoteResult<Vec<RemoteMemo>>;

    async fn create_memo(&self, request: CreateMemoRequest) -> RemoteResult<RemoteMemo>;

    async fn update_memo(
        &self,
        remote_id: &str,
        request: UpdateMemoRequest,
    ) -> RemoteResult<RemoteMemo>;

    async fn delete_memo(&self, remote_id: &str) -> RemoteResult<()>;

    async fn archive_memo(&self, remote_id: &str) -> RemoteResult<()>;

    async fn restore_memo(&self, remote_id: &str) -> RemoteResult<()>;

    async fn create_resource(&self, request: CreateResourceRequest)
        -> RemoteResult<RemoteResource>;

    async fn delete_resource(&self, remote_id: &str) -> RemoteResult<()>;

    async fn current_user(&self) -> RemoteResult<User>;

    /// Fetch the bytes behind a resource URL.
    async fn download(&self, url: &str, mime_type: Option<&str>) -> RemoteResult<Vec<u8>>;
}
