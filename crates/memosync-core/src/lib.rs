//! memosync-core - Local-first synchronization engine
//!
//! This crate keeps a persisted, account-scoped mirror of memos and their
//! attached resources in sync with a remote memo service. Every user-facing
//! mutation lands in the local store immediately; a per-account operation
//! queue propagates it to the server, and a periodic reconciliation pass
//! resolves divergence between the two sides.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod util;

pub use config::SyncConfig;
pub use db::{LocalStore, MemoChanges};
pub use error::{Error, Result};
pub use models::{MemoId, ResourceId, RowStatus, StoredMemo, StoredResource, SyncState, Visibility};
pub use remote::{RemoteError, RemoteService};
pub use storage::{FsResourceStore, ResourceFileStore};
pub use sync::{SyncReport, SyncService};
