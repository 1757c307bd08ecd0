//! Public entry point of the sync engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pass::SyncReport;
use super::push::Engine;
use super::queue::OperationQueue;
use crate::config::SyncConfig;
use crate::db::{LocalStore, MemoChanges};
use crate::models::{
    MemoId, NewResource, ResourceId, RowStatus, StoredMemo, StoredResource, User, Visibility,
};
use crate::remote::RemoteService;
use crate::storage::{FsResourceStore, ResourceFileStore};
use crate::{Error, Result};

/// Local-first access to one account's memos and resources.
///
/// Mutations land in the local store before the call returns, then a push is
/// queued on the account's operation queue. Pushes never report failures to
/// the caller; a record whose push failed simply stays pending until the
/// next [`SyncService::sync`].
///
/// All identifiers accepted and returned here are local ids.
#[derive(Clone)]
pub struct SyncService {
    engine: Engine,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SyncService")
            .field("store", &self.engine.store)
            .field("queue", &self.engine.queue)
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Create a service and start the account's queue worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        files: Arc<dyn ResourceFileStore>,
    ) -> Self {
        let queue = OperationQueue::spawn(store.account_key());
        Self {
            engine: Engine {
                store,
                remote,
                files,
                queue,
            },
        }
    }

    /// Open the on-disk store and blob directory described by `config`.
    pub fn open(config: &SyncConfig, remote: Arc<dyn RemoteService>) -> Result<Self> {
        let store = LocalStore::open(config.database_path(), config.account_key.clone())?;
        let files = FsResourceStore::new(config.resources_dir());
        info!(
            account = %config.account_key,
            data_dir = %config.data_dir.display(),
            "Opened sync service"
        );
        Ok(Self::new(store, remote, Arc::new(files)))
    }

    pub fn store(&self) -> &LocalStore {
        &self.engine.store
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Non-archived memos, pinned first, then newest first.
    pub fn list_memos(&self) -> Result<Vec<StoredMemo>> {
        self.engine.store.list_memos(RowStatus::Normal)
    }

    pub fn list_archived_memos(&self) -> Result<Vec<StoredMemo>> {
        self.engine.store.list_memos(RowStatus::Archived)
    }

    pub fn memo(&self, id: &MemoId) -> Result<Option<StoredMemo>> {
        self.engine.store.memo(id)
    }

    pub fn resource(&self, id: &ResourceId) -> Result<Option<StoredResource>> {
        self.engine.store.resource(id)
    }

    pub fn resources_for_memo(&self, id: &MemoId) -> Result<Vec<StoredResource>> {
        self.engine.store.resources_for_memo(id)
    }

    /// The user snapshot cached by the last sync, if any.
    pub fn current_user(&self) -> Result<Option<User>> {
        self.engine.store.current_user()
    }

    /// Number of local changes the server has not confirmed yet.
    pub fn pending_count(&self) -> Result<usize> {
        self.engine.store.pending_count()
    }

    // ------------------------------------------------------------------
    // Memo mutations
    // ------------------------------------------------------------------

    pub fn create_memo(
        &self,
        content: &str,
        visibility: Visibility,
        resource_ids: &[ResourceId],
    ) -> Result<StoredMemo> {
        let memo = self
            .engine
            .store
            .create_memo(content, visibility, resource_ids)?;
        debug!(memo = %memo.id, "Created memo locally");
        self.engine.enqueue_memo_push(memo.id);
        Ok(memo)
    }

    /// Apply `changes`; `resource_ids`, when given, becomes the attachment set.
    pub fn update_memo(
        &self,
        id: &MemoId,
        changes: &MemoChanges,
        resource_ids: Option<&[ResourceId]>,
    ) -> Result<StoredMemo> {
        let memo = self.engine.store.update_memo(id, changes, resource_ids)?;
        self.engine.enqueue_memo_push(memo.id);
        Ok(memo)
    }

    pub fn set_pinned(&self, id: &MemoId, pinned: bool) -> Result<StoredMemo> {
        let changes = MemoChanges {
            pinned: Some(pinned),
            ..MemoChanges::default()
        };
        self.update_memo(id, &changes, None)
    }

    pub fn archive_memo(&self, id: &MemoId) -> Result<StoredMemo> {
        self.update_memo(id, &MemoChanges::row_status(RowStatus::Archived), None)
    }

    pub fn restore_memo(&self, id: &MemoId) -> Result<StoredMemo> {
        self.update_memo(id, &MemoChanges::row_status(RowStatus::Normal), None)
    }

    pub fn delete_memo(&self, id: &MemoId) -> Result<StoredMemo> {
        let memo = self.engine.store.delete_memo(id)?;
        self.engine.enqueue_memo_push(memo.id);
        Ok(memo)
    }

    // ------------------------------------------------------------------
    // Resource mutations
    // ------------------------------------------------------------------

    /// Store `data` as a new attachment, optionally attached to `memo_id`.
    pub async fn create_resource(
        &self,
        filename: &str,
        mime_type: &str,
        data: &[u8],
        memo_id: Option<MemoId>,
    ) -> Result<StoredResource> {
        let new_resource = NewResource::new(filename, mime_type, data.len())?;
        let path = self.engine.files.store(filename, data).await?;

        let resource = match self
            .engine
            .store
            .create_resource(&new_resource, &path, memo_id)
        {
            Ok(resource) => resource,
            Err(error) => {
                if let Err(cleanup) = self.engine.files.delete(&path).await {
                    warn!(path = %path.display(), error = %cleanup, "Failed to remove unused blob");
                }
                return Err(error);
            }
        };

        debug!(resource = %resource.id, memo = ?memo_id, "Created resource locally");
        match memo_id {
            // The memo push uploads it first.
            Some(memo_id) => self.engine.enqueue_memo_push(memo_id),
            None => self.engine.enqueue_resource_push(resource.id),
        }
        Ok(resource)
    }

    pub fn delete_resource(&self, id: &ResourceId) -> Result<StoredResource> {
        let resource = self.engine.store.delete_resource(id)?;
        self.engine.enqueue_resource_push(resource.id);
        Ok(resource)
    }

    /// Path of the resource's bytes on disk, downloading them if needed.
    pub async fn ensure_local_resource_file(&self, id: &ResourceId) -> Result<PathBuf> {
        let engine = self.engine.clone();
        let id = *id;
        self.engine
            .queue
            .run("download resource", async move {
                engine.ensure_local_resource_file(&id).await
            })
            .await?
    }

    // ------------------------------------------------------------------
    // Sync control
    // ------------------------------------------------------------------

    /// Run a full reconciliation pass after everything queued so far.
    ///
    /// Authentication failures and failures to fetch the server listing are
    /// returned; per-record failures are counted in the report.
    pub async fn sync(&self) -> Result<SyncReport> {
        let engine = self.engine.clone();
        self.engine
            .queue
            .run("sync", async move { engine.run_pass().await })
            .await?
    }

    /// Wait for every operation queued before this call.
    pub async fn flush(&self) -> Result<()> {
        self.engine.queue.flush().await
    }

    /// Queue pushes for every record a previous run left pending.
    pub fn resume_pending(&self) -> Result<usize> {
        let store = &self.engine.store;
        let mut queued = 0;

        for memo in store.pending_memos()? {
            self.engine.enqueue_memo_push(memo.id);
            queued += 1;
        }
        for resource in store.pending_resource_uploads()? {
            // Attached ones go up with their memo.
            if resource.memo_id.is_none() {
                self.engine.enqueue_resource_push(resource.id);
                queued += 1;
            }
        }
        for resource in store.pending_resource_deletions()? {
            self.engine.enqueue_resource_push(resource.id);
            queued += 1;
        }

        info!(account = %store.account_key(), queued, "Resumed pending work");
        Ok(queued)
    }

    /// Run [`SyncService::sync`] every `interval` until the handle is aborted.
    pub fn spawn_periodic_sync(&self, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match service.sync().await {
                    Ok(report) => debug!(?report, "Periodic sync finished"),
                    Err(Error::QueueClosed) => {
                        debug!("Operation queue closed; stopping periodic sync");
                        break;
                    }
                    Err(error) if error.is_auth_failure() => {
                        error!(%error, "Periodic sync rejected by server");
                    }
                    Err(error) => warn!(%error, "Periodic sync failed"),
                }
            }
        })
    }

    /// Remove blobs no resource row refers to. Returns how many were removed.
    pub async fn cleanup_orphaned_files(&self) -> Result<usize> {
        let engine = self.engine.clone();
        self.engine
            .queue
            .run("clean orphaned files", async move {
                let keep = engine.store.resource_paths()?;
                engine.files.remove_orphans(&keep).await
            })
            .await?
    }
}

impl Engine {
    async fn ensure_local_resource_file(&self, id: &ResourceId) -> Result<PathBuf> {
        let resource = self
            .store
            .resource(id)?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        if let Some(path) = resource.local_path {
            if self.files.exists(&path).await? {
                return Ok(path);
            }
            debug!(resource = %id, path = %path.display(), "Cached blob missing; downloading");
        }

        let url = resource.url.ok_or_else(|| {
            Error::NotFound(format!("resource {id} has neither a local file nor a URL"))
        })?;
        let bytes = self
            .remote
            .download(&url, Some(&resource.mime_type))
            .await?;
        let path = self.files.store(&resource.filename, &bytes).await?;
        self.store.set_resource_local_path(id, &path)?;
        info!(resource = %id, size = bytes.len(), "Downloaded resource");
        Ok(path)
    }
}
