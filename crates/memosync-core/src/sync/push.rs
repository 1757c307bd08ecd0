//! Pushes of pending local state to the server.
//!
//! Every push re-reads the record it is about to send, so a unit queued long
//! ago still sends what the user sees now. Resources are uploaded before any
//! memo payload that references them; a memo payload never carries a
//! resource id the server has not confirmed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::queue::OperationQueue;
use super::resolve::{resolve_local_deleted, LocalDeleted};
use crate::db::LocalStore;
use crate::models::{MemoId, ResourceId, RowStatus, StoredMemo, StoredResource, SyncState};
use crate::remote::{
    CreateMemoRequest, CreateResourceRequest, RemoteError, RemoteMemo, RemoteService,
    UpdateMemoRequest,
};
use crate::storage::ResourceFileStore;
use crate::Result;

/// Collaborators shared by pushes and the reconciliation pass.
#[derive(Clone)]
pub(crate) struct Engine {
    pub(crate) store: LocalStore,
    pub(crate) remote: Arc<dyn RemoteService>,
    pub(crate) files: Arc<dyn ResourceFileStore>,
    pub(crate) queue: OperationQueue,
}

/// Confirmed server ids for a memo's live resources.
struct UploadedResources {
    server_ids: Vec<String>,
    /// False when at least one resource was left out of the payload.
    complete: bool,
}

impl Engine {
    /// Queue a push of the memo's current state behind everything already queued.
    pub(crate) fn enqueue_memo_push(&self, id: MemoId) {
        let engine = self.clone();
        let queued = self.queue.enqueue("push memo", async move {
            if let Err(error) = engine.push_memo(&id).await {
                warn!(memo = %id, %error, "Memo push failed; will retry on next sync");
            }
        });
        if let Err(error) = queued {
            warn!(memo = %id, %error, "Could not queue memo push");
        }
    }

    pub(crate) fn enqueue_resource_push(&self, id: ResourceId) {
        let engine = self.clone();
        let queued = self.queue.enqueue("push resource", async move {
            if let Err(error) = engine.push_resource(&id).await {
                warn!(resource = %id, %error, "Resource push failed; will retry on next sync");
            }
        });
        if let Err(error) = queued {
            warn!(resource = %id, %error, "Could not queue resource push");
        }
    }

    /// Push whatever the memo's sync state says is pending.
    pub(crate) async fn push_memo(&self, id: &MemoId) -> Result<()> {
        let Some(memo) = self.store.memo(id)? else {
            return Ok(());
        };

        match (memo.sync_state, memo.server_id.clone()) {
            (SyncState::PendingCreate, None) if !memo.soft_deleted => {
                self.push_create(&memo).await.map(|_| ())
            }
            (SyncState::PendingUpdate, Some(server_id)) if !memo.soft_deleted => {
                self.push_update(&memo, &server_id).await.map(|_| ())
            }
            (SyncState::PendingDelete, Some(server_id)) => {
                self.push_delete(&memo, &server_id).await
            }
            _ => Ok(()),
        }
    }

    /// Create `memo` on the server and fold the result back in.
    pub(crate) async fn push_create(&self, memo: &StoredMemo) -> Result<StoredMemo> {
        let revision = memo.local_revision;
        let uploaded = self.upload_memo_resources(&memo.id, None).await?;

        let request = CreateMemoRequest {
            content: memo.content.clone(),
            visibility: memo.visibility,
            resource_ids: uploaded.server_ids,
            tags: memo.tags(),
            created_at: Some(memo.created_at),
            updated_at: Some(memo.updated_at),
        };
        let created = self.remote.create_memo(request).await?;
        info!(memo = %memo.id, server_id = %created.remote_id, "Created memo on server");

        // The create call carries neither pinned nor row status.
        let (created, follow_ups_done) = self.apply_create_follow_ups(memo, created).await;

        let expected = (uploaded.complete && follow_ups_done).then_some(revision);
        self.store
            .reconcile_server_created_memo(&memo.id, &created, expected)
    }

    async fn apply_create_follow_ups(
        &self,
        memo: &StoredMemo,
        mut created: RemoteMemo,
    ) -> (RemoteMemo, bool) {
        if memo.pinned && !created.pinned {
            let request = UpdateMemoRequest {
                pinned: Some(true),
                ..UpdateMemoRequest::default()
            };
            match self.remote.update_memo(&created.remote_id, request).await {
                Ok(updated) => created = updated,
                Err(error) => {
                    warn!(memo = %memo.id, server_id = %created.remote_id, %error, "Failed to pin created memo");
                    return (created, false);
                }
            }
        }

        if memo.row_status == RowStatus::Archived && created.row_status != RowStatus::Archived {
            if let Err(error) = self.remote.archive_memo(&created.remote_id).await {
                warn!(memo = %memo.id, server_id = %created.remote_id, %error, "Failed to archive created memo");
                return (created, false);
            }
            created = created.with_row_status(RowStatus::Archived);
        }

        (created, true)
    }

    /// Send the local state of an already-created memo.
    pub(crate) async fn push_update(&self, memo: &StoredMemo, server_id: &str) -> Result<StoredMemo> {
        let revision = memo.local_revision;
        let uploaded = self.upload_memo_resources(&memo.id, Some(server_id)).await?;

        let request = UpdateMemoRequest {
            content: Some(memo.content.clone()),
            resource_ids: Some(uploaded.server_ids),
            visibility: Some(memo.visibility),
            tags: Some(memo.tags()),
            pinned: Some(memo.pinned),
            updated_at: Some(memo.updated_at),
        };
        let mut updated = self.remote.update_memo(server_id, request).await?;

        let mut complete = uploaded.complete;
        if updated.row_status != memo.row_status {
            let moved = match memo.row_status {
                RowStatus::Archived => self.remote.archive_memo(server_id).await,
                RowStatus::Normal => self.remote.restore_memo(server_id).await,
            };
            match moved {
                Ok(()) => updated = updated.with_row_status(memo.row_status),
                Err(error) => {
                    warn!(memo = %memo.id, server_id, %error, "Failed to change memo row status");
                    complete = false;
                }
            }
        }

        debug!(memo = %memo.id, server_id, complete, "Pushed memo update");
        self.store
            .adopt_pushed_memo(&memo.id, &updated, complete.then_some(revision))
    }

    /// Delete the server copy, but only if it still matches what was deleted.
    async fn push_delete(&self, memo: &StoredMemo, server_id: &str) -> Result<()> {
        let Some(remote) = self.find_remote_memo(server_id).await? else {
            debug!(memo = %memo.id, server_id, "Memo already gone on server");
            return self.store.mark_memo_synced(&memo.id, None);
        };

        if resolve_local_deleted(memo, &remote) == LocalDeleted::Restore {
            info!(memo = %memo.id, server_id, "Server copy changed after delete; restoring");
            self.store.apply_remote_memo(&remote, true)?;
            return Ok(());
        }

        match self.remote.delete_memo(server_id).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }
        info!(memo = %memo.id, server_id, "Deleted memo on server");
        self.store.mark_memo_synced(&memo.id, Some(remote.updated_at))
    }

    async fn find_remote_memo(&self, server_id: &str) -> Result<Option<RemoteMemo>> {
        let found = self
            .remote
            .list_memos()
            .await?
            .into_iter()
            .find(|memo| memo.remote_id == server_id);
        if found.is_some() {
            return Ok(found);
        }
        Ok(self
            .remote
            .list_archived_memos()
            .await?
            .into_iter()
            .find(|memo| memo.remote_id == server_id))
    }

    /// Upload every live resource of `memo_id` that has no server id yet.
    ///
    /// A resource whose blob is missing or whose upload fails is left out of
    /// the returned ids and retried with the memo's next push.
    async fn upload_memo_resources(
        &self,
        memo_id: &MemoId,
        memo_server_id: Option<&str>,
    ) -> Result<UploadedResources> {
        let mut uploaded = UploadedResources {
            server_ids: Vec::new(),
            complete: true,
        };

        for resource in self.store.resources_for_memo(memo_id)? {
            if let Some(server_id) = resource.server_id {
                uploaded.server_ids.push(server_id);
                continue;
            }
            match self.upload_resource(&resource, memo_server_id).await? {
                Some(server_id) => uploaded.server_ids.push(server_id),
                None => uploaded.complete = false,
            }
        }

        Ok(uploaded)
    }

    /// Upload one resource, returning its new server id.
    ///
    /// Remote and blob failures are logged and yield `None`; only local store
    /// and authentication errors propagate.
    async fn upload_resource(
        &self,
        resource: &StoredResource,
        memo_server_id: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(data) = self.resource_bytes(resource).await? else {
            return Ok(None);
        };

        let request = CreateResourceRequest {
            filename: resource.filename.clone(),
            data,
            mime_type: resource.mime_type.clone(),
            memo_id: memo_server_id.map(str::to_string),
        };
        match self.remote.create_resource(request).await {
            Ok(created) => {
                self.store.adopt_uploaded_resource(&resource.id, &created)?;
                info!(resource = %resource.id, server_id = %created.remote_id, "Uploaded resource");
                Ok(Some(created.remote_id))
            }
            Err(error) if error.is_auth_failure() => Err(error.into()),
            Err(error) => {
                warn!(resource = %resource.id, %error, "Resource upload failed; leaving it out of this push");
                Ok(None)
            }
        }
    }

    /// Bytes to upload: the local blob, or a fresh download of the resource's
    /// URL when the blob is gone (copies made by a fork start out this way).
    async fn resource_bytes(&self, resource: &StoredResource) -> Result<Option<Vec<u8>>> {
        if let Some(path) = resource.local_path.as_deref() {
            match self.files.read(path).await {
                Ok(Some(data)) => return Ok(Some(data)),
                Ok(None) => {
                    warn!(resource = %resource.id, path = %path.display(), "Resource blob missing");
                }
                Err(error) => warn!(resource = %resource.id, %error, "Failed to read resource blob"),
            }
        }

        let Some(url) = resource.url.as_deref() else {
            warn!(resource = %resource.id, "Resource has no bytes to upload; skipping");
            return Ok(None);
        };
        let data = match self.remote.download(url, Some(&resource.mime_type)).await {
            Ok(data) => data,
            Err(error) if error.is_auth_failure() => return Err(error.into()),
            Err(error) => {
                warn!(resource = %resource.id, %error, "Failed to fetch resource for upload; skipping");
                return Ok(None);
            }
        };

        match self.files.store(&resource.filename, &data).await {
            Ok(path) => self.store.set_resource_local_path(&resource.id, &path)?,
            Err(error) => warn!(resource = %resource.id, %error, "Failed to cache downloaded resource"),
        }
        Ok(Some(data))
    }

    /// Push a single resource: upload it, or carry out its pending deletion.
    pub(crate) async fn push_resource(&self, id: &ResourceId) -> Result<()> {
        let Some(resource) = self.store.resource(id)? else {
            return Ok(());
        };

        if resource.soft_deleted {
            // Never-uploaded resources only have a blob left to remove.
            let local_only = resource.server_id.is_none() && resource.local_path.is_some();
            if resource.sync_state == SyncState::PendingDelete || local_only {
                self.delete_resource_everywhere(&resource).await?;
            }
            return Ok(());
        }

        if resource.server_id.is_none() {
            let memo_server_id = match resource.memo_id {
                Some(memo_id) => self.store.memo(&memo_id)?.and_then(|memo| memo.server_id),
                None => None,
            };
            self.upload_resource(&resource, memo_server_id.as_deref())
                .await?;
        }
        Ok(())
    }

    /// Remove a resource remotely (when it has a server copy), then its blob,
    /// then settle the row.
    pub(crate) async fn delete_resource_everywhere(&self, resource: &StoredResource) -> Result<()> {
        if let Some(server_id) = resource.server_id.as_deref() {
            match self.remote.delete_resource(server_id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }

        if let Some(path) = resource.local_path.as_deref() {
            if self.store.blob_shared(&resource.id, path)? {
                debug!(resource = %resource.id, path = %path.display(), "Blob still in use; keeping it");
            } else if let Err(error) = self.files.delete(path).await {
                warn!(resource = %resource.id, %error, "Failed to delete resource blob");
            }
        }

        self.store.settle_resource_deletion(&resource.id)?;
        info!(
            resource = %resource.id,
            server_id = resource.server_id.as_deref().unwrap_or("-"),
            "Deleted resource"
        );
        Ok(())
    }
}
