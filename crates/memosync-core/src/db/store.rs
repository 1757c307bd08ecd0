//! Account-scoped handle over the shared mirror database.
//!
//! `LocalStore` owns the only connection to the mirror. Every method takes the
//! lock for the duration of one synchronous call and never across an await,
//! so caller-thread writes and queued background work interleave safely.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, error, info};

use super::{Database, MemoChanges, MemoRepository, ResourceRepository, UserRepository};
use crate::error::{Error, Result};
use crate::models::{
    MemoId, NewResource, ResourceId, RowStatus, StoredMemo, StoredResource, SyncState, User,
    Visibility,
};
use crate::remote::{RemoteMemo, RemoteResource};

/// Thread-safe, account-scoped access to the local mirror.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    account_key: Arc<str>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LocalStore")
            .field("account_key", &self.account_key)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open (or create) the mirror database at `path`, scoped to `account_key`.
    ///
    /// An open [`StoreBatch`] holds the file's write lock, so every account
    /// should get its own file (see [`crate::SyncConfig::database_path`]).
    /// Accounts that do share a file share one connection via [`Self::for_account`].
    pub fn open(path: impl AsRef<Path>, account_key: impl Into<String>) -> Result<Self> {
        Ok(Self::from_database(Database::open(path)?, account_key))
    }

    /// Open an in-memory mirror (primarily for tests).
    pub fn open_in_memory(account_key: impl Into<String>) -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?, account_key))
    }

    pub fn from_database(database: Database, account_key: impl Into<String>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(database.into_connection())),
            account_key: Arc::from(account_key.into()),
        }
    }

    /// Another account's view of the same database.
    #[must_use]
    pub fn for_account(&self, account_key: impl Into<String>) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            account_key: Arc::from(account_key.into()),
        }
    }

    pub fn account_key(&self) -> &str {
        &self.account_key
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("local store lock poisoned".to_string()))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection, &str) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn, &self.account_key)
    }

    /// Run `f` atomically: either all of its statements land or none do.
    fn with_savepoint<T>(&self, f: impl FnOnce(&Connection, &str) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let savepoint = conn.savepoint()?;
        let value = f(&savepoint, &self.account_key)?;
        savepoint.commit()?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn memo(&self, id: &MemoId) -> Result<Option<StoredMemo>> {
        self.with_conn(|conn, account| MemoRepository::new(conn, account).get(id))
    }

    pub fn memo_by_server_id(&self, server_id: &str) -> Result<Option<StoredMemo>> {
        self.with_conn(|conn, account| {
            MemoRepository::new(conn, account).find_by_server_id(server_id)
        })
    }

    /// Non-deleted memos with `row_status`, pinned first, then newest first.
    pub fn list_memos(&self, row_status: RowStatus) -> Result<Vec<StoredMemo>> {
        self.with_conn(|conn, account| MemoRepository::new(conn, account).list(row_status))
    }

    /// Every memo of the account, soft-deleted ones included.
    pub fn list_all_memos(&self) -> Result<Vec<StoredMemo>> {
        self.with_conn(|conn, account| MemoRepository::new(conn, account).list_all())
    }

    pub fn pending_memos(&self) -> Result<Vec<StoredMemo>> {
        self.with_conn(|conn, account| MemoRepository::new(conn, account).list_pending())
    }

    pub fn resource(&self, id: &ResourceId) -> Result<Option<StoredResource>> {
        self.with_conn(|conn, account| ResourceRepository::new(conn, account).get(id))
    }

    /// Live resources attached to a memo.
    pub fn resources_for_memo(&self, memo_id: &MemoId) -> Result<Vec<StoredResource>> {
        self.with_conn(|conn, account| {
            ResourceRepository::new(conn, account).list_for_memo(memo_id)
        })
    }

    pub fn pending_resource_uploads(&self) -> Result<Vec<StoredResource>> {
        self.with_conn(|conn, account| {
            ResourceRepository::new(conn, account).list_pending_uploads()
        })
    }

    pub fn pending_resource_deletions(&self) -> Result<Vec<StoredResource>> {
        self.with_conn(|conn, account| {
            ResourceRepository::new(conn, account).list_pending_deletions()
        })
    }

    /// Number of memos and resources with changes the server has not seen.
    pub fn pending_count(&self) -> Result<usize> {
        self.with_conn(|conn, account| {
            Ok(MemoRepository::new(conn, account).count_pending()?
                + ResourceRepository::new(conn, account).count_pending()?)
        })
    }

    pub fn current_user(&self) -> Result<Option<User>> {
        self.with_conn(|conn, account| UserRepository::new(conn, account).load())
    }

    /// Blob paths referenced by any resource row of this account.
    pub fn resource_paths(&self) -> Result<HashSet<PathBuf>> {
        self.with_conn(|conn, account| {
            Ok(ResourceRepository::new(conn, account)
                .local_paths()?
                .into_iter()
                .map(PathBuf::from)
                .collect())
        })
    }

    /// Rows changed over the lifetime of the connection, across all accounts.
    pub fn total_changes(&self) -> Result<i64> {
        self.with_conn(|conn, _| {
            Ok(conn.query_row("SELECT total_changes()", [], |row| row.get(0))?)
        })
    }

    // ------------------------------------------------------------------
    // Local user writes
    // ------------------------------------------------------------------

    /// Insert a new `PendingCreate` memo and attach `resource_ids` to it.
    pub fn create_memo(
        &self,
        content: &str,
        visibility: Visibility,
        resource_ids: &[ResourceId],
    ) -> Result<StoredMemo> {
        self.with_savepoint(|conn, account| {
            let memo = MemoRepository::new(conn, account).create_local(content, visibility)?;
            if !resource_ids.is_empty() {
                ResourceRepository::new(conn, account).set_memo_resources(&memo.id, resource_ids)?;
            }
            Ok(memo)
        })
    }

    /// Apply a user edit; `resource_ids`, when given, replaces the attachment set.
    pub fn update_memo(
        &self,
        id: &MemoId,
        changes: &MemoChanges,
        resource_ids: Option<&[ResourceId]>,
    ) -> Result<StoredMemo> {
        self.with_savepoint(|conn, account| {
            let memo = MemoRepository::new(conn, account).apply_local_edit(id, changes)?;
            if let Some(resource_ids) = resource_ids {
                ResourceRepository::new(conn, account).set_memo_resources(id, resource_ids)?;
            }
            Ok(memo)
        })
    }

    pub fn delete_memo(&self, id: &MemoId) -> Result<StoredMemo> {
        self.with_conn(|conn, account| MemoRepository::new(conn, account).mark_deleted(id))
    }

    /// Record a new attachment whose bytes already live at `local_path`.
    ///
    /// Attaching it to a memo counts as an edit of that memo.
    pub fn create_resource(
        &self,
        resource: &NewResource,
        local_path: &Path,
        memo_id: Option<MemoId>,
    ) -> Result<StoredResource> {
        self.with_savepoint(|conn, account| {
            if let Some(memo_id) = &memo_id {
                MemoRepository::new(conn, account)
                    .apply_local_edit(memo_id, &MemoChanges::default())?;
            }
            ResourceRepository::new(conn, account).create_local(resource, local_path, memo_id)
        })
    }

    pub fn delete_resource(&self, id: &ResourceId) -> Result<StoredResource> {
        self.with_conn(|conn, account| ResourceRepository::new(conn, account).mark_deleted(id))
    }

    // ------------------------------------------------------------------
    // Server truth
    // ------------------------------------------------------------------

    /// Insert or overwrite the mirror of `remote` (memo row only).
    pub fn upsert_memo(&self, remote: &RemoteMemo, sync_state: SyncState) -> Result<StoredMemo> {
        self.with_conn(|conn, account| {
            MemoRepository::new(conn, account).upsert_remote(remote, sync_state)
        })
    }

    /// Make the live attachments of `memo_id` match `resources`.
    ///
    /// With `preserve_local_only`, attachments that were never uploaded are
    /// kept even though the server does not list them.
    pub fn reconcile_resources(
        &self,
        resources: &[RemoteResource],
        memo_id: &MemoId,
        preserve_local_only: bool,
    ) -> Result<()> {
        self.with_savepoint(|conn, account| {
            reconcile_resources(
                &ResourceRepository::new(conn, account),
                resources,
                memo_id,
                preserve_local_only,
            )
        })
    }

    /// Mirror `remote` as `Synced`, memo and attachments together.
    pub fn apply_remote_memo(
        &self,
        remote: &RemoteMemo,
        preserve_local_only: bool,
    ) -> Result<StoredMemo> {
        self.with_savepoint(|conn, account| {
            let memo =
                MemoRepository::new(conn, account).upsert_remote(remote, SyncState::Synced)?;
            reconcile_resources(
                &ResourceRepository::new(conn, account),
                &remote.resources,
                &memo.id,
                preserve_local_only,
            )?;
            Ok(memo)
        })
    }

    /// Fold the result of a successful create push back into the local row.
    ///
    /// A row a concurrent pull may have created for the same server id is
    /// merged away first: its resources move to `local_id` and it is removed.
    /// Server truth is then copied over, unless the user changed the record
    /// after `expected_revision` was read, in which case only the server id
    /// and version are recorded and the record stays pending. Passing `None`
    /// marks the server copy as incomplete and always keeps the record pending.
    pub fn reconcile_server_created_memo(
        &self,
        local_id: &MemoId,
        created: &RemoteMemo,
        expected_revision: Option<i64>,
    ) -> Result<StoredMemo> {
        self.with_savepoint(|conn, account| {
            let memos = MemoRepository::new(conn, account);
            let resources = ResourceRepository::new(conn, account);

            if let Some(duplicate) = memos.find_by_server_id(&created.remote_id)? {
                if duplicate.id != *local_id {
                    let moved = resources.reassign(&duplicate.id, local_id)?;
                    memos.hard_delete(&duplicate.id)?;
                    info!(
                        memo = %local_id,
                        duplicate = %duplicate.id,
                        server_id = %created.remote_id,
                        moved,
                        "Merged duplicate row created by a concurrent pull"
                    );
                }
            }

            adopt_server_memo(&memos, &resources, local_id, created, expected_revision)
        })
    }

    /// Fold the result of a successful update push back into the local row.
    pub fn adopt_pushed_memo(
        &self,
        local_id: &MemoId,
        pushed: &RemoteMemo,
        expected_revision: Option<i64>,
    ) -> Result<StoredMemo> {
        self.with_savepoint(|conn, account| {
            adopt_server_memo(
                &MemoRepository::new(conn, account),
                &ResourceRepository::new(conn, account),
                local_id,
                pushed,
                expected_revision,
            )
        })
    }

    /// Settle a memo as `Synced`; a no-op when nothing would change.
    pub fn mark_memo_synced(&self, id: &MemoId, last_synced_at: Option<i64>) -> Result<()> {
        self.with_conn(|conn, account| {
            MemoRepository::new(conn, account).mark_synced(id, last_synced_at)
        })
    }

    /// Accept that the server no longer has this memo.
    pub fn accept_remote_deletion(&self, id: &MemoId) -> Result<()> {
        self.with_conn(|conn, account| {
            MemoRepository::new(conn, account).mark_deleted_and_synced(id)
        })
    }

    /// Clear the server id so the memo is pushed again as a brand-new record.
    pub fn force_recreate(&self, id: &MemoId) -> Result<()> {
        self.with_conn(|conn, account| MemoRepository::new(conn, account).force_recreate(id))
    }

    /// Copy a memo and its live resources into a new `PendingCreate` record.
    ///
    /// Uploaded resources stay with the original and the copy gets its own
    /// never-uploaded rows over the same blobs. Resources that were never
    /// uploaded move to the copy.
    pub fn fork_memo(&self, id: &MemoId) -> Result<StoredMemo> {
        self.with_savepoint(|conn, account| {
            let memos = MemoRepository::new(conn, account);
            let resources = ResourceRepository::new(conn, account);
            let source = memos.require(id)?;
            let fork = memos.duplicate_as_new(&source)?;
            for resource in resources.list_for_memo(id)? {
                if resource.server_id.is_some() {
                    resources.duplicate_into(&resource, &fork.id)?;
                } else {
                    resources.set_memo(&resource.id, Some(&fork.id))?;
                }
            }
            Ok(fork)
        })
    }

    /// Whether another resource row still uses the blob at `path`.
    pub fn blob_shared(&self, id: &ResourceId, path: &Path) -> Result<bool> {
        self.with_conn(|conn, account| {
            ResourceRepository::new(conn, account).blob_shared(id, path)
        })
    }

    pub fn adopt_uploaded_resource(&self, id: &ResourceId, remote: &RemoteResource) -> Result<()> {
        self.with_conn(|conn, account| {
            ResourceRepository::new(conn, account).adopt_upload(id, remote)
        })
    }

    pub fn settle_resource_deletion(&self, id: &ResourceId) -> Result<()> {
        self.with_conn(|conn, account| {
            ResourceRepository::new(conn, account).mark_deletion_settled(id)
        })
    }

    pub fn set_resource_local_path(&self, id: &ResourceId, path: &Path) -> Result<()> {
        self.with_conn(|conn, account| {
            ResourceRepository::new(conn, account).set_local_path(id, path)
        })
    }

    pub fn save_user(&self, user: &User) -> Result<()> {
        self.with_conn(|conn, account| UserRepository::new(conn, account).save(user))
    }

    /// Drop rows whose deletion both sides agree on. Returns (memos, resources).
    pub fn purge_tombstones(&self) -> Result<(usize, usize)> {
        self.with_savepoint(|conn, account| {
            let resources = ResourceRepository::new(conn, account).purge_tombstones()?;
            let memos = MemoRepository::new(conn, account).purge_tombstones()?;
            Ok((memos, resources))
        })
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Open a batch: statements issued until the returned guard is committed
    /// or dropped become durable together. Nested batches join the open one.
    pub fn begin_batch(&self) -> Result<StoreBatch> {
        let conn = self.lock()?;
        let owned = conn.is_autocommit();
        if owned {
            conn.execute_batch("BEGIN")?;
            debug!(account = %self.account_key, "Opened store batch");
        }
        Ok(StoreBatch {
            store: self.clone(),
            owned,
        })
    }

    fn commit_open_batch(&self) -> Result<()> {
        let conn = self.lock()?;
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
            debug!(account = %self.account_key, "Committed store batch");
        }
        Ok(())
    }
}

/// An open store batch. Committed on [`StoreBatch::commit`] or on drop.
#[must_use = "dropping the batch commits it immediately"]
pub struct StoreBatch {
    store: LocalStore,
    owned: bool,
}

impl StoreBatch {
    pub fn commit(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if !std::mem::replace(&mut self.owned, false) {
            return Ok(());
        }
        self.store.commit_open_batch()
    }
}

impl Drop for StoreBatch {
    fn drop(&mut self) {
        if let Err(error) = self.finish() {
            error!(account = %self.store.account_key, %error, "Failed to commit store batch");
        }
    }
}

fn reconcile_resources(
    repo: &ResourceRepository<'_>,
    resources: &[RemoteResource],
    memo_id: &MemoId,
    preserve_local_only: bool,
) -> Result<()> {
    let keep: Vec<&str> = resources
        .iter()
        .map(|resource| resource.remote_id.as_str())
        .collect();
    repo.detach_missing(memo_id, &keep, preserve_local_only)?;
    for resource in resources {
        repo.upsert_remote(resource, memo_id)?;
    }
    Ok(())
}

fn adopt_server_memo(
    memos: &MemoRepository<'_>,
    resources: &ResourceRepository<'_>,
    local_id: &MemoId,
    remote: &RemoteMemo,
    expected_revision: Option<i64>,
) -> Result<StoredMemo> {
    let local = memos.require(local_id)?;

    if local.soft_deleted {
        // Deleted while the push was in flight; the server copy still has to go.
        memos.record_server_version(
            local_id,
            &remote.remote_id,
            remote.updated_at,
            SyncState::PendingDelete,
        )?;
    } else if expected_revision == Some(local.local_revision) {
        memos.overwrite_from_remote(local_id, remote, SyncState::Synced)?;
        reconcile_resources(resources, &remote.resources, local_id, true)?;
    } else {
        debug!(
            memo = %local_id,
            server_id = %remote.remote_id,
            "Memo changed during push or pushed partially; keeping it pending"
        );
        memos.record_server_version(
            local_id,
            &remote.remote_id,
            remote.updated_at,
            SyncState::PendingUpdate,
        )?;
    }

    memos.require(local_id)
}
