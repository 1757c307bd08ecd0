//! Resource mirror queries

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use super::mapping::{parse_resource, RESOURCE_COLUMNS};
use crate::error::{Error, Result};
use crate::models::{MemoId, NewResource, ResourceId, StoredResource, SyncState};
use crate::remote::RemoteResource;
use crate::util::now_millis;

/// Account-scoped resource queries over a borrowed connection
pub struct ResourceRepository<'a> {
    conn: &'a Connection,
    account: &'a str,
}

impl<'a> ResourceRepository<'a> {
    pub const fn new(conn: &'a Connection, account: &'a str) -> Self {
        Self { conn, account }
    }

    /// Insert a user-created attachment whose bytes already sit at `local_path`.
    pub fn create_local(
        &self,
        resource: &NewResource,
        local_path: &Path,
        memo_id: Option<MemoId>,
    ) -> Result<StoredResource> {
        let now = now_millis();
        let stored = StoredResource {
            id: ResourceId::new(),
            account_key: self.account.to_string(),
            server_id: None,
            memo_id,
            filename: resource.filename.clone(),
            mime_type: resource.mime_type.clone(),
            size: resource.size,
            created_at: now,
            updated_at: now,
            url: None,
            local_path: Some(local_path.to_path_buf()),
            soft_deleted: false,
            sync_state: SyncState::PendingCreate,
            last_synced_at: None,
            local_revision: 1,
        };
        self.insert(&stored)?;
        Ok(stored)
    }

    fn insert(&self, resource: &StoredResource) -> Result<()> {
        self.conn.execute(
            &format!("INSERT INTO resources ({RESOURCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
            params![
                resource.id,
                resource.account_key,
                resource.server_id,
                resource.memo_id,
                resource.filename,
                resource.mime_type,
                resource.size,
                resource.created_at,
                resource.updated_at,
                resource.url,
                resource
                    .local_path
                    .as_ref()
                    .map(|path| path.to_string_lossy().into_owned()),
                resource.soft_deleted,
                resource.sync_state,
                resource.last_synced_at,
                resource.local_revision,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &ResourceId) -> Result<Option<StoredResource>> {
        let resource = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = ?1 AND account_key = ?2"
                ),
                params![id, self.account],
                parse_resource,
            )
            .optional()?;
        Ok(resource)
    }

    pub fn require(&self, id: &ResourceId) -> Result<StoredResource> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))
    }

    pub fn find_by_server_id(&self, server_id: &str) -> Result<Option<StoredResource>> {
        let resource = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources WHERE account_key = ?1 AND server_id = ?2"
                ),
                params![self.account, server_id],
                parse_resource,
            )
            .optional()?;
        Ok(resource)
    }

    /// Non-deleted resources attached to `memo_id`, oldest first.
    pub fn list_for_memo(&self, memo_id: &MemoId) -> Result<Vec<StoredResource>> {
        self.query(
            &format!(
                "SELECT {RESOURCE_COLUMNS} FROM resources
                 WHERE account_key = ?1 AND memo_id = ?2 AND soft_deleted = 0
                 ORDER BY created_at ASC, id ASC"
            ),
            params![self.account, memo_id],
        )
    }

    /// Resources with no server id yet that are still wanted.
    pub fn list_pending_uploads(&self) -> Result<Vec<StoredResource>> {
        self.query(
            &format!(
                "SELECT {RESOURCE_COLUMNS} FROM resources
                 WHERE account_key = ?1 AND server_id IS NULL AND soft_deleted = 0
                 ORDER BY created_at ASC"
            ),
            params![self.account],
        )
    }

    /// Resources that must be removed remotely and locally.
    ///
    /// Covers explicit `PendingDelete` rows and live attachments whose parent
    /// memo's deletion has been confirmed.
    pub fn list_pending_deletions(&self) -> Result<Vec<StoredResource>> {
        self.query(
            &format!(
                "SELECT {RESOURCE_COLUMNS} FROM resources r
                 WHERE r.account_key = ?1
                   AND ((r.soft_deleted = 1 AND r.sync_state = 'pending_delete')
                        OR (r.soft_deleted = 0 AND r.memo_id IN (
                            SELECT m.id FROM memos m
                            WHERE m.soft_deleted = 1 AND m.sync_state = 'synced')))
                 ORDER BY r.created_at ASC"
            ),
            params![self.account],
        )
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<StoredResource>> {
        let mut stmt = self.conn.prepare(sql)?;
        let resources = stmt
            .query_map(params, parse_resource)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(resources)
    }

    /// Make `ids` exactly the set of live resources attached to `memo_id`.
    pub fn set_memo_resources(&self, memo_id: &MemoId, ids: &[ResourceId]) -> Result<()> {
        for id in ids {
            let resource = self.require(id)?;
            if resource.soft_deleted {
                return Err(Error::InvalidInput(format!("resource {id} is deleted")));
            }
        }

        let current = self.list_for_memo(memo_id)?;
        for resource in current.iter().filter(|resource| !ids.contains(&resource.id)) {
            self.set_memo(&resource.id, None)?;
        }
        for id in ids {
            self.set_memo(id, Some(memo_id))?;
        }
        Ok(())
    }

    pub fn set_memo(&self, id: &ResourceId, memo_id: Option<&MemoId>) -> Result<()> {
        self.conn.execute(
            "UPDATE resources SET memo_id = ?1
             WHERE id = ?2 AND account_key = ?3 AND memo_id IS NOT ?1",
            params![memo_id, id, self.account],
        )?;
        Ok(())
    }

    /// Detach live resources of `memo_id` whose server id is not in `keep`.
    ///
    /// With `preserve_local_only`, attachments that were never uploaded stay put.
    pub fn detach_missing(
        &self,
        memo_id: &MemoId,
        keep: &[&str],
        preserve_local_only: bool,
    ) -> Result<()> {
        for resource in self.list_for_memo(memo_id)? {
            let retained = match resource.server_id.as_deref() {
                Some(server_id) => keep.contains(&server_id),
                None => preserve_local_only,
            };
            if !retained {
                self.set_memo(&resource.id, None)?;
            }
        }
        Ok(())
    }

    /// Insert or refresh the mirror of `remote` and attach it to `memo_id`.
    pub fn upsert_remote(&self, remote: &RemoteResource, memo_id: &MemoId) -> Result<()> {
        if let Some(existing) = self.find_by_server_id(&remote.remote_id)? {
            self.conn.execute(
                "UPDATE resources
                 SET memo_id = ?1, filename = ?2, mime_type = ?3, size = ?4, created_at = ?5,
                     updated_at = ?6, url = ?7, soft_deleted = 0, sync_state = 'synced',
                     last_synced_at = ?6
                 WHERE id = ?8
                   AND (memo_id IS NOT ?1 OR filename != ?2 OR mime_type != ?3 OR size != ?4
                        OR updated_at != ?6 OR url IS NOT ?7 OR soft_deleted != 0
                        OR sync_state != 'synced' OR last_synced_at IS NOT ?6)",
                params![
                    memo_id,
                    remote.filename,
                    remote.mime_type,
                    remote.size,
                    remote.created_at,
                    remote.updated_at,
                    remote.url,
                    existing.id,
                ],
            )?;
            return Ok(());
        }

        self.insert(&StoredResource {
            id: ResourceId::new(),
            account_key: self.account.to_string(),
            server_id: Some(remote.remote_id.clone()),
            memo_id: Some(*memo_id),
            filename: remote.filename.clone(),
            mime_type: remote.mime_type.clone(),
            size: remote.size,
            created_at: remote.created_at,
            updated_at: remote.updated_at,
            url: remote.url.clone(),
            local_path: None,
            soft_deleted: false,
            sync_state: SyncState::Synced,
            last_synced_at: Some(remote.updated_at),
            local_revision: 0,
        })
    }

    /// Record the server's copy of a freshly uploaded resource.
    ///
    /// A resource deleted while its upload was in flight now has something to
    /// delete remotely, so it becomes `PendingDelete` instead of `Synced`.
    pub fn adopt_upload(&self, id: &ResourceId, remote: &RemoteResource) -> Result<()> {
        self.conn.execute(
            "UPDATE resources
             SET server_id = ?1, size = ?2, updated_at = ?3, url = ?4, last_synced_at = ?3,
                 sync_state = CASE WHEN soft_deleted = 1 THEN 'pending_delete' ELSE 'synced' END
             WHERE id = ?5 AND account_key = ?6",
            params![
                remote.remote_id,
                remote.size,
                remote.updated_at,
                remote.url,
                id,
                self.account,
            ],
        )?;
        Ok(())
    }

    /// Soft-delete a resource. Never-uploaded resources are settled immediately.
    pub fn mark_deleted(&self, id: &ResourceId) -> Result<StoredResource> {
        let mut resource = self.require(id)?;
        if resource.soft_deleted {
            return Err(Error::NotFound(format!("resource {id} is already deleted")));
        }

        resource.soft_deleted = true;
        resource.sync_state = if resource.server_id.is_none() {
            SyncState::Synced
        } else {
            SyncState::PendingDelete
        };
        resource.local_revision += 1;

        self.conn.execute(
            "UPDATE resources SET soft_deleted = 1, sync_state = ?1, local_revision = ?2
             WHERE id = ?3 AND account_key = ?4",
            params![
                resource.sync_state,
                resource.local_revision,
                resource.id,
                self.account
            ],
        )?;
        Ok(resource)
    }

    /// Final state of a drained deletion: gone on both sides, blob removed.
    pub fn mark_deletion_settled(&self, id: &ResourceId) -> Result<()> {
        self.conn.execute(
            "UPDATE resources SET soft_deleted = 1, sync_state = 'synced', local_path = NULL
             WHERE id = ?1 AND account_key = ?2",
            params![id, self.account],
        )?;
        Ok(())
    }

    pub fn set_local_path(&self, id: &ResourceId, path: &Path) -> Result<()> {
        self.conn.execute(
            "UPDATE resources SET local_path = ?1 WHERE id = ?2 AND account_key = ?3",
            params![path.to_string_lossy().into_owned(), id, self.account],
        )?;
        Ok(())
    }

    /// Move every resource of `from`, deleted ones included, over to `to`.
    pub fn reassign(&self, from: &MemoId, to: &MemoId) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE resources SET memo_id = ?1 WHERE memo_id = ?2 AND account_key = ?3",
            params![to, from, self.account],
        )?;
        Ok(rows)
    }

    /// Insert a never-uploaded copy of `source` attached to `memo_id`.
    ///
    /// The copy shares the source's blob and URL; it gets its own server id
    /// once it is uploaded.
    pub fn duplicate_into(
        &self,
        source: &StoredResource,
        memo_id: &MemoId,
    ) -> Result<StoredResource> {
        let copy = StoredResource {
            id: ResourceId::new(),
            account_key: self.account.to_string(),
            server_id: None,
            memo_id: Some(*memo_id),
            filename: source.filename.clone(),
            mime_type: source.mime_type.clone(),
            size: source.size,
            created_at: source.created_at,
            updated_at: now_millis(),
            url: source.url.clone(),
            local_path: source.local_path.clone(),
            soft_deleted: false,
            sync_state: SyncState::PendingCreate,
            last_synced_at: None,
            local_revision: 1,
        };
        self.insert(&copy)?;
        Ok(copy)
    }

    /// Whether a row other than `id` still points at the blob at `path`.
    pub fn blob_shared(&self, id: &ResourceId, path: &Path) -> Result<bool> {
        let shared: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM resources
                           WHERE account_key = ?1 AND local_path = ?2 AND id != ?3)",
            params![self.account, path.to_string_lossy().into_owned(), id],
            |row| row.get(0),
        )?;
        Ok(shared)
    }

    /// Every blob path still referenced by a row of this account.
    pub fn local_paths(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT local_path FROM resources WHERE account_key = ?1 AND local_path IS NOT NULL",
        )?;
        let paths = stmt
            .query_map(params![self.account], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(paths)
    }

    pub fn purge_tombstones(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM resources
             WHERE account_key = ?1 AND soft_deleted = 1 AND sync_state = 'synced'
               AND local_path IS NULL",
            params![self.account],
        )?;
        Ok(rows)
    }

    pub fn count_pending(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE account_key = ?1 AND sync_state != 'synced'",
            params![self.account],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
