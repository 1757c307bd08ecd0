//! Memo mirror queries

use rusqlite::{params, Connection, OptionalExtension};

use super::mapping::{parse_memo, MEMO_COLUMNS};
use crate::error::{Error, Result};
use crate::models::{MemoId, RowStatus, StoredMemo, SyncState, Visibility};
use crate::remote::RemoteMemo;
use crate::util::now_millis;

/// A user edit to an existing memo; `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoChanges {
    pub content: Option<String>,
    pub pinned: Option<bool>,
    pub row_status: Option<RowStatus>,
    pub visibility: Option<Visibility>,
}

impl MemoChanges {
    #[must_use]
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn row_status(row_status: RowStatus) -> Self {
        Self {
            row_status: Some(row_status),
            ..Self::default()
        }
    }
}

/// Account-scoped memo queries over a borrowed connection
pub struct MemoRepository<'a> {
    conn: &'a Connection,
    account: &'a str,
}

impl<'a> MemoRepository<'a> {
    pub const fn new(conn: &'a Connection, account: &'a str) -> Self {
        Self { conn, account }
    }

    /// Insert a user-created memo awaiting its first push.
    pub fn create_local(&self, content: &str, visibility: Visibility) -> Result<StoredMemo> {
        let now = now_millis();
        let memo = StoredMemo {
            id: MemoId::new(),
            account_key: self.account.to_string(),
            server_id: None,
            content: content.to_string(),
            pinned: false,
            row_status: RowStatus::Normal,
            visibility,
            created_at: now,
            updated_at: now,
            soft_deleted: false,
            sync_state: SyncState::PendingCreate,
            last_synced_at: None,
            local_revision: 1,
        };
        self.insert(&memo)?;
        Ok(memo)
    }

    fn insert(&self, memo: &StoredMemo) -> Result<()> {
        self.conn.execute(
            &format!("INSERT INTO memos ({MEMO_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
            params![
                memo.id,
                memo.account_key,
                memo.server_id,
                memo.content,
                memo.pinned,
                memo.row_status,
                memo.visibility,
                memo.created_at,
                memo.updated_at,
                memo.soft_deleted,
                memo.sync_state,
                memo.last_synced_at,
                memo.local_revision,
            ],
        )?;
        Ok(())
    }

    /// Fetch a memo by local id, soft-deleted or not.
    pub fn get(&self, id: &MemoId) -> Result<Option<StoredMemo>> {
        let memo = self
            .conn
            .query_row(
                &format!("SELECT {MEMO_COLUMNS} FROM memos WHERE id = ?1 AND account_key = ?2"),
                params![id, self.account],
                parse_memo,
            )
            .optional()?;
        Ok(memo)
    }

    /// Fetch a memo that must exist.
    pub fn require(&self, id: &MemoId) -> Result<StoredMemo> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("memo {id}")))
    }

    pub fn find_by_server_id(&self, server_id: &str) -> Result<Option<StoredMemo>> {
        let memo = self
            .conn
            .query_row(
                &format!(
                    "SELECT {MEMO_COLUMNS} FROM memos WHERE account_key = ?1 AND server_id = ?2"
                ),
                params![self.account, server_id],
                parse_memo,
            )
            .optional()?;
        Ok(memo)
    }

    /// Non-deleted memos with `row_status`, pinned first then newest first.
    pub fn list(&self, row_status: RowStatus) -> Result<Vec<StoredMemo>> {
        self.query(
            &format!(
                "SELECT {MEMO_COLUMNS} FROM memos
                 WHERE account_key = ?1 AND soft_deleted = 0 AND row_status = ?2
                 ORDER BY pinned DESC, created_at DESC"
            ),
            params![self.account, row_status],
        )
    }

    /// Every memo of the account, including soft-deleted ones.
    pub fn list_all(&self) -> Result<Vec<StoredMemo>> {
        self.query(
            &format!(
                "SELECT {MEMO_COLUMNS} FROM memos WHERE account_key = ?1 ORDER BY created_at ASC"
            ),
            params![self.account],
        )
    }

    /// Memos whose sync state is anything but `Synced`, oldest first.
    pub fn list_pending(&self) -> Result<Vec<StoredMemo>> {
        self.query(
            &format!(
                "SELECT {MEMO_COLUMNS} FROM memos
                 WHERE account_key = ?1 AND sync_state != 'synced'
                 ORDER BY created_at ASC"
            ),
            params![self.account],
        )
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<StoredMemo>> {
        let mut stmt = self.conn.prepare(sql)?;
        let memos = stmt
            .query_map(params, parse_memo)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(memos)
    }

    /// Apply a user edit and move the record along the mutation state machine.
    ///
    /// A memo the server has never seen stays `PendingCreate`; anything else
    /// becomes `PendingUpdate`.
    pub fn apply_local_edit(&self, id: &MemoId, changes: &MemoChanges) -> Result<StoredMemo> {
        let mut memo = self.require(id)?;
        if memo.soft_deleted {
            return Err(Error::NotFound(format!("memo {id} is deleted")));
        }

        if let Some(content) = &changes.content {
            memo.content.clone_from(content);
        }
        if let Some(pinned) = changes.pinned {
            memo.pinned = pinned;
        }
        if let Some(row_status) = changes.row_status {
            memo.row_status = row_status;
        }
        if let Some(visibility) = changes.visibility {
            memo.visibility = visibility;
        }
        memo.sync_state = if memo.server_id.is_none() {
            SyncState::PendingCreate
        } else {
            SyncState::PendingUpdate
        };
        memo.updated_at = now_millis();
        memo.local_revision += 1;

        self.conn.execute(
            "UPDATE memos
             SET content = ?1, pinned = ?2, row_status = ?3, visibility = ?4,
                 updated_at = ?5, sync_state = ?6, local_revision = ?7
             WHERE id = ?8 AND account_key = ?9",
            params![
                memo.content,
                memo.pinned,
                memo.row_status,
                memo.visibility,
                memo.updated_at,
                memo.sync_state,
                memo.local_revision,
                memo.id,
                self.account,
            ],
        )?;
        Ok(memo)
    }

    /// Soft-delete a memo. Memos the server never saw are settled immediately.
    ///
    /// The tombstone keeps any unpushed edit and its `updated_at`, so the
    /// pending delete is later checked against the last synced version only.
    pub fn mark_deleted(&self, id: &MemoId) -> Result<StoredMemo> {
        let mut memo = self.require(id)?;
        if memo.soft_deleted {
            return Err(Error::NotFound(format!("memo {id} is already deleted")));
        }

        memo.soft_deleted = true;
        memo.sync_state = if memo.server_id.is_none() {
            SyncState::Synced
        } else {
            SyncState::PendingDelete
        };
        memo.local_revision += 1;

        self.conn.execute(
            "UPDATE memos SET soft_deleted = 1, sync_state = ?1, local_revision = ?2
             WHERE id = ?3 AND account_key = ?4",
            params![memo.sync_state, memo.local_revision, memo.id, self.account],
        )?;
        Ok(memo)
    }

    /// Insert or overwrite the mirror of `remote`, matched by server id.
    ///
    /// Content fields, timestamps and `last_synced_at` come from the server;
    /// the soft-delete flag is cleared.
    pub fn upsert_remote(&self, remote: &RemoteMemo, sync_state: SyncState) -> Result<StoredMemo> {
        if let Some(existing) = self.find_by_server_id(&remote.remote_id)? {
            self.overwrite_from_remote(&existing.id, remote, sync_state)?;
            return self.require(&existing.id);
        }

        let memo = StoredMemo {
            id: MemoId::new(),
            account_key: self.account.to_string(),
            server_id: Some(remote.remote_id.clone()),
            content: remote.content.clone(),
            pinned: remote.pinned,
            row_status: remote.row_status,
            visibility: remote.visibility,
            created_at: remote.created_at,
            updated_at: remote.updated_at,
            soft_deleted: false,
            sync_state,
            last_synced_at: Some(remote.updated_at),
            local_revision: 0,
        };
        self.insert(&memo)?;
        Ok(memo)
    }

    /// Copy server truth onto the row with local id `id`, assigning its server id.
    pub fn overwrite_from_remote(
        &self,
        id: &MemoId,
        remote: &RemoteMemo,
        sync_state: SyncState,
    ) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE memos
             SET server_id = ?1, content = ?2, pinned = ?3, row_status = ?4, visibility = ?5,
                 created_at = ?6, updated_at = ?7, soft_deleted = 0, sync_state = ?8,
                 last_synced_at = ?7
             WHERE id = ?9 AND account_key = ?10",
            params![
                remote.remote_id,
                remote.content,
                remote.pinned,
                remote.row_status,
                remote.visibility,
                remote.created_at,
                remote.updated_at,
                sync_state,
                id,
                self.account,
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("memo {id}")));
        }
        Ok(())
    }

    /// Record a server id and version without touching local content.
    ///
    /// Used when the user changed the record while its push was in flight.
    pub fn record_server_version(
        &self,
        id: &MemoId,
        server_id: &str,
        last_synced_at: i64,
        sync_state: SyncState,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE memos SET server_id = ?1, last_synced_at = ?2, sync_state = ?3
             WHERE id = ?4 AND account_key = ?5",
            params![server_id, last_synced_at, sync_state, id, self.account],
        )?;
        Ok(())
    }

    /// Settle a record as `Synced`, optionally adopting a server version.
    ///
    /// Writes nothing when the row is already in that state.
    pub fn mark_synced(&self, id: &MemoId, last_synced_at: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE memos
             SET sync_state = 'synced', last_synced_at = COALESCE(?1, last_synced_at)
             WHERE id = ?2 AND account_key = ?3
               AND (sync_state != 'synced'
                    OR (?1 IS NOT NULL AND last_synced_at IS NOT ?1))",
            params![last_synced_at, id, self.account],
        )?;
        Ok(())
    }

    /// Accept a server-side deletion.
    pub fn mark_deleted_and_synced(&self, id: &MemoId) -> Result<()> {
        self.conn.execute(
            "UPDATE memos SET soft_deleted = 1, sync_state = 'synced'
             WHERE id = ?1 AND account_key = ?2
               AND (soft_deleted = 0 OR sync_state != 'synced')",
            params![id, self.account],
        )?;
        Ok(())
    }

    /// Forget the server id so the record is pushed again as a new memo.
    pub fn force_recreate(&self, id: &MemoId) -> Result<()> {
        self.conn.execute(
            "UPDATE memos SET server_id = NULL, last_synced_at = NULL, sync_state = ?1
             WHERE id = ?2 AND account_key = ?3",
            params![SyncState::PendingCreate, id, self.account],
        )?;
        Ok(())
    }

    /// Insert a fresh `PendingCreate` copy of `source`'s user-visible fields.
    pub fn duplicate_as_new(&self, source: &StoredMemo) -> Result<StoredMemo> {
        let now = now_millis();
        let copy = StoredMemo {
            id: MemoId::new(),
            account_key: self.account.to_string(),
            server_id: None,
            content: source.content.clone(),
            pinned: source.pinned,
            row_status: source.row_status,
            visibility: source.visibility,
            created_at: source.created_at,
            updated_at: now,
            soft_deleted: false,
            sync_state: SyncState::PendingCreate,
            last_synced_at: None,
            local_revision: 1,
        };
        self.insert(&copy)?;
        Ok(copy)
    }

    /// Remove a row outright. Attached resources cascade.
    pub fn hard_delete(&self, id: &MemoId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM memos WHERE id = ?1 AND account_key = ?2",
            params![id, self.account],
        )?;
        Ok(())
    }

    /// Drop soft-deleted rows whose deletion both sides agree on.
    pub fn purge_tombstones(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM memos WHERE account_key = ?1 AND soft_deleted = 1 AND sync_state = 'synced'",
            params![self.account],
        )?;
        Ok(rows)
    }

    pub fn count_pending(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memos WHERE account_key = ?1 AND sync_state != 'synced'",
            params![self.account],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
