//! Column mappings between SQLite rows and model types

use std::path::PathBuf;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;

use crate::models::{
    MemoId, ResourceId, RowStatus, StoredMemo, StoredResource, SyncState, Visibility,
};

pub const MEMO_COLUMNS: &str = "id, account_key, server_id, content, pinned, row_status, \
     visibility, created_at, updated_at, soft_deleted, sync_state, last_synced_at, local_revision";

pub const RESOURCE_COLUMNS: &str = "id, account_key, server_id, memo_id, filename, mime_type, \
     size, created_at, updated_at, url, local_path, soft_deleted, sync_state, last_synced_at, \
     local_revision";

fn parse_text<T>(value: ValueRef<'_>) -> FromSqlResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .as_str()?
        .parse()
        .map_err(|error: T::Err| FromSqlError::Other(error.to_string().into()))
}

macro_rules! text_column {
    ($ty:ty, $to_text:expr) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from($to_text(self)))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                parse_text(value)
            }
        }
    };
}

text_column!(MemoId, |id: &MemoId| id.as_str());
text_column!(ResourceId, |id: &ResourceId| id.as_str());
text_column!(SyncState, |state: &SyncState| state.as_str());
text_column!(RowStatus, |status: &RowStatus| status.as_str());
text_column!(Visibility, |visibility: &Visibility| visibility.as_str());

/// Parse a memo from a row selected with [`MEMO_COLUMNS`]
pub fn parse_memo(row: &Row<'_>) -> rusqlite::Result<StoredMemo> {
    Ok(StoredMemo {
        id: row.get(0)?,
        account_key: row.get(1)?,
        server_id: row.get(2)?,
        content: row.get(3)?,
        pinned: row.get(4)?,
        row_status: row.get(5)?,
        visibility: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        soft_deleted: row.get(9)?,
        sync_state: row.get(10)?,
        last_synced_at: row.get(11)?,
        local_revision: row.get(12)?,
    })
}

/// Parse a resource from a row selected with [`RESOURCE_COLUMNS`]
pub fn parse_resource(row: &Row<'_>) -> rusqlite::Result<StoredResource> {
    Ok(StoredResource {
        id: row.get(0)?,
        account_key: row.get(1)?,
        server_id: row.get(2)?,
        memo_id: row.get(3)?,
        filename: row.get(4)?,
        mime_type: row.get(5)?,
        size: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        url: row.get(9)?,
        local_path: row.get::<_, Option<String>>(10)?.map(PathBuf::from),
        soft_deleted: row.get(11)?,
        sync_state: row.get(12)?,
        last_synced_at: row.get(13)?,
        local_revision: row.get(14)?,
    })
}
