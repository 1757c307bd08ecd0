//! Data models for memosync

mod memo;
mod resource;
mod sync_state;
mod user;

pub use memo::{extract_tags, MemoId, RowStatus, StoredMemo, Visibility};
pub use resource::{NewResource, ResourceId, StoredResource};
pub use sync_state::SyncState;
pub use user::User;
