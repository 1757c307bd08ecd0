//! Conflict resolution decisions.
//!
//! These functions only decide; the reconciliation pass carries the
//! decisions out.
//!
//! All of them prefer keeping unsynced user data over merging it: when both
//! sides changed, the local edit is forked into a new record rather than
//! combined with the server's version.

use std::collections::BTreeSet;

use crate::models::{StoredMemo, StoredResource};
use crate::remote::RemoteMemo;

/// Outcome for a memo present on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BothPresent {
    /// Same user-visible state; only record the server's version.
    AdoptRemoteVersion,
    /// Only the server changed; overwrite local.
    PullRemote,
    /// Only the local copy changed; push it.
    PushLocal,
    /// Both changed; copy local into a new record, then pull into the original.
    Fork,
}

/// Outcome for a memo deleted locally but still listed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDeleted {
    /// The server copy moved on since the delete; bring it back.
    Restore,
    /// The server still holds what was deleted; delete it remotely.
    DeleteRemote,
}

/// Outcome for a memo with a server id the server no longer lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerDeleted {
    /// Deleted on both sides.
    ConfirmDeletion,
    /// Unsynced local changes; push the memo again as a new record.
    Recreate,
    /// Nothing local to lose; follow the server.
    AcceptDeletion,
}

/// Whether `local` (with its live `resources`) shows the same thing as `remote`.
///
/// Tags are derived from content and are not compared on their own. A live
/// resource that was never uploaded always makes the two differ.
pub fn is_equivalent(local: &StoredMemo, resources: &[StoredResource], remote: &RemoteMemo) -> bool {
    if !same_fields(local, remote) {
        return false;
    }

    let mut local_ids = BTreeSet::new();
    for resource in resources {
        match resource.server_id.as_deref() {
            Some(server_id) => {
                local_ids.insert(server_id);
            }
            None => return false,
        }
    }
    local_ids == remote.resource_ids().collect::<BTreeSet<_>>()
}

fn same_fields(local: &StoredMemo, remote: &RemoteMemo) -> bool {
    local.content == remote.content
        && local.pinned == remote.pinned
        && local.row_status == remote.row_status
        && local.visibility == remote.visibility
}

pub fn resolve_both_present(
    local: &StoredMemo,
    resources: &[StoredResource],
    remote: &RemoteMemo,
) -> BothPresent {
    if is_equivalent(local, resources, remote) {
        BothPresent::AdoptRemoteVersion
    } else if !local.local_changed() {
        BothPresent::PullRemote
    } else if !local.remote_changed(remote.updated_at) {
        BothPresent::PushLocal
    } else {
        BothPresent::Fork
    }
}

/// `local` must be soft-deleted and `PendingDelete`.
///
/// The delete covers the server version last synced with. Field comparison
/// only applies while the tombstone still shows that version; a memo edited
/// and then deleted before the edit was pushed is compared by version alone.
pub fn resolve_local_deleted(local: &StoredMemo, remote: &RemoteMemo) -> LocalDeleted {
    if local.remote_changed(remote.updated_at)
        || (local.mirrors_last_sync() && !same_fields(local, remote))
    {
        LocalDeleted::Restore
    } else {
        LocalDeleted::DeleteRemote
    }
}

pub const fn resolve_server_deleted(local: &StoredMemo) -> ServerDeleted {
    if local.soft_deleted {
        ServerDeleted::ConfirmDeletion
    } else if local.local_changed() {
        ServerDeleted::Recreate
    } else {
        ServerDeleted::AcceptDeletion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemoId, ResourceId, RowStatus, SyncState, Visibility};
    use crate::remote::RemoteResource;

    fn local(content: &str, sync_state: SyncState, last_synced_at: i64) -> StoredMemo {
        StoredMemo {
            id: MemoId::new(),
            account_key: "alice".to_string(),
            server_id: Some("m1".to_string()),
            content: content.to_string(),
            pinned: false,
            row_status: RowStatus::Normal,
            visibility: Visibility::Private,
            created_at: 1,
            updated_at: last_synced_at,
            soft_deleted: false,
            sync_state,
            last_synced_at: Some(last_synced_at),
            local_revision: 0,
        }
    }

    fn remote(content: &str, updated_at: i64) -> RemoteMemo {
        RemoteMemo {
            remote_id: "m1".to_string(),
            content: content.to_string(),
            pinned: false,
            row_status: RowStatus::Normal,
            visibility: Visibility::Private,
            resources: Vec::new(),
            created_at: 1,
            updated_at,
        }
    }

    fn stored_resource(server_id: Option<&str>) -> StoredResource {
        StoredResource {
            id: ResourceId::new(),
            account_key: "alice".to_string(),
            server_id: server_id.map(str::to_string),
            memo_id: None,
            filename: "a.png".to_string(),
            mime_type: "image/png".to_string(),
            size: 1,
            created_at: 1,
            updated_at: 1,
            url: None,
            local_path: None,
            soft_deleted: false,
            sync_state: SyncState::Synced,
            last_synced_at: None,
            local_revision: 0,
        }
    }

    fn remote_resource(id: &str) -> RemoteResource {
        RemoteResource {
            remote_id: id.to_string(),
            filename: "a.png".to_string(),
            size: 1,
            mime_type: "image/png".to_string(),
            created_at: 1,
            updated_at: 1,
            url: None,
        }
    }

    #[test]
    fn equivalent_records_only_adopt_the_remote_version() {
        let memo = local("A", SyncState::PendingUpdate, 10);
        assert_eq!(
            resolve_both_present(&memo, &[], &remote("A", 99)),
            BothPresent::AdoptRemoteVersion
        );
    }

    #[test]
    fn unchanged_local_pulls_remote() {
        let memo = local("A", SyncState::Synced, 10);
        assert_eq!(
            resolve_both_present(&memo, &[], &remote("C", 20)),
            BothPresent::PullRemote
        );
    }

    #[test]
    fn changed_local_over_unchanged_remote_pushes() {
        let memo = local("B", SyncState::PendingUpdate, 10);
        assert_eq!(
            resolve_both_present(&memo, &[], &remote("A", 10)),
            BothPresent::PushLocal
        );
    }

    #[test]
    fn both_changed_forks() {
        let memo = local("B", SyncState::PendingUpdate, 10);
        assert_eq!(
            resolve_both_present(&memo, &[], &remote("C", 20)),
            BothPresent::Fork
        );
    }

    #[test]
    fn remote_change_is_an_equality_test_not_an_ordering() {
        // An older server clock still counts as a change.
        let memo = local("B", SyncState::PendingUpdate, 10);
        assert_eq!(
            resolve_both_present(&memo, &[], &remote("C", 5)),
            BothPresent::Fork
        );
    }

    #[test]
    fn resource_identity_is_part_of_equivalence() {
        let memo = local("A", SyncState::Synced, 10);
        let mut with_resource = remote("A", 10);
        with_resource.resources = vec![remote_resource("r1")];

        assert!(is_equivalent(&memo, &[stored_resource(Some("r1"))], &with_resource));
        assert!(!is_equivalent(&memo, &[], &with_resource));
        assert!(!is_equivalent(
            &memo,
            &[stored_resource(Some("r1")), stored_resource(None)],
            &with_resource
        ));
    }

    #[test]
    fn pinned_and_row_status_are_part_of_equivalence() {
        let memo = local("A", SyncState::Synced, 10);
        let mut pinned = remote("A", 10);
        pinned.pinned = true;
        assert!(!is_equivalent(&memo, &[], &pinned));

        let archived = remote("A", 10).with_row_status(RowStatus::Archived);
        assert!(!is_equivalent(&memo, &[], &archived));
    }

    #[test]
    fn local_delete_is_confirmed_only_against_an_unchanged_remote() {
        let mut memo = local("A", SyncState::PendingDelete, 10);
        memo.soft_deleted = true;

        assert_eq!(
            resolve_local_deleted(&memo, &remote("A", 10)),
            LocalDeleted::DeleteRemote
        );
        assert_eq!(
            resolve_local_deleted(&memo, &remote("A", 11)),
            LocalDeleted::Restore
        );
        assert_eq!(
            resolve_local_deleted(&memo, &remote("changed", 10)),
            LocalDeleted::Restore
        );
    }

    #[test]
    fn delete_over_an_unpushed_edit_is_judged_by_version() {
        let mut memo = local("A, edited", SyncState::PendingDelete, 10);
        memo.updated_at = 15;
        memo.soft_deleted = true;

        assert_eq!(
            resolve_local_deleted(&memo, &remote("A", 10)),
            LocalDeleted::DeleteRemote
        );
        assert_eq!(
            resolve_local_deleted(&memo, &remote("A", 12)),
            LocalDeleted::Restore
        );
    }

    #[test]
    fn server_deletion_outcomes() {
        let mut deleted = local("A", SyncState::PendingDelete, 10);
        deleted.soft_deleted = true;
        assert_eq!(resolve_server_deleted(&deleted), ServerDeleted::ConfirmDeletion);

        let edited = local("B", SyncState::PendingUpdate, 10);
        assert_eq!(resolve_server_deleted(&edited), ServerDeleted::Recreate);

        let untouched = local("A", SyncState::Synced, 10);
        assert_eq!(resolve_server_deleted(&untouched), ServerDeleted::AcceptDeletion);
    }
}
