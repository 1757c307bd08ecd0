//! The full reconciliation pass.
//!
//! Compares a fresh server listing against every local record of the
//! account and settles each difference with the decisions from
//! [`super::resolve`]. Failures for a single record are logged and counted;
//! only failing to fetch the listing, or an authentication failure, aborts
//! the pass.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::push::Engine;
use super::resolve::{
    resolve_both_present, resolve_local_deleted, resolve_server_deleted, BothPresent,
    LocalDeleted, ServerDeleted,
};
use crate::models::{MemoId, SyncState};
use crate::remote::{RemoteError, RemoteMemo};
use crate::Result;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Server memos mirrored locally for the first time
    pub pulled: usize,
    /// Local records overwritten with the server's version
    pub updated_from_remote: usize,
    /// Local creates and updates sent to the server
    pub pushed: usize,
    /// Records duplicated to keep an unsynced local edit
    pub forked: usize,
    /// Memos deleted on the server
    pub deleted_remotely: usize,
    /// Local deletes undone because the server copy changed
    pub restored: usize,
    /// Server-side deletions accepted locally
    pub accepted_deletions: usize,
    /// Records pushed again after the server lost them
    pub recreated: usize,
    /// Resources removed on both sides
    pub resources_deleted: usize,
    /// Records left pending because a step failed
    pub failed: usize,
}

enum Step {
    Pulled,
    UpdatedFromRemote,
    Pushed,
    Forked(MemoId),
    DeletedRemotely,
    Restored,
    AcceptedDeletion,
    Recreated,
    Unchanged,
}

impl SyncReport {
    fn record(&mut self, step: &Step) {
        match step {
            Step::Pulled => self.pulled += 1,
            Step::UpdatedFromRemote => self.updated_from_remote += 1,
            Step::Pushed => self.pushed += 1,
            Step::Forked(_) => self.forked += 1,
            Step::DeletedRemotely => self.deleted_remotely += 1,
            Step::Restored => self.restored += 1,
            Step::AcceptedDeletion => self.accepted_deletions += 1,
            Step::Recreated => self.recreated += 1,
            Step::Unchanged => {}
        }
    }
}

impl Engine {
    /// Run one reconciliation pass. Callers serialize it behind the queue.
    pub(crate) async fn run_pass(&self) -> Result<SyncReport> {
        self.refresh_current_user().await?;

        let mut remote_memos = self.remote.list_memos().await?;
        remote_memos.extend(self.remote.list_archived_memos().await?);
        debug!(
            account = %self.store.account_key(),
            remote = remote_memos.len(),
            "Fetched remote listing"
        );

        let batch = self.store.begin_batch()?;
        let report = self.reconcile(&remote_memos).await;
        batch.commit()?;

        let report = report?;
        info!(account = %self.store.account_key(), ?report, "Sync pass finished");
        Ok(report)
    }

    async fn refresh_current_user(&self) -> Result<()> {
        match self.remote.current_user().await {
            Ok(user) => self.store.save_user(&user),
            Err(error) if error.is_auth_failure() => Err(error.into()),
            Err(error) => {
                warn!(%error, "Failed to refresh current user");
                Ok(())
            }
        }
    }

    async fn reconcile(&self, remote_memos: &[RemoteMemo]) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let locals = self.store.list_all_memos()?;
        let local_by_server: HashMap<&str, MemoId> = locals
            .iter()
            .filter_map(|memo| memo.server_id.as_deref().map(|server_id| (server_id, memo.id)))
            .collect();
        let remote_ids: HashSet<&str> = remote_memos
            .iter()
            .map(|memo| memo.remote_id.as_str())
            .collect();
        let mut forks = Vec::new();

        for remote in remote_memos {
            let step = match local_by_server.get(remote.remote_id.as_str()) {
                Some(local_id) => self.reconcile_matched(local_id, remote).await,
                None => self.pull(remote),
            };
            if let Some(Step::Forked(fork_id)) = settle(&mut report, step, &remote.remote_id)? {
                forks.push(fork_id);
            }
        }

        let mut creates: Vec<MemoId> = Vec::new();
        for local in &locals {
            match local.server_id.as_deref() {
                Some(server_id) if !remote_ids.contains(server_id) => {
                    let step = self.reconcile_server_deleted(&local.id);
                    if let Some(Step::Recreated) = settle(&mut report, step, server_id)? {
                        creates.push(local.id);
                    }
                }
                None if !local.soft_deleted => creates.push(local.id),
                _ => {}
            }
        }

        for id in creates {
            let step = self.push_pending_create(&id).await;
            settle(&mut report, step, "-")?;
        }

        self.drain_resource_deletions(&mut report).await?;

        // Forks are pushed on their own, after this pass.
        for fork_id in forks {
            self.enqueue_memo_push(fork_id);
        }

        Ok(report)
    }

    fn pull(&self, remote: &RemoteMemo) -> Result<Step> {
        let memo = self.store.apply_remote_memo(remote, false)?;
        debug!(memo = %memo.id, server_id = %remote.remote_id, "Pulled new memo");
        Ok(Step::Pulled)
    }

    async fn reconcile_matched(&self, local_id: &MemoId, remote: &RemoteMemo) -> Result<Step> {
        let Some(local) = self.store.memo(local_id)? else {
            return self.pull(remote);
        };

        if local.soft_deleted {
            if local.sync_state != SyncState::PendingDelete {
                // A local delete the server never heard about; the server wins.
                self.store.apply_remote_memo(remote, false)?;
                return Ok(Step::UpdatedFromRemote);
            }

            return match resolve_local_deleted(&local, remote) {
                LocalDeleted::Restore => {
                    info!(memo = %local.id, server_id = %remote.remote_id, "Server copy changed after delete; restoring");
                    self.store.apply_remote_memo(remote, true)?;
                    Ok(Step::Restored)
                }
                LocalDeleted::DeleteRemote => {
                    match self.remote.delete_memo(&remote.remote_id).await {
                        Ok(()) | Err(RemoteError::NotFound(_)) => {}
                        Err(error) => return Err(error.into()),
                    }
                    self.store.mark_memo_synced(&local.id, Some(remote.updated_at))?;
                    Ok(Step::DeletedRemotely)
                }
            };
        }

        let resources = self.store.resources_for_memo(local_id)?;
        match resolve_both_present(&local, &resources, remote) {
            BothPresent::AdoptRemoteVersion => {
                self.store.mark_memo_synced(&local.id, Some(remote.updated_at))?;
                self.store
                    .reconcile_resources(&remote.resources, &local.id, true)?;
                Ok(Step::Unchanged)
            }
            BothPresent::PullRemote => {
                self.store.apply_remote_memo(remote, false)?;
                Ok(Step::UpdatedFromRemote)
            }
            BothPresent::PushLocal => {
                self.push_update(&local, &remote.remote_id).await?;
                Ok(Step::Pushed)
            }
            BothPresent::Fork => {
                let fork = self.store.fork_memo(&local.id)?;
                self.store.apply_remote_memo(remote, false)?;
                info!(
                    memo = %local.id,
                    fork = %fork.id,
                    server_id = %remote.remote_id,
                    "Both sides changed; kept the local edit as a new memo"
                );
                Ok(Step::Forked(fork.id))
            }
        }
    }

    fn reconcile_server_deleted(&self, local_id: &MemoId) -> Result<Step> {
        let Some(local) = self.store.memo(local_id)? else {
            return Ok(Step::Unchanged);
        };

        match resolve_server_deleted(&local) {
            ServerDeleted::ConfirmDeletion => {
                self.store.mark_memo_synced(&local.id, None)?;
                Ok(Step::Unchanged)
            }
            ServerDeleted::Recreate => {
                info!(memo = %local.id, "Server lost a locally edited memo; recreating it");
                self.store.force_recreate(&local.id)?;
                Ok(Step::Recreated)
            }
            ServerDeleted::AcceptDeletion => {
                self.store.accept_remote_deletion(&local.id)?;
                Ok(Step::AcceptedDeletion)
            }
        }
    }

    async fn push_pending_create(&self, id: &MemoId) -> Result<Step> {
        let Some(memo) = self.store.memo(id)? else {
            return Ok(Step::Unchanged);
        };
        if memo.server_id.is_some() || memo.soft_deleted {
            return Ok(Step::Unchanged);
        }
        self.push_create(&memo).await?;
        Ok(Step::Pushed)
    }

    async fn drain_resource_deletions(&self, report: &mut SyncReport) -> Result<()> {
        for resource in self.store.pending_resource_deletions()? {
            match self.delete_resource_everywhere(&resource).await {
                Ok(()) => report.resources_deleted += 1,
                Err(error) if error.is_auth_failure() => return Err(error),
                Err(error) => {
                    warn!(resource = %resource.id, %error, "Resource deletion failed; will retry");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }
}

/// Fold one record's outcome into the report.
///
/// Authentication failures abort the pass; anything else is logged and
/// leaves the record for the next pass.
fn settle(report: &mut SyncReport, step: Result<Step>, server_id: &str) -> Result<Option<Step>> {
    match step {
        Ok(step) => {
            report.record(&step);
            Ok(Some(step))
        }
        Err(error) if error.is_auth_failure() => Err(error),
        Err(error) => {
            warn!(server_id, %error, "Failed to reconcile memo; will retry on next sync");
            report.failed += 1;
            Ok(None)
        }
    }
}
