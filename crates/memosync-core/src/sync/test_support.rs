//! In-memory server and fixtures for engine tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{watch, Notify};

use super::SyncService;
use crate::db::LocalStore;
use crate::models::{RowStatus, User, Visibility};
use crate::remote::{
    CreateMemoRequest, CreateResourceRequest, RemoteError, RemoteMemo, RemoteResource,
    RemoteResult, RemoteService, UpdateMemoRequest,
};
use crate::storage::FsResourceStore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct ServerState {
    clock: i64,
    next_id: u64,
    memos: BTreeMap<String, RemoteMemo>,
    resources: BTreeMap<String, RemoteResource>,
    blobs: HashMap<String, Vec<u8>>,
    calls: Vec<String>,
    failing: HashMap<&'static str, RemoteError>,
    offline: bool,
    ordering_violations: Vec<String>,
}

impl ServerState {
    fn tick(&mut self) -> i64 {
        self.clock += 1000;
        self.clock
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn resolve_resources(&mut self, operation: &str, ids: &[String]) -> Vec<RemoteResource> {
        ids.iter()
            .filter_map(|id| {
                let found = self.resources.get(id).cloned();
                if found.is_none() {
                    self.ordering_violations
                        .push(format!("{operation} referenced unknown resource {id}"));
                }
                found
            })
            .collect()
    }
}

/// Scripted stand-in for a memo server.
///
/// Uses a logical clock (each write advances `updated_at` by one second),
/// records every call, fails named operations on request and audits that
/// memo payloads only reference resources it has already created.
pub struct FakeRemote {
    state: Mutex<ServerState>,
    paused: watch::Sender<bool>,
    blocked: Notify,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState {
                clock: 1_700_000_000_000,
                ..ServerState::default()
            }),
            paused: watch::channel(false).0,
            blocked: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// Another client creates a memo.
    pub fn seed_memo(&self, content: &str) -> RemoteMemo {
        let mut state = self.lock();
        let now = state.tick();
        let id = state.next_id("m");
        let memo = RemoteMemo {
            remote_id: id.clone(),
            content: content.to_string(),
            pinned: false,
            row_status: RowStatus::Normal,
            visibility: Visibility::Private,
            resources: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        state.memos.insert(id, memo.clone());
        memo
    }

    /// Another client edits a memo.
    pub fn edit_memo(&self, id: &str, content: &str) -> RemoteMemo {
        let mut state = self.lock();
        let now = state.tick();
        let memo = state.memos.get_mut(id).unwrap();
        memo.content = content.to_string();
        memo.updated_at = now;
        memo.clone()
    }

    /// Another client deletes a memo.
    pub fn remove_memo(&self, id: &str) {
        self.lock().memos.remove(id);
    }

    pub fn memo(&self, id: &str) -> Option<RemoteMemo> {
        self.lock().memos.get(id).cloned()
    }

    pub fn memos(&self) -> Vec<RemoteMemo> {
        self.lock().memos.values().cloned().collect()
    }

    /// Another client writes `memo` under its own id, e.g. undoing a delete.
    pub fn put_memo(&self, mut memo: RemoteMemo) -> RemoteMemo {
        let mut state = self.lock();
        memo.updated_at = state.tick();
        state.memos.insert(memo.remote_id.clone(), memo.clone());
        memo
    }

    /// Bytes the server holds behind a resource URL.
    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(url).cloned()
    }

    pub fn resource(&self, id: &str) -> Option<RemoteResource> {
        self.lock().resources.get(id).cloned()
    }

    /// Another client attaches a file to a memo.
    pub fn seed_resource(&self, memo_id: &str, filename: &str, data: &[u8]) -> RemoteResource {
        let mut state = self.lock();
        let now = state.tick();
        let id = state.next_id("r");
        let resource = new_resource(&id, filename, "image/png", data.len(), now);
        if let Some(url) = resource.url.clone() {
            state.blobs.insert(url, data.to_vec());
        }
        state.resources.insert(id, resource.clone());
        let memo = state.memos.get_mut(memo_id).unwrap();
        memo.resources.push(resource.clone());
        memo.updated_at = now;
        resource
    }

    pub fn fail(&self, operation: &'static str) {
        self.fail_with(operation, RemoteError::Transport(format!("{operation} failed")));
    }

    pub fn fail_with(&self, operation: &'static str, error: RemoteError) {
        self.lock().failing.insert(operation, error);
    }

    pub fn recover(&self, operation: &'static str) {
        self.lock().failing.remove(operation);
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(operation))
            .count()
    }

    pub fn ordering_violations(&self) -> Vec<String> {
        self.lock().ordering_violations.clone()
    }

    /// Hold every following call until [`FakeRemote::resume`].
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Wait until a call is held by [`FakeRemote::pause`].
    pub async fn wait_until_blocked(&self) {
        self.blocked.notified().await;
    }

    async fn enter(&self, operation: &'static str, detail: &str) -> RemoteResult<()> {
        let mut paused = self.paused.subscribe();
        let held = *paused.borrow_and_update();
        if held {
            self.blocked.notify_one();
            let _ = paused.wait_for(|paused| !*paused).await;
        }

        let mut state = self.lock();
        state.calls.push(if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{operation} {detail}")
        });
        if state.offline {
            return Err(RemoteError::Transport("offline".to_string()));
        }
        if let Some(error) = state.failing.get(operation) {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn list_memos(&self) -> RemoteResult<Vec<RemoteMemo>> {
        self.enter("list_memos", "").await?;
        Ok(self
            .lock()
            .memos
            .values()
            .filter(|memo| memo.row_status == RowStatus::Normal)
            .cloned()
            .collect())
    }

    async fn list_archived_memos(&self) -> RemoteResult<Vec<RemoteMemo>> {
        self.enter("list_archived_memos", "").await?;
        Ok(self
            .lock()
            .memos
            .values()
            .filter(|memo| memo.row_status == RowStatus::Archived)
            .cloned()
            .collect())
    }

    async fn create_memo(&self, request: CreateMemoRequest) -> RemoteResult<RemoteMemo> {
        self.enter("create_memo", &request.content).await?;
        let mut state = self.lock();
        let resources = state.resolve_resources("create_memo", &request.resource_ids);
        let now = state.tick();
        let id = state.next_id("m");
        let memo = RemoteMemo {
            remote_id: id.clone(),
            content: request.content,
            pinned: false,
            row_status: RowStatus::Normal,
            visibility: request.visibility,
            resources,
            created_at: request.created_at.unwrap_or(now),
            updated_at: now,
        };
        state.memos.insert(id, memo.clone());
        Ok(memo)
    }

    async fn update_memo(
        &self,
        remote_id: &str,
        request: UpdateMemoRequest,
    ) -> RemoteResult<RemoteMemo> {
        self.enter("update_memo", remote_id).await?;
        let mut state = self.lock();
        if !state.memos.contains_key(remote_id) {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        let resources = request
            .resource_ids
            .as_deref()
            .map(|ids| state.resolve_resources("update_memo", ids));
        let now = state.tick();
        let memo = state
            .memos
            .get_mut(remote_id)
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        if let Some(content) = request.content {
            memo.content = content;
        }
        if let Some(visibility) = request.visibility {
            memo.visibility = visibility;
        }
        if let Some(pinned) = request.pinned {
            memo.pinned = pinned;
        }
        if let Some(resources) = resources {
            memo.resources = resources;
        }
        memo.updated_at = now;
        Ok(memo.clone())
    }

    async fn delete_memo(&self, remote_id: &str) -> RemoteResult<()> {
        self.enter("delete_memo", remote_id).await?;
        self.lock()
            .memos
            .remove(remote_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))
    }

    async fn archive_memo(&self, remote_id: &str) -> RemoteResult<()> {
        self.enter("archive_memo", remote_id).await?;
        set_row_status(&mut self.lock(), remote_id, RowStatus::Archived)
    }

    async fn restore_memo(&self, remote_id: &str) -> RemoteResult<()> {
        self.enter("restore_memo", remote_id).await?;
        set_row_status(&mut self.lock(), remote_id, RowStatus::Normal)
    }

    async fn create_resource(
        &self,
        request: CreateResourceRequest,
    ) -> RemoteResult<RemoteResource> {
        self.enter("create_resource", &request.filename).await?;
        let mut state = self.lock();
        let now = state.tick();
        let id = state.next_id("r");
        let resource = new_resource(
            &id,
            &request.filename,
            &request.mime_type,
            request.data.len(),
            now,
        );
        if let Some(url) = resource.url.clone() {
            state.blobs.insert(url, request.data);
        }
        state.resources.insert(id, resource.clone());
        Ok(resource)
    }

    async fn delete_resource(&self, remote_id: &str) -> RemoteResult<()> {
        self.enter("delete_resource", remote_id).await?;
        let mut state = self.lock();
        let removed = state.resources.remove(remote_id);
        for memo in state.memos.values_mut() {
            memo.resources.retain(|resource| resource.remote_id != remote_id);
        }
        removed
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))
    }

    async fn current_user(&self) -> RemoteResult<User> {
        self.enter("current_user", "").await?;
        Ok(User {
            remote_id: "users/1".to_string(),
            username: "alice".to_string(),
            nickname: Some("Alice".to_string()),
            email: None,
            avatar_url: None,
        })
    }

    async fn download(&self, url: &str, _mime_type: Option<&str>) -> RemoteResult<Vec<u8>> {
        self.enter("download", url).await?;
        self.lock()
            .blobs
            .get(url)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(url.to_string()))
    }
}

fn new_resource(id: &str, filename: &str, mime_type: &str, size: usize, now: i64) -> RemoteResource {
    RemoteResource {
        remote_id: id.to_string(),
        filename: filename.to_string(),
        size: i64::try_from(size).unwrap(),
        mime_type: mime_type.to_string(),
        created_at: now,
        updated_at: now,
        url: Some(format!("https://memos.test/file/{id}")),
    }
}

fn set_row_status(state: &mut ServerState, remote_id: &str, row_status: RowStatus) -> RemoteResult<()> {
    let now = state.tick();
    let memo = state
        .memos
        .get_mut(remote_id)
        .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
    memo.row_status = row_status;
    memo.updated_at = now;
    Ok(())
}

/// A service over an in-memory store, with blobs in a temporary directory.
pub struct Harness {
    pub service: SyncService,
    pub remote: Arc<FakeRemote>,
    pub blobs: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let remote = FakeRemote::new();
        let blobs = tempfile::tempdir().unwrap();
        let store = LocalStore::open_in_memory("alice@https://memos.test").unwrap();
        let files = FsResourceStore::new(blobs.path().join("resources"));
        let service = SyncService::new(store, remote.clone(), Arc::new(files));
        Self {
            service,
            remote,
            blobs,
        }
    }
}
