//! Syncing Service: optimistic local writes, ordered pushes and the
//! reconciliation pass.

mod pass;
mod push;
mod queue;
mod resolve;
mod service;

#[cfg(test)]
mod test_support;

pub use pass::SyncReport;
pub use queue::OperationQueue;
pub use resolve::{
    is_equivalent, resolve_both_present, resolve_local_deleted, resolve_server_deleted,
    BothPresent, LocalDeleted, ServerDeleted,
};
pub use service::SyncService;
