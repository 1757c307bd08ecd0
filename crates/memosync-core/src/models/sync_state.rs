//! Per-record propagation state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a locally mirrored record stands relative to the server.
///
/// A record without a server id is always `PendingCreate`, apart from the
/// short window where its create push is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local copy matches the last server version we saw
    #[default]
    Synced,
    /// Never reached the server
    PendingCreate,
    /// Known to the server, edited locally since
    PendingUpdate,
    /// Known to the server, deleted locally since
    PendingDelete,
}

impl SyncState {
    /// Stable storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::PendingCreate => "pending_create",
            Self::PendingUpdate => "pending_update",
            Self::PendingDelete => "pending_delete",
        }
    }

    /// Whether the record carries a change the server has not seen.
    pub const fn is_pending(self) -> bool {
        !matches!(self, Self::Synced)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending_create" => Ok(Self::PendingCreate),
            "pending_update" => Ok(Self::PendingUpdate),
            "pending_delete" => Ok(Self::PendingDelete),
            other => Err(format!("unknown sync state: {other}")),
        }
    }
}
