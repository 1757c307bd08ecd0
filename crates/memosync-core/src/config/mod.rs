//! Runtime configuration for the sync engine.
//!
//! A `SyncConfig` names where the local mirror lives, which account it is
//! scoped to and how often the background reconciliation pass runs.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::util::{normalize_text_option, sanitize_token};
use crate::{Error, Result};

const ENV_DATA_DIR: &str = "MEMOSYNC_DATA_DIR";
const ENV_ACCOUNT: &str = "MEMOSYNC_ACCOUNT";
const ENV_SYNC_INTERVAL_SECS: &str = "MEMOSYNC_SYNC_INTERVAL_SECS";

const DATABASE_FILE_NAME: &str = "memosync.db";
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Where and for whom the engine keeps its local mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Directory holding the database and resource blobs
    pub data_dir: PathBuf,
    /// Account the mirror is scoped to (e.g. `alice@https://memos.example.com`)
    pub account_key: String,
    /// Automatic sync interval; `None` means manual sync only
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    /// Create a configuration with the default 60 second sync interval.
    pub fn new(data_dir: impl Into<PathBuf>, account_key: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            account_key: account_key.into(),
            sync_interval: Some(DEFAULT_SYNC_INTERVAL),
        }
    }

    /// Set the automatic sync interval
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disable automatic sync (manual sync only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Returns `Ok(None)` when none of the variables are set and an error when
    /// only part of the required configuration is present.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }

    /// Path of this account's SQLite database.
    ///
    /// Each account gets its own file, so one account's open sync batch never
    /// holds the write lock another account's local writes wait on.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir
            .join("accounts")
            .join(self.account_dir_name())
            .join(DATABASE_FILE_NAME)
    }

    /// Directory holding this account's resource blobs.
    #[must_use]
    pub fn resources_dir(&self) -> PathBuf {
        self.data_dir.join("resources").join(self.account_dir_name())
    }

    fn account_dir_name(&self) -> String {
        let account = sanitize_token(&self.account_key);
        if account.is_empty() {
            "default".to_string()
        } else {
            account
        }
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<SyncConfig>> {
    let data_dir = normalize_text_option(lookup(ENV_DATA_DIR));
    let account_key = normalize_text_option(lookup(ENV_ACCOUNT));
    let interval = normalize_text_option(lookup(ENV_SYNC_INTERVAL_SECS));

    if data_dir.is_none() && account_key.is_none() && interval.is_none() {
        return Ok(None);
    }

    let mut missing = Vec::new();
    if data_dir.is_none() {
        missing.push(ENV_DATA_DIR);
    }
    if account_key.is_none() {
        missing.push(ENV_ACCOUNT);
    }
    let (Some(data_dir), Some(account_key)) = (data_dir, account_key) else {
        return Err(Error::InvalidInput(format!(
            "Sync configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    };

    let sync_interval = match interval {
        None => Some(DEFAULT_SYNC_INTERVAL),
        Some(raw) => parse_interval(&raw)?,
    };

    Ok(Some(SyncConfig {
        data_dir: PathBuf::from(data_dir),
        account_key,
        sync_interval,
    }))
}

fn parse_interval(raw: &str) -> Result<Option<Duration>> {
    let secs: u64 = raw.parse().map_err(|_| {
        Error::InvalidInput(format!(
            "{ENV_SYNC_INTERVAL_SECS} must be a whole number of seconds, got {raw:?}"
        ))
    })?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse_from_map(map: &HashMap<&str, &str>) -> Result<Option<SyncConfig>> {
        parse_config(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn parse_config_none_returns_none() {
        assert!(parse_from_map(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn parse_config_requires_data_dir_and_account() {
        let map = HashMap::from([(ENV_SYNC_INTERVAL_SECS, "30")]);

        match parse_from_map(&map).unwrap_err() {
            Error::InvalidInput(message) => {
                assert!(message.contains(ENV_DATA_DIR));
                assert!(message.contains(ENV_ACCOUNT));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_config_defaults_interval() {
        let map = HashMap::from([(ENV_DATA_DIR, " /tmp/memosync "), (ENV_ACCOUNT, "alice")]);
        let config = parse_from_map(&map).unwrap().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/memosync"));
        assert_eq!(config.account_key, "alice");
        assert_eq!(config.sync_interval, Some(DEFAULT_SYNC_INTERVAL));
    }

    #[test]
    fn parse_config_zero_interval_disables_auto_sync() {
        let map = HashMap::from([
            (ENV_DATA_DIR, "/tmp/memosync"),
            (ENV_ACCOUNT, "alice"),
            (ENV_SYNC_INTERVAL_SECS, "0"),
        ]);
        assert_eq!(parse_from_map(&map).unwrap().unwrap().sync_interval, None);
    }

    #[test]
    fn parse_config_rejects_bad_interval() {
        let map = HashMap::from([
            (ENV_DATA_DIR, "/tmp/memosync"),
            (ENV_ACCOUNT, "alice"),
            (ENV_SYNC_INTERVAL_SECS, "soon"),
        ]);
        assert!(parse_from_map(&map).is_err());
    }

    #[test]
    fn derived_paths_are_account_scoped() {
        let config = SyncConfig::new("/data", "Alice@https://memos.example.com");
        assert_eq!(
            config.database_path(),
            PathBuf::from("/data/accounts/alice-https-memos-example-com/memosync.db")
        );
        assert_eq!(
            config.resources_dir(),
            PathBuf::from("/data/resources/alice-https-memos-example-com")
        );
        assert!(config.without_auto_sync().sync_interval.is_none());
    }

    #[test]
    fn accounts_on_one_data_dir_get_separate_databases() {
        let alice = SyncConfig::new("/data", "alice@https://memos.example.com");
        let bob = SyncConfig::new("/data", "bob@https://memos.example.com");
        assert_ne!(alice.database_path(), bob.database_path());
        assert_eq!(
            SyncConfig::new("/data", "???").database_path(),
            PathBuf::from("/data/accounts/default/memosync.db")
        );
    }
}
