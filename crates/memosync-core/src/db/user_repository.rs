//! Cached current-user snapshot

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::User;
use crate::util::now_millis;

pub struct UserRepository<'a> {
    conn: &'a Connection,
    account: &'a str,
}

impl<'a> UserRepository<'a> {
    pub const fn new(conn: &'a Connection, account: &'a str) -> Self {
        Self { conn, account }
    }

    pub fn load(&self) -> Result<Option<User>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM users WHERE account_key = ?1",
                params![self.account],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|payload| serde_json::from_str(&payload).map_err(Into::into))
            .transpose()
    }

    /// Store `user`, writing nothing if the snapshot is unchanged.
    pub fn save(&self, user: &User) -> Result<()> {
        let payload = serde_json::to_string(user)?;
        self.conn.execute(
            "INSERT INTO users (account_key, payload, refreshed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_key) DO UPDATE
             SET payload = excluded.payload, refreshed_at = excluded.refreshed_at
             WHERE users.payload != excluded.payload",
            params![self.account, payload, now_millis()],
        )?;
        Ok(())
    }
}
