use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};
use tracing::debug;

use crate::migrate::{open_connection, unix_timestamp};

pub trait Session {
    fn id(&self) -> &str;
    fn client_ip(&self) -> Option<IpAddr>;
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String);
    /// Persist pending writes.
    fn save(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    id: String,
    ip: Option<IpAddr>,
    data: BTreeMap<String, String>,
    saves: usize,
}

impl MemorySession {
    pub fn new(id: impl Into<String>, ip: Option<IpAddr>) -> Self {
        Self {
            id: id.into(),
            ip,
            ..Self::default()
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.ip
    }

    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.data.insert(key.to_string(), value);
    }

    fn save(&mut self) -> Result<()> {
        self.saves += 1;
        Ok(())
    }
}

/// Sessions kept in the `session_data` and `session_meta` tables.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Load `session_id`, registering it with `ip` on first sight. A
    /// recorded IP wins over the one passed in.
    pub fn load(&self, session_id: &str, ip: Option<IpAddr>) -> Result<StoredSession> {
        let connection = open_connection(&self.db_path)?;
        let stored_ip: Option<Option<String>> = connection
            .query_row(
                "SELECT client_ip FROM session_meta WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read session {session_id}"))?;

        let client_ip = match stored_ip {
            Some(recorded) => recorded.and_then(|value| value.parse().ok()).or(ip),
            None => {
                connection
                    .execute(
                        "INSERT INTO session_meta (session_id, client_ip, created_at_unix) VALUES (?1, ?2, ?3)",
                        params![session_id, ip.map(|ip| ip.to_string()), unix_timestamp()?],
                    )
                    .with_context(|| format!("failed to register session {session_id}"))?;
                ip
            }
        };

        let mut statement = connection
            .prepare("SELECT data_key, data_value FROM session_data WHERE session_id = ?1")
            .context("failed to prepare session data query")?;
        let rows = statement
            .query_map([session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to run session data query")?;
        let mut data = BTreeMap::new();
        for row in rows {
            let (key, value) = row.context("failed to read session data row")?;
            data.insert(key, value);
        }

        Ok(StoredSession {
            store: self.clone(),
            id: session_id.to_string(),
            ip: client_ip,
            data,
            dirty: BTreeMap::new(),
        })
    }

    fn persist(&self, session_id: &str, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut connection = open_connection(&self.db_path)?;
        let transaction = connection
            .transaction()
            .context("failed to start session transaction")?;
        let now = unix_timestamp()?;
        for (key, value) in entries {
            transaction
                .execute(
                    "INSERT INTO session_data (session_id, data_key, data_value, updated_at_unix)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(session_id, data_key) DO UPDATE SET
                       data_value = excluded.data_value,
                       updated_at_unix = excluded.updated_at_unix",
                    params![session_id, key, value, now],
                )
                .with_context(|| format!("failed to write session key {key}"))?;
        }
        transaction
            .commit()
            .context("failed to commit session transaction")?;
        debug!(session = session_id, keys = entries.len(), "session saved");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredSession {
    store: SqliteSessionStore,
    id: String,
    ip: Option<IpAddr>,
    data: BTreeMap<String, String>,
    dirty: BTreeMap<String, String>,
}

impl Session for StoredSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.ip
    }

    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.data.insert(key.to_string(), value.clone());
        self.dirty.insert(key.to_string(), value);
    }

    fn save(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        self.store.persist(&self.id, &self.dirty)?;
        self.dirty.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tempfile::tempdir;

    use super::*;
    use crate::migrate::run_migrations;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));

    #[test]
    fn memory_session_counts_saves() {
        let mut session = MemorySession::new("abc", Some(IP));
        assert_eq!(session.get("k"), None);
        session.set("k", "v".to_string());
        session.save().expect("save");
        assert_eq!(session.get("k").as_deref(), Some("v"));
        assert_eq!(session.save_count(), 1);
        assert_eq!(session.client_ip(), Some(IP));
    }

    #[test]
    fn stored_session_survives_reload() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("tempuser.db");
        run_migrations(&db_path).expect("migrate");
        let store = SqliteSessionStore::new(&db_path);

        let mut session = store.load("s1", Some(IP)).expect("load");
        session.set("TempUser:name", "~1".to_string());
        assert_eq!(session.get("TempUser:name").as_deref(), Some("~1"));
        session.save().expect("save");

        let reloaded = store.load("s1", None).expect("reload");
        assert_eq!(reloaded.get("TempUser:name").as_deref(), Some("~1"));
        assert_eq!(reloaded.client_ip(), Some(IP));

        let other = store.load("s2", None).expect("load other");
        assert_eq!(other.get("TempUser:name"), None);
        assert_eq!(other.client_ip(), None);
    }

    #[test]
    fn unsaved_writes_are_dropped() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("tempuser.db");
        run_migrations(&db_path).expect("migrate");
        let store = SqliteSessionStore::new(&db_path);

        let mut session = store.load("s1", None).expect("load");
        session.set("key", "value".to_string());
        drop(session);

        let reloaded = store.load("s1", None).expect("reload");
        assert_eq!(reloaded.get("key"), None);
    }
}
