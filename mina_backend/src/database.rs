use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::persistence::StateStore;

/// SQLite-backed state: one `agent_state` row per key.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;
        Ok(())
    }

    /// Get a state value
    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM agent_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a state value
    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO agent_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

impl StateStore for SqliteStateStore {
    fn load_blob(&self, key: &str) -> Result<Option<String>> {
        self.get_state(key)
    }

    fn save_blob(&self, key: &str, value: &str) -> Result<()> {
        self.set_state(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{load_memories, save_memories, MEMORIES_KEY};
    use crate::memory::{LongTermMemoryStore, MemoryRecord};

    #[test]
    fn state_values_overwrite_by_key() {
        let db = SqliteStateStore::open_in_memory().expect("db init");
        assert_eq!(db.get_state("emotion").unwrap(), None);

        db.set_state("emotion", "{\"mood\": \"calm\"}").unwrap();
        db.set_state("emotion", "{\"mood\": \"tense\"}").unwrap();
        assert_eq!(
            db.get_state("emotion").unwrap().as_deref(),
            Some("{\"mood\": \"tense\"}")
        );
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mina_state.db");

        {
            let db = SqliteStateStore::new(&path).expect("db init");
            let mut memories = LongTermMemoryStore::default();
            memories.insert(MemoryRecord::new("User plays cello", 7, vec!["music".to_string()]));
            save_memories(&db, &memories).unwrap();
        }

        let db = SqliteStateStore::new(&path).expect("db reopen");
        assert!(db.load_blob(MEMORIES_KEY).unwrap().is_some());
        let memories = load_memories(&db, 50);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories.records()[0].summary, "User plays cello");
    }
}
