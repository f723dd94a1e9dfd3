//! SQLite persistence layer.
//!
//! Stores the log (one row per appended entry), channel topics, published
//! nicknames and the local writer key. Uses WAL mode for concurrent reads
//! during writes.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A persisted log row. `value_json` is decoded by the store.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub seq: i64,
    pub key: String,
    pub channel: String,
    pub value_json: String,
}

/// A persisted nickname record.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub key: String,
    pub name: String,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                name  TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channels (
                name  TEXT PRIMARY KEY,
                topic TEXT
            );

            CREATE TABLE IF NOT EXISTS users (
                key  TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                key        TEXT NOT NULL,
                channel    TEXT NOT NULL,
                value_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_channel_seq
                ON messages(channel, seq DESC);
            ",
        )?;
        Ok(())
    }

    // ── Meta ───────────────────────────────────────────────────────────

    pub fn get_meta(&self, name: &str) -> SqlResult<Option<String>> {
        self.conn
            .query_row("SELECT value FROM meta WHERE name = ?1", params![name], |row| row.get(0))
            .optional()
    }

    pub fn set_meta(&self, name: &str, value: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO meta (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value=excluded.value",
            params![name, value],
        )?;
        Ok(())
    }

    // ── Channels ───────────────────────────────────────────────────────

    /// Record a channel. Returns true if it was not known before.
    pub fn ensure_channel(&self, name: &str) -> SqlResult<bool> {
        let changed = self
            .conn
            .execute("INSERT OR IGNORE INTO channels (name) VALUES (?1)", params![name])?;
        Ok(changed > 0)
    }

    pub fn set_topic(&self, channel: &str, topic: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO channels (name, topic) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET topic=excluded.topic",
            params![channel, topic],
        )?;
        Ok(())
    }

    /// Topic of a channel; `None` if the channel is unknown or has no topic.
    pub fn get_topic(&self, channel: &str) -> SqlResult<Option<String>> {
        let topic: Option<Option<String>> = self
            .conn
            .query_row("SELECT topic FROM channels WHERE name = ?1", params![channel], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(topic.flatten())
    }

    pub fn channel_names(&self) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM channels ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Set a writer's nickname. Overwrites any previous one.
    pub fn save_user(&self, key: &str, name: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO users (key, name) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET name=excluded.name",
            params![key, name],
        )?;
        Ok(())
    }

    pub fn get_user(&self, key: &str) -> SqlResult<Option<UserRow>> {
        self.conn
            .query_row("SELECT key, name FROM users WHERE key = ?1", params![key], map_user_row)
            .optional()
    }

    pub fn load_users(&self) -> SqlResult<Vec<UserRow>> {
        let mut stmt = self.conn.prepare("SELECT key, name FROM users")?;
        let rows = stmt.query_map([], map_user_row)?;
        rows.collect()
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Append an entry. Returns its sequence number.
    pub fn insert_message(&self, key: &str, channel: &str, value_json: &str) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO messages (key, channel, value_json) VALUES (?1, ?2, ?3)",
            params![key, channel, value_json],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Fetch one page of a channel's log.
    ///
    /// With `reverse`, rows come newest-first and `cursor` (if set) is an
    /// exclusive upper bound on `seq`. Otherwise rows come oldest-first and
    /// `cursor` is an exclusive lower bound.
    pub fn get_messages(
        &self,
        channel: &str,
        limit: usize,
        cursor: Option<i64>,
        reverse: bool,
    ) -> SqlResult<Vec<MessageRow>> {
        let sql = match (reverse, cursor.is_some()) {
            (true, true) => {
                "SELECT seq, key, channel, value_json FROM messages
                 WHERE channel = ?1 AND seq < ?2 ORDER BY seq DESC LIMIT ?3"
            }
            (true, false) => {
                "SELECT seq, key, channel, value_json FROM messages
                 WHERE channel = ?1 AND ?2 IS NULL ORDER BY seq DESC LIMIT ?3"
            }
            (false, true) => {
                "SELECT seq, key, channel, value_json FROM messages
                 WHERE channel = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
            }
            (false, false) => {
                "SELECT seq, key, channel, value_json FROM messages
                 WHERE channel = ?1 AND ?2 IS NULL ORDER BY seq ASC LIMIT ?3"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![channel, cursor, limit as i64], map_message_row)?;
        rows.collect()
    }
}

fn map_user_row(row: &rusqlite::Row) -> SqlResult<UserRow> {
    Ok(UserRow {
        key: row.get(0)?,
        name: row.get(1)?,
    })
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<MessageRow> {
    Ok(MessageRow {
        seq: row.get(0)?,
        key: row.get(1)?,
        channel: row.get(2)?,
        value_json: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_and_topics() {
        let db = Db::open_memory().unwrap();

        assert!(db.ensure_channel("general").unwrap());
        assert!(!db.ensure_channel("general").unwrap());
        assert_eq!(db.get_topic("general").unwrap(), None);

        db.set_topic("general", "welcome").unwrap();
        db.set_topic("dev", "rust").unwrap();
        assert_eq!(db.get_topic("general").unwrap().as_deref(), Some("welcome"));
        assert_eq!(db.get_topic("missing").unwrap(), None);

        assert_eq!(db.channel_names().unwrap(), vec!["dev", "general"]);
    }

    #[test]
    fn users_overwrite() {
        let db = Db::open_memory().unwrap();

        db.save_user("aa", "alice").unwrap();
        db.save_user("bb", "bob").unwrap();
        db.save_user("aa", "alice2").unwrap();

        assert_eq!(db.get_user("aa").unwrap().unwrap().name, "alice2");
        assert!(db.get_user("cc").unwrap().is_none());
        assert_eq!(db.load_users().unwrap().len(), 2);
    }

    #[test]
    fn paging_both_directions() {
        let db = Db::open_memory().unwrap();
        let a = db.insert_message("k", "general", "{}").unwrap();
        let b = db.insert_message("k", "general", "{}").unwrap();
        db.insert_message("k", "other", "{}").unwrap();
        let c = db.insert_message("k", "general", "{}").unwrap();

        let newest: Vec<i64> = db
            .get_messages("general", 2, None, true)
            .unwrap()
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(newest, vec![c, b]);

        let older: Vec<i64> = db
            .get_messages("general", 2, Some(b), true)
            .unwrap()
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(older, vec![a]);

        let forward: Vec<i64> = db
            .get_messages("general", 10, Some(a), false)
            .unwrap()
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(forward, vec![b, c]);
    }

    #[test]
    fn meta_roundtrip() {
        let db = Db::open_memory().unwrap();
        assert!(db.get_meta("local_key").unwrap().is_none());
        db.set_meta("local_key", "abc").unwrap();
        db.set_meta("local_key", "def").unwrap();
        assert_eq!(db.get_meta("local_key").unwrap().as_deref(), Some("def"));
    }
}
