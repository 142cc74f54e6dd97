//! SQLite-backed directory of people, groups and services.

use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use std::path::Path;

use super::{Directory, DirectoryEntry, DirectoryError, EntryKind};

const DATABASE_FILE: &str = "directory.db";

pub struct SqliteDirectory {
    conn: Mutex<Connection>,
}

impl SqliteDirectory {
    /// Opens or creates `directory.db` inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, DirectoryError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DATABASE_FILE);
        tracing::info!("Opening directory at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DirectoryError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'person',
                avatar TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_name ON entries(name COLLATE NOCASE)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Inserts the entry, or refreshes name/kind/avatar for a known id.
    pub fn upsert(&self, entry: &DirectoryEntry) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO entries (id, name, kind, avatar)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                avatar = COALESCE(excluded.avatar, avatar),
                updated_at = datetime('now')
            "#,
            params![entry.id, entry.name, entry.kind.as_str(), entry.avatar],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<DirectoryEntry, DirectoryError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, kind, avatar FROM entries WHERE id = ?1",
            params![id],
            entry_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DirectoryError::NotFound(id.to_string()),
            other => DirectoryError::Sqlite(other),
        })
    }

    /// Returns `true` when an entry was deleted.
    pub fn remove(&self, id: &str) -> Result<bool, DirectoryError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM entries WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn all(&self) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, kind, avatar FROM entries ORDER BY name COLLATE NOCASE")?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(entries)
    }
}

fn entry_from_row(row: &Row<'_>) -> SqliteResult<DirectoryEntry> {
    let kind: String = row.get(2)?;
    Ok(DirectoryEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: EntryKind::parse(&kind),
        avatar: row.get(3)?,
    })
}

/// Escapes LIKE wildcards so user input matches literally.
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

impl Directory for SqliteDirectory {
    fn search(&self, query: &str) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, kind, avatar
            FROM entries
            WHERE name LIKE ?1 ESCAPE '\' OR id = ?2
            ORDER BY
                CASE WHEN lower(name) = lower(?2) OR id = ?2 THEN 0 ELSE 1 END,
                name COLLATE NOCASE
            "#,
        )?;
        let entries = stmt
            .query_map(params![like_pattern(query), query], entry_from_row)?
            .collect::<SqliteResult<Vec<_>>>()?;

        tracing::debug!(%query, matches = entries.len(), "Directory search");
        Ok(entries)
    }
}

// ============================================================================
// TESTS
// ============================================================================
