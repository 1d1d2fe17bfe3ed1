//! Recents and favorites, persisted in SQLite.
//!
//! Both logical tables share one implementation (`EntryTable`) parameterised
//! by a `TableSpec`.  Favorites require a unique name and a unique URL;
//! recents bump the play count of an existing URL instead of adding a row.
//!
//! Uniqueness is checked with a query before the write, not inside a
//! transaction.  There is a single writer (the daemon), so that is enough;
//! a multi-writer setup would have to move the check and the write into one
//! transaction.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use stream_proto::protocol::{Entry, EntryKey, ErrorKind, TableKind};
use tracing::{debug, info, warn};

/// Bumping this drops every table on next open.  There is no migration path.
pub const SCHEMA_VERSION: i64 = 1;

/// Fixed-width UTC text, so ORDER BY on the column is chronological.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

pub type SharedDatabase = Arc<parking_lot::Mutex<Database>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("url is empty")]
    EmptyUrl,
    #[error("a favorite with that name already exists")]
    DuplicateName,
    #[error("that url is already a favorite")]
    DuplicateUrl,
    #[error("favorites need a name")]
    MissingName,
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not create database directory: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// The client-facing kind for rejections; `None` for internal failures.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StoreError::EmptyUrl => Some(ErrorKind::EmptyUrl),
            StoreError::DuplicateName => Some(ErrorKind::DuplicateName),
            StoreError::DuplicateUrl => Some(ErrorKind::DuplicateUrl),
            StoreError::MissingName => Some(ErrorKind::MissingName),
            StoreError::Sqlite(_) | StoreError::Io(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub requires_unique_name: bool,
}

pub const RECENTS: TableSpec = TableSpec {
    name: "recents",
    requires_unique_name: false,
};

pub const FAVORITES: TableSpec = TableSpec {
    name: "favorites",
    requires_unique_name: true,
};

/// Result of a successful insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was created.
    Inserted(i64),
    /// The URL was already in recents; its count and timestamp were bumped.
    Bumped(i64),
}

impl InsertOutcome {
    pub fn id(self) -> i64 {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Bumped(id) => id,
        }
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("store: opening {:?}", path);
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(parking_lot::Mutex::new(self))
    }

    pub fn recents(&self) -> EntryTable<'_> {
        EntryTable {
            conn: &self.conn,
            layout: RECENTS,
        }
    }

    pub fn favorites(&self) -> EntryTable<'_> {
        EntryTable {
            conn: &self.conn,
            layout: FAVORITES,
        }
    }

    pub fn table(&self, kind: TableKind) -> EntryTable<'_> {
        match kind {
            TableKind::Recents => self.recents(),
            TableKind::Favorites => self.favorites(),
        }
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version != 0 && version != SCHEMA_VERSION {
        warn!(
            "store: upgrading schema from version {} to {}, which destroys all old data",
            version, SCHEMA_VERSION
        );
        conn.execute_batch(
            "DROP TABLE IF EXISTS recents;
             DROP TABLE IF EXISTS favorites;",
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS recents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            count INTEGER NOT NULL,
            created TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS favorites (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            name TEXT NOT NULL,
            count INTEGER NOT NULL,
            created TEXT
        )",
        [],
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(raw: Option<String>) -> DateTime<Utc> {
    raw.and_then(|s| NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT).ok())
        .map(|naive| naive.and_utc())
        .unwrap_or_default()
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        play_count: row.get(3)?,
        last_modified: parse_timestamp(row.get(4)?),
    })
}

/// One logical table.  Borrowed from a `Database`.
pub struct EntryTable<'a> {
    conn: &'a Connection,
    layout: TableSpec,
}

impl<'a> EntryTable<'a> {
    fn columns(&self) -> &'static str {
        if self.layout.requires_unique_name {
            "id, url, name, count, created"
        } else {
            "id, url, NULL, count, created"
        }
    }

    fn order_by(&self) -> &'static str {
        if self.layout.requires_unique_name {
            "count DESC, id DESC"
        } else {
            "created DESC, id DESC"
        }
    }

    /// Column + bound value for a key.  `None` when the table cannot match
    /// it (recents have no names).  Text keys are trimmed like stored values.
    fn lookup(&self, key: &EntryKey) -> Option<(&'static str, Value)> {
        match key {
            EntryKey::Id(id) => Some(("id", Value::Integer(*id))),
            EntryKey::Url(url) => Some(("url", Value::Text(url.trim().to_string()))),
            EntryKey::Name(name) if self.layout.requires_unique_name => {
                Some(("name", Value::Text(name.trim().to_string())))
            }
            EntryKey::Name(_) => None,
        }
    }

    fn required_name<'n>(&self, name: Option<&'n str>) -> Result<Option<&'n str>, StoreError> {
        if !self.layout.requires_unique_name {
            return Ok(None);
        }
        match name.map(str::trim) {
            Some(name) if !name.is_empty() => Ok(Some(name)),
            _ => Err(StoreError::MissingName),
        }
    }

    /// Id of another row whose `column` equals `value`.
    fn conflicting_id(
        &self,
        column: &'static str,
        value: &str,
        except: Option<i64>,
    ) -> Result<Option<i64>, StoreError> {
        let sql = format!(
            "SELECT id FROM {} WHERE {} = ?1 AND id != ?2 LIMIT 1",
            self.layout.name, column
        );
        let id = self
            .conn
            .query_row(&sql, params![value, except.unwrap_or(-1)], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn check_unique(
        &self,
        url: &str,
        name: Option<&str>,
        except: Option<i64>,
    ) -> Result<(), StoreError> {
        if let Some(name) = name {
            if self.conflicting_id("name", name, except)?.is_some() {
                return Err(StoreError::DuplicateName);
            }
        }
        if self.conflicting_id("url", url, except)?.is_some() {
            return Err(StoreError::DuplicateUrl);
        }
        Ok(())
    }

    pub fn insert(&self, url: &str, name: Option<&str>) -> Result<InsertOutcome, StoreError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StoreError::EmptyUrl);
        }
        let name = self.required_name(name)?;
        let now = format_timestamp(Utc::now());

        if !self.layout.requires_unique_name {
            if let Some(id) = self.conflicting_id("url", url, None)? {
                let sql = format!(
                    "UPDATE {} SET count = count + 1, created = ?1 WHERE id = ?2",
                    self.layout.name
                );
                self.conn.execute(&sql, params![now, id])?;
                debug!("store: {} bumped id={} url={}", self.layout.name, id, url);
                return Ok(InsertOutcome::Bumped(id));
            }
        } else {
            self.check_unique(url, name, None)?;
        }

        match name {
            Some(name) => {
                let sql = format!(
                    "INSERT INTO {} (url, name, count, created) VALUES (?1, ?2, 1, ?3)",
                    self.layout.name
                );
                self.conn.execute(&sql, params![url, name, now])?;
            }
            None => {
                let sql = format!(
                    "INSERT INTO {} (url, count, created) VALUES (?1, 1, ?2)",
                    self.layout.name
                );
                self.conn.execute(&sql, params![url, now])?;
            }
        }
        let id = self.conn.last_insert_rowid();
        debug!("store: {} inserted id={} url={}", self.layout.name, id, url);
        Ok(InsertOutcome::Inserted(id))
    }

    /// Rewrite a row.  The row's own name and URL never count as conflicts.
    /// `count: None` keeps the stored count.  Unknown ids are a no-op.
    pub fn update(
        &self,
        id: i64,
        url: &str,
        name: Option<&str>,
        count: Option<i64>,
    ) -> Result<(), StoreError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StoreError::EmptyUrl);
        }
        let name = self.required_name(name)?;
        let Some(current) = self.get_one(&EntryKey::Id(id))? else {
            return Ok(());
        };
        self.check_unique(url, name, Some(id))?;

        let count = count.unwrap_or(current.play_count).max(1);
        let now = format_timestamp(Utc::now());
        match name {
            Some(name) => {
                let sql = format!(
                    "UPDATE {} SET url = ?1, name = ?2, count = ?3, created = ?4 WHERE id = ?5",
                    self.layout.name
                );
                self.conn.execute(&sql, params![url, name, count, now, id])?;
            }
            None => {
                let sql = format!(
                    "UPDATE {} SET url = ?1, count = ?2, created = ?3 WHERE id = ?4",
                    self.layout.name
                );
                self.conn.execute(&sql, params![url, count, now, id])?;
            }
        }
        Ok(())
    }

    /// Remove every row matching `key`.  Missing keys are not an error.
    pub fn delete(&self, key: &EntryKey) -> Result<(), StoreError> {
        let Some((column, value)) = self.lookup(key) else {
            return Ok(());
        };
        let sql = format!("DELETE FROM {} WHERE {} = ?1", self.layout.name, column);
        let removed = self.conn.execute(&sql, params![value])?;
        debug!("store: {} delete {:?} removed {}", self.layout.name, key, removed);
        Ok(())
    }

    pub fn get_all(&self) -> Result<Vec<Entry>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            self.columns(),
            self.layout.name,
            self.order_by()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_entry)?;

        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    pub fn get_one(&self, key: &EntryKey) -> Result<Option<Entry>, StoreError> {
        let Some((column, value)) = self.lookup(key) else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY id LIMIT 1",
            self.columns(),
            self.layout.name,
            column
        );
        let entry = self
            .conn
            .query_row(&sql, params![value], row_to_entry)
            .optional()?;
        Ok(entry)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.layout.name);
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_favorite_duplicate_name_leaves_store_unchanged() {
        let db = db();
        let favs = db.favorites();
        favs.insert("http://a/stream", Some("jazz")).unwrap();
        let before = favs.get_all().unwrap();

        let err = favs.insert("http://b/stream", Some("jazz")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName));
        assert_eq!(err.kind(), Some(ErrorKind::DuplicateName));
        assert_eq!(favs.get_all().unwrap(), before);
    }

    #[test]
    fn test_favorite_duplicate_url() {
        let db = db();
        let favs = db.favorites();
        favs.insert("http://a/stream", Some("jazz")).unwrap();
        let err = favs.insert("http://a/stream", Some("blues")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUrl));
        assert_eq!(favs.len().unwrap(), 1);
    }

    #[test]
    fn test_name_is_checked_before_url() {
        let db = db();
        let favs = db.favorites();
        favs.insert("http://a/stream", Some("jazz")).unwrap();
        let err = favs.insert("http://a/stream", Some("jazz")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName));
    }

    #[test]
    fn test_favorite_requires_name() {
        let db = db();
        let favs = db.favorites();
        assert!(matches!(
            favs.insert("http://a/stream", None),
            Err(StoreError::MissingName)
        ));
        assert!(matches!(
            favs.insert("http://a/stream", Some("   ")),
            Err(StoreError::MissingName)
        ));
        assert!(favs.is_empty().unwrap());
    }

    #[test]
    fn test_empty_url_rejected_on_both_tables() {
        let db = db();
        assert!(matches!(db.recents().insert("  ", None), Err(StoreError::EmptyUrl)));
        assert!(matches!(
            db.favorites().insert("", Some("x")),
            Err(StoreError::EmptyUrl)
        ));
    }

    #[test]
    fn test_recent_repeat_insert_bumps_count() {
        let db = db();
        let recents = db.recents();
        let first = recents.insert("http://a/stream", None).unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let mut last_insert = Utc::now();
        for _ in 0..3 {
            last_insert = Utc::now();
            let outcome = recents.insert("http://a/stream", None).unwrap();
            assert_eq!(outcome, InsertOutcome::Bumped(first.id()));
        }
        let after = Utc::now();

        let all = recents.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].play_count, 4);
        assert!(all[0].name.is_none());
        assert!(all[0].last_modified >= last_insert);
        assert!(all[0].last_modified <= after);
    }

    #[test]
    fn test_recents_newest_first() {
        let db = db();
        let recents = db.recents();
        recents.insert("http://a/1", None).unwrap();
        recents.insert("http://a/2", None).unwrap();
        recents.insert("http://a/3", None).unwrap();
        // bump the oldest so it becomes the newest
        recents.insert("http://a/1", None).unwrap();

        let all = recents.get_all().unwrap();
        let urls: Vec<_> = all.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, ["http://a/1", "http://a/3", "http://a/2"]);
        assert!(all
            .windows(2)
            .all(|w| w[0].last_modified >= w[1].last_modified));
    }

    #[test]
    fn test_favorites_most_played_first() {
        let db = db();
        let favs = db.favorites();
        let a = favs.insert("http://a", Some("a")).unwrap().id();
        let b = favs.insert("http://b", Some("b")).unwrap().id();
        let c = favs.insert("http://c", Some("c")).unwrap().id();
        favs.update(a, "http://a", Some("a"), Some(3)).unwrap();
        favs.update(c, "http://c", Some("c"), Some(7)).unwrap();

        let all = favs.get_all().unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, [c, a, b]);
        assert!(all.windows(2).all(|w| w[0].play_count >= w[1].play_count));
    }

    #[test]
    fn test_update_may_keep_own_name_and_url() {
        let db = db();
        let favs = db.favorites();
        let id = favs.insert("http://a", Some("a")).unwrap().id();
        favs.insert("http://b", Some("b")).unwrap();

        favs.update(id, "http://a", Some("a"), None).unwrap();
        favs.update(id, "http://a2", Some("a"), None).unwrap();

        assert!(matches!(
            favs.update(id, "http://a2", Some("b"), None),
            Err(StoreError::DuplicateName)
        ));
        assert!(matches!(
            favs.update(id, "http://b", Some("a"), None),
            Err(StoreError::DuplicateUrl)
        ));

        let entry = favs.get_one(&EntryKey::Id(id)).unwrap().unwrap();
        assert_eq!(entry.url, "http://a2");
        assert_eq!(entry.name.as_deref(), Some("a"));
        assert_eq!(entry.play_count, 1);
    }

    #[test]
    fn test_delete_by_each_key() {
        let db = db();
        let favs = db.favorites();
        let a = favs.insert("http://a", Some("a")).unwrap().id();
        favs.insert("http://b", Some("b")).unwrap();
        favs.insert("http://c", Some("c")).unwrap();

        favs.delete(&EntryKey::Id(a)).unwrap();
        assert!(favs.get_one(&EntryKey::Id(a)).unwrap().is_none());

        favs.delete(&EntryKey::Url("http://b".into())).unwrap();
        favs.delete(&EntryKey::Name("c".into())).unwrap();
        assert!(favs.is_empty().unwrap());

        // missing keys are fine
        favs.delete(&EntryKey::Id(9999)).unwrap();
        favs.delete(&EntryKey::Name("nope".into())).unwrap();
    }

    #[test]
    fn test_text_keys_are_trimmed() {
        let db = db();
        let favs = db.favorites();
        favs.insert("  http://a/stream ", Some(" A ")).unwrap();

        let entry = favs
            .get_one(&EntryKey::Url(" http://a/stream\t".into()))
            .unwrap()
            .unwrap();
        assert_eq!(entry.url, "http://a/stream");
        assert!(favs.get_one(&EntryKey::Name("A  ".into())).unwrap().is_some());

        favs.delete(&EntryKey::Name(" A".into())).unwrap();
        assert!(favs.is_empty().unwrap());

        let recents = db.recents();
        recents.insert("http://b", None).unwrap();
        recents.delete(&EntryKey::Url(" http://b ".into())).unwrap();
        assert!(recents.is_empty().unwrap());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let db = db();
        let recents = db.recents();
        let first = recents.insert("http://a", None).unwrap().id();
        recents.delete(&EntryKey::Id(first)).unwrap();
        let second = recents.insert("http://a", None).unwrap().id();
        assert!(second > first);
    }

    #[test]
    fn test_recents_ignore_name_keys() {
        let db = db();
        let recents = db.recents();
        recents.insert("http://a", None).unwrap();
        assert!(recents.get_one(&EntryKey::Name("http://a".into())).unwrap().is_none());
        recents.delete(&EntryKey::Name("http://a".into())).unwrap();
        assert_eq!(recents.len().unwrap(), 1);
    }

    #[test]
    fn test_values_are_bound_not_spliced() {
        let db = db();
        let favs = db.favorites();
        let nasty = "x'); DROP TABLE favorites; --";
        favs.insert("http://a/'quoted'", Some(nasty)).unwrap();
        let entry = favs
            .get_one(&EntryKey::Name(nasty.into()))
            .unwrap()
            .unwrap();
        assert_eq!(entry.url, "http://a/'quoted'");
        assert_eq!(favs.len().unwrap(), 1);
    }
}
