// This file is part of pvr-dvr, a personal video recorder backend.
// Copyright (C) 2024 The pvr-dvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Persistent key/value storage of JSON documents.
//!
//! Keys are hierarchical, eg `dvr/log/<entry id>`. Documents are opaque text to the store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use base::{err, Error, Mutex};
use rusqlite::{params, OptionalExtension as _};
use tracing::info;

pub const ENTRY_PREFIX: &str = "dvr/log/";
pub const CONFIG_PREFIX: &str = "dvr/config/";
pub const AUTOREC_PREFIX: &str = "dvr/autorec/";
pub const TIMEREC_PREFIX: &str = "dvr/timerec/";

pub fn key(prefix: &str, id: impl std::fmt::Display) -> String {
    format!("{prefix}{id}")
}

pub trait Store: Send {
    fn get(&self, key: &str) -> Result<Option<String>, Error>;
    fn put(&mut self, key: &str, doc: &str) -> Result<(), Error>;

    /// Deletes `key`; deleting a missing key is not an error.
    fn delete(&mut self, key: &str) -> Result<(), Error>;

    /// Returns all `(key, doc)` pairs whose key starts with `prefix`, ordered by key.
    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, Error>;
}

/// An in-memory store. Clones share contents, so a test can inspect what the database wrote.
#[derive(Clone, Default)]
pub struct MemStore(Arc<Mutex<BTreeMap<String, String>>>);

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.0.lock().get(key).cloned())
    }

    fn put(&mut self, key: &str, doc: &str) -> Result<(), Error> {
        self.0.lock().insert(key.to_owned(), doc.to_owned());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), Error> {
        self.0.lock().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, Error> {
        Ok(self
            .0
            .lock()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

fn sql_err(e: rusqlite::Error) -> Error {
    err!(Internal, msg("settings store"), source(e))
}

/// A store backed by one SQLite3 table.
pub struct SqliteStore {
    conn: rusqlite::Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open(path).map_err(|e| {
            err!(
                Unavailable,
                msg("unable to open {}", path.display()),
                source(e)
            )
        })?;
        info!(path = %path.display(), "opened settings store");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::new(rusqlite::Connection::open_in_memory().map_err(sql_err)?)
    }

    fn new(conn: rusqlite::Connection) -> Result<Self, Error> {
        conn.execute_batch(
            r#"
            pragma synchronous = 2;
            create table if not exists settings (
              key text primary key not null,
              doc text not null
            ) without rowid;
            "#,
        )
        .map_err(sql_err)?;
        Ok(SqliteStore { conn })
    }
}

impl Store for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.conn
            .query_row("select doc from settings where key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(sql_err)
    }

    fn put(&mut self, key: &str, doc: &str) -> Result<(), Error> {
        self.conn
            .execute(
                "insert or replace into settings (key, doc) values (?, ?)",
                params![key, doc],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), Error> {
        self.conn
            .execute("delete from settings where key = ?", params![key])
            .map_err(sql_err)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select key, doc from settings where key >= ? order by key")
            .map_err(sql_err)?;
        let mut rows = stmt.query(params![prefix]).map_err(sql_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql_err)? {
            let key: String = row.get(0).map_err(sql_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, row.get(1).map_err(sql_err)?));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(s: &mut dyn Store) {
        s.put("dvr/log/b", "{\"x\":2}").unwrap();
        s.put("dvr/log/a", "{\"x\":1}").unwrap();
        s.put("dvr/config/a", "{}").unwrap();
        s.put("dvr/logs", "{}").unwrap();
        assert_eq!(s.get("dvr/log/a").unwrap().as_deref(), Some("{\"x\":1}"));
        assert_eq!(s.get("dvr/log/c").unwrap(), None);
        let keys: Vec<String> = s
            .list(ENTRY_PREFIX)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, &["dvr/log/a", "dvr/log/b"]);
        s.put("dvr/log/a", "{}").unwrap();
        assert_eq!(s.get("dvr/log/a").unwrap().as_deref(), Some("{}"));
        s.delete("dvr/log/a").unwrap();
        s.delete("dvr/log/a").unwrap();
        assert_eq!(s.list(ENTRY_PREFIX).unwrap().len(), 1);
    }

    #[test]
    fn mem() {
        exercise(&mut MemStore::new());
    }

    #[test]
    fn sqlite_in_memory() {
        exercise(&mut SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db");
        {
            let mut s = SqliteStore::open(&path).unwrap();
            s.put(&key(CONFIG_PREFIX, "x"), "{}").unwrap();
        }
        let s = SqliteStore::open(&path).unwrap();
        assert_eq!(s.get("dvr/config/x").unwrap().as_deref(), Some("{}"));
    }
}
