use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;

use super::schema;

/// Fixed-size pool of SQLite connections to one database file. Connections
/// are opened lazily; at most `size` idle connections are kept.
#[derive(Debug)]
pub(crate) struct Pool {
    path: PathBuf,
    size: usize,
    idle: Mutex<Vec<Connection>>,
}

impl Pool {
    /// Open the database, create the schema and run migrations.
    pub(crate) fn open(path: &Path, size: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open_connection(path)?;
        schema::create_tables(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: size.max(1),
            idle: Mutex::new(vec![conn]),
        })
    }

    /// Run `f` on a pooled connection, returning it to the pool afterwards.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let reused = self.idle.lock().unwrap_or_else(|p| p.into_inner()).pop();
        let mut conn = match reused {
            Some(conn) => conn,
            None => open_connection(&self.path)?,
        };
        let out = f(&mut conn);
        self.release(conn);
        out
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        if idle.len() < self.size {
            idle.push(conn);
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;\
         PRAGMA synchronous=NORMAL;\
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(conn)
}
