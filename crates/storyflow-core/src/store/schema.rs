use rusqlite::Connection;

use crate::error::Result;

pub(crate) fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stories (
             id          INTEGER PRIMARY KEY AUTOINCREMENT,
             epic_id     TEXT NOT NULL,
             story_path  TEXT NOT NULL UNIQUE,
             status      TEXT NOT NULL,
             phase       TEXT,
             iteration   INTEGER NOT NULL DEFAULT 0,
             qa_result   TEXT,
             error       TEXT,
             created_at  TEXT NOT NULL,
             updated_at  TEXT NOT NULL,
             version     INTEGER NOT NULL DEFAULT 1
         );
         CREATE INDEX IF NOT EXISTS idx_stories_story_path ON stories(story_path);
         CREATE INDEX IF NOT EXISTS idx_stories_status ON stories(status);",
    )?;
    Ok(())
}

/// Bring databases created before optimistic versioning up to date.
/// Safe to run on every open.
pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    if !has_column(conn, "stories", "version")? {
        conn.execute(
            "ALTER TABLE stories ADD COLUMN version INTEGER NOT NULL DEFAULT 1",
            [],
        )?;
        tracing::info!("migrated stories table: added version column");
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_adds_version_to_legacy_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE stories (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 epic_id TEXT NOT NULL,
                 story_path TEXT NOT NULL UNIQUE,
                 status TEXT NOT NULL,
                 phase TEXT,
                 iteration INTEGER NOT NULL DEFAULT 0,
                 qa_result TEXT,
                 error TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             INSERT INTO stories (epic_id, story_path, status, created_at, updated_at)
             VALUES ('e1', 'docs/stories/1.1.md', 'review', 't', 't');",
        )
        .unwrap();
        assert!(!has_column(&conn, "stories", "version").unwrap());

        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT version FROM stories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn create_tables_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
        assert!(has_column(&conn, "stories", "version").unwrap());
    }
}
