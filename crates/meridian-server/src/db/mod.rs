//! SQLite-backed repository. A small r2d2 pool hands out connections with
//! WAL and a busy timeout applied; SQLite itself serializes writers.
//! Migrations are embedded, versioned in `schema_migrations`, and additive
//! ones tolerate re-running against databases that already carry the column.

pub mod models;
pub mod probes;
pub mod results;
pub mod tasks;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// (filename, sql, additive). Additive migrations may hit databases that
// predate the schema_migrations table, so a duplicate-column failure marks
// them applied instead of failing startup.
const MIGRATIONS: &[(&str, &str, bool)] = &[
    ("001_init.sql", include_str!("../../migrations/001_init.sql"), false),
    (
        "002_add_probe_coordinates.sql",
        include_str!("../../migrations/002_add_probe_coordinates.sql"),
        true,
    ),
    (
        "003_add_result_status.sql",
        include_str!("../../migrations/003_add_result_status.sql"),
        true,
    ),
    (
        "004_unique_result_execution.sql",
        include_str!("../../migrations/004_unique_result_execution.sql"),
        false,
    ),
];

pub fn init_pool(path: &Path) -> Result<DbPool, DbError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )
    });
    let pool = r2d2::Pool::builder().max_size(4).build(manager)?;

    run_migrations(&*pool.get()?)?;
    Ok(pool)
}

pub fn run_migrations(conn: &Connection) -> Result<(), DbError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            filename TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    for (filename, sql, additive) in MIGRATIONS {
        let applied: i64 = conn.query_row(
            "SELECT COUNT(1) FROM schema_migrations WHERE filename = ?1",
            [filename],
            |row| row.get(0),
        )?;
        if applied > 0 {
            continue;
        }

        match conn.execute_batch(sql) {
            Ok(()) => {}
            Err(e) if *additive && is_duplicate_column_error(&e) => {
                warn!(migration = filename, "columns already present, marking applied");
            }
            Err(e) => return Err(e.into()),
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_migrations (filename, applied_at) VALUES (?1, ?2)",
            rusqlite::params![filename, chrono::Utc::now()],
        )?;
        info!(migration = filename, "applied migration");
    }

    Ok(())
}

fn is_duplicate_column_error(err: &rusqlite::Error) -> bool {
    err.to_string().contains("duplicate column name")
}

#[cfg(test)]
pub(crate) fn test_pool() -> (DbPool, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let pool = init_pool(&dir.path().join("test.db")).expect("pool");
    (pool, dir)
}
