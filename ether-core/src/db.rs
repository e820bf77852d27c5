use crate::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS traces (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        start INTEGER NOT NULL,
        expiry INTEGER NOT NULL,
        active BOOLEAN NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel TEXT NOT NULL,
        type TEXT NOT NULL,
        sender TEXT NOT NULL,
        contents TEXT,
        has_attachments BOOLEAN NOT NULL,
        sent INTEGER NOT NULL,
        trace_id INTEGER NOT NULL,
        starts_trace BOOLEAN NOT NULL,
        FOREIGN KEY(trace_id) REFERENCES traces(id)
    )",
    "CREATE INDEX IF NOT EXISTS messages_sent ON messages(sent)",
    "CREATE TABLE IF NOT EXISTS message_sources (
        msg_id INTEGER,
        src_msg_id INTEGER,
        FOREIGN KEY(msg_id) REFERENCES messages(id),
        FOREIGN KEY(src_msg_id) REFERENCES messages(id)
    )",
    "CREATE TABLE IF NOT EXISTS attachments (
        id INTEGER PRIMARY KEY,
        message_id INTEGER,
        type TEXT NOT NULL,
        contents BLOB,
        FOREIGN KEY(message_id) REFERENCES messages(id)
    )",
    "CREATE TABLE IF NOT EXISTS postings (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        type TEXT NOT NULL,
        contents BLOB NOT NULL
    )",
];

pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
}

/// Create all tables and indexes. Safe to run against an existing database.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await
}

pub async fn health_check(pool: &SqlitePool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT sqlite_version()").fetch_one(pool).await?;
    Ok(row.0)
}
