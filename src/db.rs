//! SQLite database setup and store wiring.
//!
//! `TriggerDb` owns the pool and exposes the three stores. Migrations are
//! idempotent (`CREATE TABLE IF NOT EXISTS`) so opening an existing
//! database is always safe.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use tracing::info;

use crate::store::events::EventStore;
use crate::store::executions::ExecutionStore;
use crate::store::triggers::TriggerStore;

pub struct TriggerDb {
    pool: SqlitePool,
    pub triggers: TriggerStore,
    pub events: EventStore,
    pub executions: ExecutionStore,
}

impl TriggerDb {
    /// Open (creating if necessary) the database file at `path`.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Build the stores over an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        migrate(&pool).await?;
        Ok(Self {
            triggers: TriggerStore::new(pool.clone()),
            events: EventStore::new(pool.clone()),
            executions: ExecutionStore::new(pool.clone()),
            pool,
        })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS triggers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            name TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            cron_schedule TEXT,
            script_path TEXT NOT NULL,
            event_names TEXT,
            event_sources TEXT,
            next_run_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            source TEXT,
            data TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trigger_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trigger_id INTEGER NOT NULL REFERENCES triggers(id),
            created_at TEXT NOT NULL,
            completed_at TEXT,
            logs TEXT NOT NULL DEFAULT '',
            exit_code INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Link table: the only record of per-trigger event consumption.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS triggered_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trigger_id INTEGER NOT NULL REFERENCES triggers(id),
            event_id INTEGER NOT NULL REFERENCES events(id),
            execution_id INTEGER NOT NULL REFERENCES trigger_executions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_triggers_due
         ON triggers(next_run_at) WHERE enabled = 1 AND next_run_at IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_name ON events(name)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_source ON events(source)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_triggered_events_trigger
         ON triggered_events(trigger_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_triggered_events_event
         ON triggered_events(event_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_executions_trigger_time
         ON trigger_executions(trigger_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    info!("Trigger database migration complete");
    Ok(())
}
