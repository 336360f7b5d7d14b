//! Execution history for trigger script runs.
//!
//! An execution row is created when a run starts (`completed_at` NULL) and
//! finalized once the script exits. Exit code -1 means the script timed
//! out, -2 means it could not be run or was killed by a signal.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct TriggerExecution {
    pub id: i64,
    pub trigger_id: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub logs: String,
    pub exit_code: Option<i64>,
}

impl TriggerExecution {
    pub fn is_running(&self) -> bool {
        self.completed_at.is_none()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilters {
    pub trigger_id: Option<i64>,
    /// Some(true) = finished runs only, Some(false) = still running.
    pub completed: Option<bool>,
    pub exit_code: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub struct ExecutionStore {
    pool: SqlitePool,
}

impl ExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the start of a run. The row stays open until
    /// [`set_completed`](Self::set_completed) is called.
    pub async fn create(&self, trigger_id: i64) -> anyhow::Result<TriggerExecution> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO trigger_executions (trigger_id, created_at, logs) VALUES (?, ?, '')",
        )
        .bind(trigger_id)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(TriggerExecution {
            id: result.last_insert_rowid(),
            trigger_id,
            created_at,
            completed_at: None,
            logs: String::new(),
            exit_code: None,
        })
    }

    /// Finalize a run with its exit code and captured output.
    pub async fn set_completed(
        &self,
        id: i64,
        exit_code: i64,
        logs: &str,
    ) -> anyhow::Result<Option<TriggerExecution>> {
        sqlx::query(
            "UPDATE trigger_executions SET completed_at = ?, logs = ?, exit_code = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(logs)
        .bind(exit_code)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<TriggerExecution>> {
        let row = sqlx::query("SELECT * FROM trigger_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_execution(&r)).transpose()
    }

    /// Most recent first.
    pub async fn get_all(
        &self,
        filters: ExecutionFilters,
    ) -> anyhow::Result<Vec<TriggerExecution>> {
        let mut clauses: Vec<&str> = Vec::new();
        if filters.trigger_id.is_some() {
            clauses.push("trigger_id = ?");
        }
        if filters.exit_code.is_some() {
            clauses.push("exit_code = ?");
        }
        match filters.completed {
            Some(true) => clauses.push("completed_at IS NOT NULL"),
            Some(false) => clauses.push("completed_at IS NULL"),
            None => {}
        }

        let mut sql = String::from("SELECT * FROM trigger_executions");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if filters.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }
        if filters.offset.is_some() {
            sql.push_str(" OFFSET ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(trigger_id) = filters.trigger_id {
            query = query.bind(trigger_id);
        }
        if let Some(exit_code) = filters.exit_code {
            query = query.bind(exit_code);
        }
        if let Some(limit) = filters.limit {
            query = query.bind(limit);
        }
        if let Some(offset) = filters.offset {
            query = query.bind(offset);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_execution).collect()
    }
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<TriggerExecution> {
    let created_at_str: String = row.get("created_at");
    let completed_at_str: Option<String> = row.get("completed_at");
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let completed_at = completed_at_str
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Ok(TriggerExecution {
        id: row.get("id"),
        trigger_id: row.get("trigger_id"),
        created_at,
        completed_at,
        logs: row.get("logs"),
        exit_code: row.get("exit_code"),
    })
}
