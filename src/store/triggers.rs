//! Trigger storage: named recurring jobs with a cron cadence and optional
//! event filters.
//!
//! Invariant maintained here: `next_run_at` is non-null if and only if the
//! trigger is enabled and carries a valid cron schedule. It is recomputed
//! from "now" on create, enable, and cron change; disabling is the only
//! path that nulls it out.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::cron;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Trigger {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub enabled: bool,
    pub cron_schedule: Option<String>,
    pub script_path: String,
    pub event_names: Option<Vec<String>>,
    pub event_sources: Option<Vec<String>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Trigger {
    /// Event-based triggers additionally require at least one unconsumed
    /// matching event before they fire.
    pub fn is_event_based(&self) -> bool {
        self.event_names.as_deref().is_some_and(|v| !v.is_empty())
            || self.event_sources.as_deref().is_some_and(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct CreateTrigger {
    pub name: String,
    pub cron_schedule: Option<String>,
    pub script_path: String,
    pub enabled: bool,
    pub event_names: Option<Vec<String>>,
    pub event_sources: Option<Vec<String>>,
}

impl CreateTrigger {
    pub fn new(
        name: impl Into<String>,
        cron_schedule: impl Into<String>,
        script_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_schedule: Some(cron_schedule.into()),
            script_path: script_path.into(),
            enabled: true,
            event_names: None,
            event_sources: None,
        }
    }

    pub fn with_event_filters(
        mut self,
        event_names: Option<Vec<String>>,
        event_sources: Option<Vec<String>>,
    ) -> Self {
        self.event_names = event_names;
        self.event_sources = event_sources;
        self
    }
}

/// Field patch for `update`. The outer `Option` means "leave unchanged";
/// `cron_schedule: Some(None)` explicitly clears the schedule.
#[derive(Debug, Clone, Default)]
pub struct UpdateTrigger {
    pub enabled: Option<bool>,
    pub cron_schedule: Option<Option<String>>,
    pub script_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerFilters {
    pub enabled: Option<bool>,
    pub has_schedule: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub struct TriggerStore {
    pool: SqlitePool,
}

impl TriggerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a trigger. An invalid cron schedule fails the call; nothing
    /// is persisted.
    pub async fn create(&self, req: CreateTrigger) -> anyhow::Result<Trigger> {
        if let Some(expr) = &req.cron_schedule {
            cron::validate(expr)?;
        }
        let event_based = req.event_names.as_deref().is_some_and(|v| !v.is_empty())
            || req.event_sources.as_deref().is_some_and(|v| !v.is_empty());
        if event_based && req.cron_schedule.is_none() {
            anyhow::bail!(
                "Trigger '{}' filters on events but has no cron schedule to poll on",
                req.name
            );
        }

        let next_run_at = match (&req.cron_schedule, req.enabled) {
            (Some(expr), true) => Some(cron::next_after(expr, Utc::now())?),
            _ => None,
        };

        let event_names_json = req
            .event_names
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let event_sources_json = req
            .event_sources
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            "INSERT INTO triggers
               (created_at, name, enabled, cron_schedule, script_path,
                event_names, event_sources, next_run_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&req.name)
        .bind(req.enabled as i32)
        .bind(&req.cron_schedule)
        .bind(&req.script_path)
        .bind(&event_names_json)
        .bind(&event_sources_json)
        .bind(next_run_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(r) => r,
            Err(e) => {
                if e.as_database_error()
                    .is_some_and(|db| db.is_unique_violation())
                {
                    anyhow::bail!("Trigger '{}' already exists", req.name);
                }
                return Err(e.into());
            }
        };

        let id = result.last_insert_rowid();
        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("trigger {} vanished after insert", id))
    }

    /// Patch a trigger. Returns false if no trigger has this id. Recomputes
    /// `next_run_at` when enabled or the cron schedule changes; a
    /// script-path-only update leaves the schedule untouched.
    pub async fn update(&self, id: i64, patch: UpdateTrigger) -> anyhow::Result<bool> {
        let Some(current) = self.get(id).await? else {
            return Ok(false);
        };

        if let Some(Some(expr)) = &patch.cron_schedule {
            cron::validate(expr)?;
        }

        let enabled = patch.enabled.unwrap_or(current.enabled);
        let cron_schedule = match patch.cron_schedule.clone() {
            Some(value) => value,
            None => current.cron_schedule.clone(),
        };
        let script_path = patch.script_path.unwrap_or(current.script_path);

        let schedule_touched = patch.enabled.is_some() || patch.cron_schedule.is_some();
        let next_run_at = if schedule_touched {
            match (&cron_schedule, enabled) {
                (Some(expr), true) => Some(cron::next_after(expr, Utc::now())?),
                _ => None,
            }
        } else {
            current.next_run_at
        };

        let result = sqlx::query(
            "UPDATE triggers
             SET enabled = ?, cron_schedule = ?, script_path = ?, next_run_at = ?
             WHERE id = ?",
        )
        .bind(enabled as i32)
        .bind(&cron_schedule)
        .bind(&script_path)
        .bind(next_run_at.map(|t| t.to_rfc3339()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<Trigger>> {
        let row = sqlx::query("SELECT * FROM triggers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_trigger(&r)).transpose()
    }

    pub async fn get_by_name(&self, name: &str) -> anyhow::Result<Option<Trigger>> {
        let row = sqlx::query("SELECT * FROM triggers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_trigger(&r)).transpose()
    }

    pub async fn get_all(&self, filters: TriggerFilters) -> anyhow::Result<Vec<Trigger>> {
        let mut clauses: Vec<&str> = Vec::new();
        if filters.enabled.is_some() {
            clauses.push("enabled = ?");
        }
        match filters.has_schedule {
            Some(true) => clauses.push("cron_schedule IS NOT NULL"),
            Some(false) => clauses.push("cron_schedule IS NULL"),
            None => {}
        }

        let mut sql = String::from("SELECT * FROM triggers");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if filters.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }
        if filters.offset.is_some() {
            sql.push_str(" OFFSET ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(enabled) = filters.enabled {
            query = query.bind(enabled as i32);
        }
        if let Some(limit) = filters.limit {
            query = query.bind(limit);
        }
        if let Some(offset) = filters.offset {
            query = query.bind(offset);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_trigger).collect()
    }

    pub async fn delete(&self, id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM triggers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_name(&self, name: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM triggers WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_all(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM triggers")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Triggers where `enabled AND next_run_at <= now`, ordered by
    /// next_run_at so the set is stable within one poll.
    pub async fn get_due_triggers(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Trigger>> {
        let rows = sqlx::query(
            "SELECT * FROM triggers
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at ASC, id ASC",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_trigger).collect()
    }

    /// Persist the next cron occurrence strictly after `from_time`. Called
    /// by the scheduler before the script starts, so a slow execution is
    /// not rescheduled for "now" when it finally completes. Returns the new
    /// time, or None for disabled/unscheduled/unknown triggers.
    pub async fn update_next_run_time(
        &self,
        id: i64,
        from_time: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let Some(trigger) = self.get(id).await? else {
            return Ok(None);
        };
        let Some(expr) = trigger.cron_schedule.as_deref() else {
            return Ok(None);
        };
        if !trigger.enabled {
            return Ok(None);
        }

        let next = cron::next_after(expr, from_time)?;
        sqlx::query("UPDATE triggers SET next_run_at = ? WHERE id = ?")
            .bind(next.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(Some(next))
    }
}

fn row_to_trigger(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Trigger> {
    let created_at_str: String = row.get("created_at");
    let next_run_at_str: Option<String> = row.get("next_run_at");
    let event_names_json: Option<String> = row.get("event_names");
    let event_sources_json: Option<String> = row.get("event_sources");

    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let next_run_at = next_run_at_str.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    });

    let event_names = event_names_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let event_sources = event_sources_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(Trigger {
        id: row.get("id"),
        created_at,
        name: row.get("name"),
        enabled: row.get::<i32, _>("enabled") != 0,
        cron_schedule: row.get("cron_schedule"),
        script_path: row.get("script_path"),
        event_names,
        event_sources,
        next_run_at,
    })
}
