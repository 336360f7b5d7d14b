//! Event storage and per-trigger consumption tracking.
//!
//! Events are immutable facts; the scheduler never mutates or deletes
//! them. "Consumed" lives solely in the `triggered_events` link table and
//! is scoped per trigger: one event can be consumed by trigger A while
//! still unconsumed for trigger B.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::triggers::Trigger;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Event {
    pub id: i64,
    pub name: String,
    pub source: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub name: String,
    pub source: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilters {
    pub names: Option<Vec<String>>,
    pub sources: Option<Vec<String>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        source: Option<&str>,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<Event> {
        let data_json = serde_json::to_string(&data)?;
        let result = sqlx::query(
            "INSERT INTO events (name, source, data, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(source)
        .bind(&data_json)
        .bind(timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Event {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            source: source.map(str::to_string),
            data,
            timestamp,
        })
    }

    /// Batch insert in a single transaction. This is the HTTP ingestion
    /// write path: either every event lands or none do.
    pub async fn create_many(&self, events: Vec<NewEvent>) -> anyhow::Result<Vec<Event>> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(events.len());
        for event in events {
            let data_json = serde_json::to_string(&event.data)?;
            let result = sqlx::query(
                "INSERT INTO events (name, source, data, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(&event.name)
            .bind(&event.source)
            .bind(&data_json)
            .bind(event.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            created.push(Event {
                id: result.last_insert_rowid(),
                name: event.name,
                source: event.source,
                data: event.data,
                timestamp: event.timestamp,
            });
        }
        tx.commit().await?;
        Ok(created)
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_event(&r)).transpose()
    }

    pub async fn get_all(&self, filters: EventFilters) -> anyhow::Result<Vec<Event>> {
        let mut sql = String::from("SELECT * FROM events");
        let mut clauses: Vec<String> = Vec::new();

        if let Some(names) = &filters.names {
            clauses.push(format!("name IN ({})", placeholders(names.len())));
        }
        if let Some(sources) = &filters.sources {
            clauses.push(format!("source IN ({})", placeholders(sources.len())));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp ASC");
        if filters.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }
        if filters.offset.is_some() {
            sql.push_str(" OFFSET ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(names) = &filters.names {
            for name in names {
                query = query.bind(name);
            }
        }
        if let Some(sources) = &filters.sources {
            for source in sources {
                query = query.bind(source);
            }
        }
        if let Some(limit) = filters.limit {
            query = query.bind(limit);
        }
        if let Some(offset) = filters.offset {
            query = query.bind(offset);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Events matching a trigger's filters, scoped by this trigger's own
    /// consumption state. Name and source filters AND across dimensions
    /// and OR within a set; a trigger with neither filter matches all
    /// events. `is_consumed: None` skips the consumption filter entirely.
    pub async fn get_events_for_trigger(
        &self,
        trigger: &Trigger,
        is_consumed: Option<bool>,
    ) -> anyhow::Result<Vec<Event>> {
        let names = trigger.event_names.as_deref().filter(|v| !v.is_empty());
        let sources = trigger.event_sources.as_deref().filter(|v| !v.is_empty());

        let mut clauses: Vec<String> = Vec::new();
        if let Some(names) = names {
            clauses.push(format!("name IN ({})", placeholders(names.len())));
        }
        if let Some(sources) = sources {
            clauses.push(format!("source IN ({})", placeholders(sources.len())));
        }
        match is_consumed {
            Some(true) => clauses.push(
                "id IN (SELECT event_id FROM triggered_events WHERE trigger_id = ?)".to_string(),
            ),
            Some(false) => clauses.push(
                "id NOT IN (SELECT event_id FROM triggered_events WHERE trigger_id = ?)"
                    .to_string(),
            ),
            None => {}
        }

        let mut sql = String::from("SELECT * FROM events");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp ASC");

        let mut query = sqlx::query(&sql);
        if let Some(names) = names {
            for name in names {
                query = query.bind(name);
            }
        }
        if let Some(sources) = sources {
            for source in sources {
                query = query.bind(source);
            }
        }
        if is_consumed.is_some() {
            query = query.bind(trigger.id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Record that a trigger consumed these events as part of an execution.
    /// Pure insert into the link table; the event rows are untouched.
    pub async fn mark_events_triggered(
        &self,
        trigger_id: i64,
        event_ids: &[i64],
        execution_id: i64,
    ) -> anyhow::Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for event_id in event_ids {
            sqlx::query(
                "INSERT INTO triggered_events (trigger_id, event_id, execution_id)
                 VALUES (?, ?, ?)",
            )
            .bind(trigger_id)
            .bind(event_id)
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Event> {
    let data_str: String = row.get("data");
    let timestamp_str: String = row.get("timestamp");
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(Event {
        id: row.get("id"),
        name: row.get("name"),
        source: row.get("source"),
        data: serde_json::from_str(&data_str)?,
        timestamp,
    })
}
