//! Daemon lifecycle: PID file handling, the HTTP event API, and the
//! foreground run loop that hosts the scheduler.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::db::TriggerDb;
use crate::scheduler::Scheduler;
use crate::wire::{IngestRequest, IngestResponse};

/// Exit code when a second daemon instance refuses to start (EX_CONFIG).
pub const EXIT_ALREADY_RUNNING: i32 = 78;

const STOP_GRACE: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(200);

fn pid_is_alive(pid: u32) -> bool {
    // Signal 0 performs the permission and existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// PID of a live daemon, if any. A PID file pointing at a dead or
/// unparseable process is stale and gets cleaned up here.
pub fn live_daemon_pid(pid_file: &Path) -> anyhow::Result<Option<u32>> {
    let content = match std::fs::read_to_string(pid_file) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if pid_is_alive(pid) => Ok(Some(pid)),
        _ => {
            info!("Removing stale PID file {}", pid_file.display());
            std::fs::remove_file(pid_file)?;
            Ok(None)
        }
    }
}

pub fn write_pid_file(pid_file: &Path) -> anyhow::Result<()> {
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_file, std::process::id().to_string())?;
    Ok(())
}

pub fn remove_pid_file(pid_file: &Path) {
    if let Err(e) = std::fs::remove_file(pid_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("Failed to remove PID file {}: {}", pid_file.display(), e);
        }
    }
}

/// Stop a running daemon: SIGTERM, wait up to ten seconds for a graceful
/// exit, then SIGKILL. Returns false when no daemon was running.
pub async fn stop_daemon(pid_file: &Path) -> anyhow::Result<bool> {
    let Some(pid) = live_daemon_pid(pid_file)? else {
        return Ok(false);
    };

    info!(pid, "Stopping daemon");
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };

    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while pid_is_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            info!(pid, "Daemon did not exit in time, sending SIGKILL");
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
            break;
        }
        tokio::time::sleep(STOP_POLL).await;
    }

    remove_pid_file(pid_file);
    Ok(true)
}

pub fn build_router(db: Arc<TriggerDb>) -> Router {
    Router::new()
        .route("/v1/health", get(health_handler))
        .route("/v1/events/ingest", post(ingest_handler))
        .with_state(db)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn ingest_handler(
    State(db): State<Arc<TriggerDb>>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, (StatusCode, String)> {
    let received_at = Utc::now();
    let new_events = request
        .events
        .into_iter()
        .map(|e| e.into_new_event(received_at))
        .collect::<Vec<_>>();
    let count = new_events.len();

    match db.events.create_many(new_events).await {
        Ok(created) => {
            info!(received = created.len(), "Ingested events");
            Ok(Json(IngestResponse {
                received: created.len(),
            }))
        }
        Err(e) => {
            error!(count, "Event ingestion failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Run the daemon in the foreground until SIGTERM or ctrl-c: scheduler
/// loop plus the event API, sharing one database.
///
/// The caller must have verified no other instance is running.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let pid_file = config.pid_file();
    write_pid_file(&pid_file)?;

    let db = Arc::new(TriggerDb::open(&config.db_path()).await?);
    let shutdown = CancellationToken::new();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("Shutdown signal received");
        signal_shutdown.cancel();
    });

    let scheduler = Scheduler::new(db.clone(), &config.scheduler);
    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    let addr = format!("{}:{}", config.daemon.host, config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Event API listening on http://{}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, build_router(db.clone()))
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    // The serve future only resolves once the token is cancelled; wait for
    // in-flight trigger runs before releasing the PID file.
    scheduler_task.await?;
    db.close().await;
    remove_pid_file(&pid_file);
    info!("Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::SqlitePool;

    async fn setup_db() -> (Arc<TriggerDb>, tempfile::NamedTempFile) {
        let db_file = tempfile::NamedTempFile::new().expect("temp db file");
        let db_url = format!("sqlite:{}", db_file.path().display());
        let pool = SqlitePool::connect(&db_url).await.expect("connect sqlite");
        let db = TriggerDb::from_pool(pool).await.expect("init trigger db");
        (Arc::new(db), db_file)
    }

    #[test]
    fn own_pid_is_seen_as_live() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("triggerd.pid");
        std::fs::write(&pid_file, std::process::id().to_string()).unwrap();
        assert_eq!(
            live_daemon_pid(&pid_file).unwrap(),
            Some(std::process::id())
        );
        assert!(pid_file.exists());
    }

    #[test]
    fn stale_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("triggerd.pid");

        // A process we know is dead by the time we check.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        std::fs::write(&pid_file, dead_pid.to_string()).unwrap();

        assert_eq!(live_daemon_pid(&pid_file).unwrap(), None);
        assert!(!pid_file.exists(), "stale file should be cleaned up");
    }

    #[test]
    fn garbage_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("triggerd.pid");
        std::fs::write(&pid_file, "not-a-pid").unwrap();
        assert_eq!(live_daemon_pid(&pid_file).unwrap(), None);
        assert!(!pid_file.exists());
    }

    #[test]
    fn missing_pid_file_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(live_daemon_pid(&dir.path().join("nope.pid")).unwrap(), None);
    }

    #[tokio::test]
    async fn stop_daemon_without_instance_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let stopped = stop_daemon(&dir.path().join("triggerd.pid")).await.unwrap();
        assert!(!stopped);
    }

    #[tokio::test]
    async fn ingest_handler_persists_events() {
        let (db, _f) = setup_db().await;
        let request: IngestRequest = serde_json::from_value(json!({
            "events": [
                {"name": "message_created", "source": "slack", "data": {"text": "hi"}},
                {"name": "note_created"}
            ]
        }))
        .unwrap();

        let response = ingest_handler(State(db.clone()), Json(request))
            .await
            .expect("ingest ok");
        assert_eq!(response.0.received, 2);

        let stored = db
            .events
            .get_all(crate::store::EventFilters::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].name, "message_created");
        assert!(stored[1].timestamp <= Utc::now());
    }
}
