//! The scheduling loop and trigger script execution.
//!
//! Every tick the scheduler collects due triggers and hands them to a
//! bounded worker pool, advancing `next_run_at` BEFORE the script starts
//! (a slow run must never cause a double fire). Event filtered triggers
//! with nothing pending are left due and re-checked next tick.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::db::TriggerDb;
use crate::store::executions::TriggerExecution;
use crate::store::triggers::Trigger;
use crate::wire;

/// Exit code recorded when a script runs past its timeout.
pub const EXIT_CODE_TIMEOUT: i64 = -1;
/// Exit code recorded when a script could not be run or died on a signal.
pub const EXIT_CODE_ERROR: i64 = -2;

/// Runs trigger scripts as `<program> run <script_path>` with the matched
/// events serialized to stdin.
#[derive(Clone)]
pub struct ScriptRunner {
    program: String,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            program: config.script_runner.clone(),
            timeout: Duration::from_secs(config.script_timeout_secs),
        }
    }

    #[cfg(test)]
    fn new(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            timeout,
        }
    }

    /// Run a script to completion, returning its combined output and exit
    /// code. Never fails: spawn errors and timeouts are folded into the
    /// sentinel exit codes so they land in the execution record.
    pub async fn run(&self, script_path: &str, stdin_payload: Option<&str>) -> (String, i64) {
        let mut command = Command::new(&self.program);
        command
            .arg("run")
            .arg(script_path)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return (
                    format!("Failed to run script {}: {}", script_path, e),
                    EXIT_CODE_ERROR,
                )
            }
        };

        if let Some(payload) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    warn!(script = %script_path, "Failed to write events to script stdin: {}", e);
                }
                // Dropping stdin closes the pipe so the script sees EOF.
            }
        }

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
                logs.push_str(&String::from_utf8_lossy(&output.stderr));
                let exit_code = output.status.code().map(i64::from).unwrap_or(EXIT_CODE_ERROR);
                (logs, exit_code)
            }
            Ok(Err(e)) => (
                format!("Failed to collect script output: {}", e),
                EXIT_CODE_ERROR,
            ),
            // Timed-out child is killed when the dropped future releases it.
            Err(_) => (
                format!("Script timed out after {}s", self.timeout.as_secs()),
                EXIT_CODE_TIMEOUT,
            ),
        }
    }
}

/// Execute one trigger end to end: claim its pending events, run the
/// script, record the outcome. Events are marked consumed before the
/// script starts, so a crashed or failing script never replays them.
///
/// Does not touch `next_run_at`; manual runs go through here too and must
/// leave the schedule alone.
pub async fn execute_trigger(
    db: &TriggerDb,
    trigger: &Trigger,
    runner: &ScriptRunner,
) -> anyhow::Result<TriggerExecution> {
    let events = if trigger.is_event_based() {
        db.events
            .get_events_for_trigger(trigger, Some(false))
            .await?
    } else {
        Vec::new()
    };

    let execution = db.executions.create(trigger.id).await?;

    if !events.is_empty() {
        let event_ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        db.events
            .mark_events_triggered(trigger.id, &event_ids, execution.id)
            .await?;
    }

    info!(
        trigger = %trigger.name,
        events = events.len(),
        "Running trigger script {}",
        trigger.script_path
    );
    let payload = wire::script_payload(&events)?;
    let (logs, exit_code) = runner.run(&trigger.script_path, payload.as_deref()).await;

    if exit_code != 0 {
        warn!(trigger = %trigger.name, exit_code, "Trigger script did not exit cleanly");
    }

    db.executions
        .set_completed(execution.id, exit_code, &logs)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution {} disappeared mid-run", execution.id))
}

pub struct Scheduler {
    db: Arc<TriggerDb>,
    runner: ScriptRunner,
    tick_interval: Duration,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(db: Arc<TriggerDb>, config: &SchedulerConfig) -> Self {
        Self {
            db,
            runner: ScriptRunner::from_config(config),
            tick_interval: Duration::from_secs(config.tick_interval_secs),
            workers: Arc::new(Semaphore::new(config.worker_count)),
            tracker: TaskTracker::new(),
        }
    }

    /// Tick until shutdown is requested, then wait for in-flight scripts
    /// to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_secs = self.tick_interval.as_secs(),
            workers = self.workers.available_permits(),
            "Scheduler started"
        );
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
            }
        }
        info!("Scheduler stopping, draining in-flight trigger runs");
        self.drain().await;
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let due = self.db.triggers.get_due_triggers(now).await?;
        for trigger in due {
            self.dispatch(trigger).await?;
        }
        Ok(())
    }

    /// Run a due trigger on the worker pool. An event filtered trigger
    /// with nothing pending is skipped without touching `next_run_at`, so
    /// it stays due and fires on the first tick after an event arrives.
    async fn dispatch(&self, trigger: Trigger) -> anyhow::Result<()> {
        if trigger.is_event_based() {
            let pending = self
                .db
                .events
                .get_events_for_trigger(&trigger, Some(false))
                .await?;
            if pending.is_empty() {
                debug!(trigger = %trigger.name, "No pending events, skipping run");
                return Ok(());
            }
        }

        // Reschedule before the script starts so a slow run cannot fire twice.
        let next = self
            .db
            .triggers
            .update_next_run_time(trigger.id, Utc::now())
            .await?;
        debug!(trigger = %trigger.name, next = ?next, "Trigger due, rescheduled");

        let permit = self.workers.clone().acquire_owned().await?;
        let db = self.db.clone();
        let runner = self.runner.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            if let Err(e) = execute_trigger(&db, &trigger, &runner).await {
                error!(trigger = %trigger.name, "Trigger execution failed: {}", e);
            }
        });
        Ok(())
    }

    async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TriggerDb;
    use crate::store::executions::ExecutionFilters;
    use crate::store::triggers::CreateTrigger;
    use serde_json::json;
    use sqlx::SqlitePool;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    async fn setup_db() -> (Arc<TriggerDb>, tempfile::NamedTempFile) {
        let db_file = tempfile::NamedTempFile::new().expect("temp db file");
        let db_url = format!("sqlite:{}", db_file.path().display());
        let pool = SqlitePool::connect(&db_url).await.expect("connect sqlite");
        let db = TriggerDb::from_pool(pool).await.expect("init trigger db");
        (Arc::new(db), db_file)
    }

    /// Stand-in for the real runner: drops the "run" argument and hands
    /// the script to /bin/sh.
    fn fake_runner(dir: &Path) -> PathBuf {
        let path = dir.join("runner.sh");
        std::fs::write(&path, "#!/bin/sh\nshift\nexec /bin/sh \"$1\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    async fn force_due(db: &TriggerDb, trigger_id: i64) {
        let past = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        sqlx::query("UPDATE triggers SET next_run_at = ? WHERE id = ?")
            .bind(past)
            .bind(trigger_id)
            .execute(&db.pool())
            .await
            .expect("force due");
    }

    fn test_config(runner: &Path) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_secs: 1,
            worker_count: 4,
            script_timeout_secs: 5,
            script_runner: runner.display().to_string(),
        }
    }

    #[tokio::test]
    async fn runner_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner_path = fake_runner(dir.path());
        let script = write_script(dir.path(), "fail.sh", "echo hello\necho oops >&2\nexit 3\n");

        let runner = ScriptRunner::new(&runner_path.display().to_string(), Duration::from_secs(5));
        let (logs, exit_code) = runner.run(&script.display().to_string(), None).await;
        assert!(logs.contains("hello"));
        assert!(logs.contains("oops"));
        assert_eq!(exit_code, 3);
    }

    #[tokio::test]
    async fn runner_times_out_slow_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let runner_path = fake_runner(dir.path());
        let script = write_script(dir.path(), "slow.sh", "sleep 30\n");

        let runner =
            ScriptRunner::new(&runner_path.display().to_string(), Duration::from_millis(200));
        let (logs, exit_code) = runner.run(&script.display().to_string(), None).await;
        assert_eq!(exit_code, EXIT_CODE_TIMEOUT);
        assert!(logs.contains("timed out"));
    }

    #[tokio::test]
    async fn runner_reports_missing_program() {
        let runner = ScriptRunner::new("/nonexistent/runner", Duration::from_secs(1));
        let (logs, exit_code) = runner.run("/tmp/whatever.py", None).await;
        assert_eq!(exit_code, EXIT_CODE_ERROR);
        assert!(logs.contains("Failed to run script"));
    }

    #[tokio::test]
    async fn execute_trigger_consumes_events_and_feeds_stdin() {
        let (db, _f) = setup_db().await;
        let dir = tempfile::tempdir().unwrap();
        let runner_path = fake_runner(dir.path());
        // Counts the events received on stdin.
        let script = write_script(
            dir.path(),
            "count.sh",
            "grep -o '\"id\":' - | wc -l\n",
        );

        let trigger = db
            .triggers
            .create(
                CreateTrigger::new("counter", "* * * * *", &script.display().to_string())
                    .with_event_filters(Some(vec!["ping".to_string()]), None),
            )
            .await
            .unwrap();
        db.events
            .create("ping", None, json!({}), Utc::now())
            .await
            .unwrap();
        db.events
            .create("ping", None, json!({}), Utc::now())
            .await
            .unwrap();

        let runner = ScriptRunner::new(&runner_path.display().to_string(), Duration::from_secs(5));
        let execution = execute_trigger(&db, &trigger, &runner).await.unwrap();
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(execution.logs.trim(), "2");

        // Both events were consumed before the script ran.
        let pending = db
            .events
            .get_events_for_trigger(&trigger, Some(false))
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn failed_scripts_still_consume_their_events() {
        let (db, _f) = setup_db().await;
        let dir = tempfile::tempdir().unwrap();
        let runner_path = fake_runner(dir.path());
        let script = write_script(dir.path(), "bad.sh", "exit 1\n");

        let trigger = db
            .triggers
            .create(
                CreateTrigger::new("flaky", "* * * * *", &script.display().to_string())
                    .with_event_filters(Some(vec!["ping".to_string()]), None),
            )
            .await
            .unwrap();
        db.events
            .create("ping", None, json!({}), Utc::now())
            .await
            .unwrap();

        let runner = ScriptRunner::new(&runner_path.display().to_string(), Duration::from_secs(5));
        let execution = execute_trigger(&db, &trigger, &runner).await.unwrap();
        assert_eq!(execution.exit_code, Some(1));

        let pending = db
            .events
            .get_events_for_trigger(&trigger, Some(false))
            .await
            .unwrap();
        assert!(pending.is_empty(), "failure must not replay events");
    }

    #[tokio::test]
    async fn timed_out_runs_still_complete_their_execution_row() {
        let (db, _f) = setup_db().await;
        let dir = tempfile::tempdir().unwrap();
        let runner_path = fake_runner(dir.path());
        let script = write_script(dir.path(), "hang.sh", "sleep 30\n");

        let trigger = db
            .triggers
            .create(CreateTrigger::new(
                "hang",
                "* * * * *",
                &script.display().to_string(),
            ))
            .await
            .unwrap();

        let runner =
            ScriptRunner::new(&runner_path.display().to_string(), Duration::from_millis(200));
        let execution = execute_trigger(&db, &trigger, &runner).await.unwrap();
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.exit_code, Some(EXIT_CODE_TIMEOUT));
        assert!(execution.logs.contains("timed out"));
    }

    #[tokio::test]
    async fn manual_run_leaves_schedule_untouched() {
        let (db, _f) = setup_db().await;
        let dir = tempfile::tempdir().unwrap();
        let runner_path = fake_runner(dir.path());
        let script = write_script(dir.path(), "ok.sh", "exit 0\n");

        let trigger = db
            .triggers
            .create(CreateTrigger::new(
                "manual",
                "0 9 * * *",
                &script.display().to_string(),
            ))
            .await
            .unwrap();
        let before = trigger.next_run_at;

        let runner = ScriptRunner::new(&runner_path.display().to_string(), Duration::from_secs(5));
        execute_trigger(&db, &trigger, &runner).await.unwrap();

        let after = db.triggers.get(trigger.id).await.unwrap().unwrap();
        assert_eq!(after.next_run_at, before);
    }

    #[tokio::test]
    async fn tick_skips_event_trigger_with_nothing_pending_and_keeps_it_due() {
        let (db, _f) = setup_db().await;
        let dir = tempfile::tempdir().unwrap();
        let runner_path = fake_runner(dir.path());
        let script = write_script(dir.path(), "never.sh", "echo ran\n");

        let trigger = db
            .triggers
            .create(
                CreateTrigger::new("quiet", "* * * * *", &script.display().to_string())
                    .with_event_filters(Some(vec!["ping".to_string()]), None),
            )
            .await
            .unwrap();
        force_due(&db, trigger.id).await;

        let scheduler = Scheduler::new(db.clone(), &test_config(&runner_path));
        scheduler.tick().await.unwrap();

        let executions = db
            .executions
            .get_all(ExecutionFilters::default())
            .await
            .unwrap();
        assert!(executions.is_empty(), "no events, no run");

        // Still due; the next tick with a pending event fires immediately.
        let after = db.triggers.get(trigger.id).await.unwrap().unwrap();
        assert!(after.next_run_at.unwrap() <= Utc::now());

        db.events
            .create("ping", None, json!({}), Utc::now())
            .await
            .unwrap();
        scheduler.tick().await.unwrap();
        scheduler.drain().await;

        let executions = db
            .executions
            .get_all(ExecutionFilters::default())
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        let rescheduled = db.triggers.get(trigger.id).await.unwrap().unwrap();
        assert!(rescheduled.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn tick_runs_due_cron_trigger_and_advances_schedule() {
        let (db, _f) = setup_db().await;
        let dir = tempfile::tempdir().unwrap();
        let runner_path = fake_runner(dir.path());
        let script = write_script(dir.path(), "hello.sh", "echo scheduled run\n");

        let trigger = db
            .triggers
            .create(CreateTrigger::new(
                "cron-only",
                "* * * * *",
                &script.display().to_string(),
            ))
            .await
            .unwrap();
        force_due(&db, trigger.id).await;

        let scheduler = Scheduler::new(db.clone(), &test_config(&runner_path));
        scheduler.tick().await.unwrap();
        scheduler.drain().await;

        let executions = db
            .executions
            .get_all(ExecutionFilters {
                trigger_id: Some(trigger.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].exit_code, Some(0));
        assert!(executions[0].logs.contains("scheduled run"));

        let after = db.triggers.get(trigger.id).await.unwrap().unwrap();
        assert!(after.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn disabled_triggers_are_never_due() {
        let (db, _f) = setup_db().await;
        let dir = tempfile::tempdir().unwrap();
        let runner_path = fake_runner(dir.path());
        let script = write_script(dir.path(), "noop.sh", "exit 0\n");

        let trigger = db
            .triggers
            .create(CreateTrigger::new(
                "dormant",
                "* * * * *",
                &script.display().to_string(),
            ))
            .await
            .unwrap();
        db.triggers
            .update(
                trigger.id,
                crate::store::triggers::UpdateTrigger {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        force_due(&db, trigger.id).await;

        let scheduler = Scheduler::new(db.clone(), &test_config(&runner_path));
        scheduler.tick().await.unwrap();
        scheduler.drain().await;

        let executions = db
            .executions
            .get_all(ExecutionFilters::default())
            .await
            .unwrap();
        assert!(executions.is_empty());
    }
}
