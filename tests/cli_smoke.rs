mod common;

use common::triggerd_bin;
use predicates::prelude::*;

fn write_script(dir: &std::path::Path) -> std::path::PathBuf {
    let script = dir.join("job.py");
    std::fs::write(&script, "print('hello')\n").expect("write script");
    script
}

#[test]
fn list_is_empty_on_fresh_state() {
    let state = tempfile::tempdir().unwrap();
    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No triggers found"));
}

#[test]
fn trigger_lifecycle_roundtrip() {
    let state = tempfile::tempdir().unwrap();
    let script = write_script(state.path());

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["add", "--name", "daily-report", "--cron", "0 9 * * *", "--script"])
        .arg(&script)
        .assert()
        .success()
        .stdout(predicate::str::contains("Added trigger 'daily-report'"));

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("daily-report"))
        .stdout(predicate::str::contains("enabled"));

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["show", "daily-report"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Schedule: 0 9 * * *"))
        .stdout(predicate::str::contains("No executions found"));

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["disable", "daily-report"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Disabled trigger 'daily-report'"));

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["enable", "daily-report"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Enabled trigger 'daily-report'"));

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["remove", "daily-report"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed trigger 'daily-report'"));

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["remove", "daily-report"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn add_rejects_missing_script() {
    let state = tempfile::tempdir().unwrap();
    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["add", "--name", "t", "--cron", "* * * * *", "--script", "/no/such/script.py"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn add_rejects_invalid_cron() {
    let state = tempfile::tempdir().unwrap();
    let script = write_script(state.path());
    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["add", "--name", "t", "--cron", "not a cron", "--script"])
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid cron schedule"));
}

#[test]
fn duplicate_names_are_rejected() {
    let state = tempfile::tempdir().unwrap();
    let script = write_script(state.path());

    let add = |name: &str| {
        let mut cmd = triggerd_bin();
        cmd.env("TRIGGERD_DIR", state.path())
            .args(["add", "--name", name, "--cron", "* * * * *", "--script"])
            .arg(&script);
        cmd
    };
    add("once").assert().success();
    add("once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn daemon_status_reports_not_running() {
    let state = tempfile::tempdir().unwrap();
    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Daemon is not running"));
}

#[test]
fn reset_clears_all_triggers() {
    let state = tempfile::tempdir().unwrap();
    let script = write_script(state.path());

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .args(["add", "--name", "keepme", "--cron", "* * * * *", "--script"])
        .arg(&script)
        .assert()
        .success();

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .arg("reset")
        .assert()
        .success();

    triggerd_bin()
        .env("TRIGGERD_DIR", state.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No triggers found"));
}
