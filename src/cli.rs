//! Command line interface for managing triggers and the daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::daemon;
use crate::db::TriggerDb;
use crate::scheduler::{execute_trigger, ScriptRunner};
use crate::sink::{EventSink, HttpSink};
use crate::store::triggers::{CreateTrigger, TriggerFilters, UpdateTrigger};
use crate::store::ExecutionFilters;

#[derive(Parser)]
#[command(name = "triggerd", version, about = "Cron and event driven script triggers")]
pub struct Cli {
    /// Config file path, defaults to <data_dir>/config.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Add a new trigger
    Add {
        /// Trigger name, must be unique
        #[arg(long, short)]
        name: String,
        /// Cron schedule, e.g. '0 * * * *'
        #[arg(long, short)]
        cron: String,
        /// Script to execute when the trigger fires
        #[arg(long, short)]
        script: PathBuf,
        /// Only fire for events with one of these names (repeatable)
        #[arg(long = "event-name")]
        event_names: Vec<String>,
        /// Only fire for events from one of these sources (repeatable)
        #[arg(long = "event-source")]
        event_sources: Vec<String>,
    },
    /// List all triggers
    List,
    /// Show a trigger and its recent executions
    Show { name: String },
    /// Enable a trigger
    Enable { name: String },
    /// Disable a trigger
    Disable { name: String },
    /// Remove a trigger
    Remove { name: String },
    /// Delete all triggers
    Reset,
    /// Run a trigger's script immediately, without touching its schedule
    Run { name: String },
    /// Send an event to a running daemon
    Emit {
        /// Event name
        name: String,
        /// Event source label
        #[arg(long)]
        source: Option<String>,
        /// Event payload as JSON
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Manage the background daemon
    #[command(subcommand)]
    Daemon(DaemonCommand),
}

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon in the background
    Start,
    /// Stop the running daemon
    Stop,
    /// Report whether the daemon is running
    Status,
    /// Run the daemon in the foreground
    RunForeground {
        /// Write logs to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

impl Cli {
    /// Log file for the foreground daemon, when one was requested.
    pub fn log_file(&self) -> Option<&PathBuf> {
        match &self.command {
            Command::Daemon(DaemonCommand::RunForeground { log_file }) => log_file.as_ref(),
            _ => None,
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_default()?,
    };

    match cli.command {
        Command::Add {
            name,
            cron,
            script,
            event_names,
            event_sources,
        } => {
            if !script.is_file() {
                anyhow::bail!("Script path '{}' does not exist", script.display());
            }
            let script = script.canonicalize()?;
            let db = open_db(&config).await?;
            let none_if_empty = |v: Vec<String>| if v.is_empty() { None } else { Some(v) };
            let trigger = db
                .triggers
                .create(
                    CreateTrigger::new(&name, &cron, script.display().to_string())
                        .with_event_filters(
                            none_if_empty(event_names),
                            none_if_empty(event_sources),
                        ),
                )
                .await?;
            println!("Added trigger '{}'", trigger.name);
        }

        Command::List => {
            let db = open_db(&config).await?;
            let triggers = db.triggers.get_all(TriggerFilters::default()).await?;
            if triggers.is_empty() {
                println!("No triggers found");
                return Ok(());
            }
            println!(
                "{:<20} {:<9} {:<14} {:<20} SCRIPT",
                "NAME", "STATUS", "SCHEDULE", "NEXT RUN"
            );
            for trigger in triggers {
                let status = if trigger.enabled { "enabled" } else { "disabled" };
                let next_run = trigger
                    .next_run_at
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:<9} {:<14} {:<20} {}",
                    trigger.name,
                    status,
                    trigger.cron_schedule.as_deref().unwrap_or("-"),
                    next_run,
                    trigger.script_path
                );
            }
        }

        Command::Show { name } => {
            let db = open_db(&config).await?;
            let trigger = db
                .triggers
                .get_by_name(&name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Trigger '{}' not found", name))?;

            println!("Trigger: {}", trigger.name);
            println!("  ID: {}", trigger.id);
            println!(
                "  Status: {}",
                if trigger.enabled { "enabled" } else { "disabled" }
            );
            println!(
                "  Schedule: {}",
                trigger.cron_schedule.as_deref().unwrap_or("-")
            );
            println!("  Script: {}", trigger.script_path);
            if let Some(names) = &trigger.event_names {
                println!("  Event names: {}", names.join(", "));
            }
            if let Some(sources) = &trigger.event_sources {
                println!("  Event sources: {}", sources.join(", "));
            }
            if let Some(next) = trigger.next_run_at {
                println!("  Next run: {}", next.to_rfc3339());
            }
            println!("  Created: {}", trigger.created_at.to_rfc3339());

            let executions = db
                .executions
                .get_all(ExecutionFilters {
                    trigger_id: Some(trigger.id),
                    limit: Some(5),
                    ..Default::default()
                })
                .await?;
            if executions.is_empty() {
                println!("\nNo executions found");
            } else {
                println!("\nRecent executions:");
                for execution in executions {
                    match execution.completed_at {
                        Some(completed_at) => {
                            let mark = if execution.succeeded() { "ok" } else { "failed" };
                            println!(
                                "  [{}] {} (exit: {})",
                                mark,
                                completed_at.to_rfc3339(),
                                execution
                                    .exit_code
                                    .map(|c| c.to_string())
                                    .unwrap_or_else(|| "-".to_string())
                            );
                            let tail: Vec<&str> = execution
                                .logs
                                .lines()
                                .rev()
                                .take(10)
                                .collect::<Vec<_>>()
                                .into_iter()
                                .rev()
                                .collect();
                            if !tail.is_empty() {
                                for line in tail {
                                    println!("    {}", line);
                                }
                            }
                        }
                        None => {
                            println!("  [running] {}", execution.created_at.to_rfc3339());
                        }
                    }
                }
            }
        }

        Command::Enable { name } => {
            set_enabled(&config, &name, true).await?;
        }

        Command::Disable { name } => {
            set_enabled(&config, &name, false).await?;
        }

        Command::Remove { name } => {
            let db = open_db(&config).await?;
            if db.triggers.delete_by_name(&name).await? {
                println!("Removed trigger '{}'", name);
            } else {
                anyhow::bail!("Trigger '{}' not found", name);
            }
        }

        Command::Reset => {
            let db = open_db(&config).await?;
            db.triggers.delete_all().await?;
            println!("Reset trigger database");
        }

        Command::Run { name } => {
            let db = open_db(&config).await?;
            let trigger = db
                .triggers
                .get_by_name(&name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Trigger '{}' not found", name))?;
            let runner = ScriptRunner::from_config(&config.scheduler);
            let execution = execute_trigger(&db, &trigger, &runner).await?;
            println!(
                "Ran trigger '{}' (exit: {})",
                name,
                execution
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            if !execution.logs.is_empty() {
                print!("{}", execution.logs);
            }
        }

        Command::Emit { name, source, data } => {
            let data: serde_json::Value = serde_json::from_str(&data)
                .map_err(|e| anyhow::anyhow!("Invalid event data JSON: {}", e))?;
            let url = format!("http://{}:{}", config.daemon.host, config.daemon.port);
            let mut sink = HttpSink::unbuffered(&url);
            sink.send(&name, data, source.as_deref()).await?;
            sink.close().await?;
            println!("Sent event '{}'", name);
        }

        Command::Daemon(command) => run_daemon_command(command, &cli.config, config).await?,
    }

    Ok(())
}

async fn run_daemon_command(
    command: DaemonCommand,
    config_path: &Option<PathBuf>,
    config: AppConfig,
) -> anyhow::Result<()> {
    let pid_file = config.pid_file();
    match command {
        DaemonCommand::Start => {
            if daemon::live_daemon_pid(&pid_file)?.is_some() {
                println!("Daemon is already running");
                return Ok(());
            }
            let log_file = config.log_file();
            let exe = std::env::current_exe()?;
            let mut child = std::process::Command::new(exe);
            child
                .arg("daemon")
                .arg("run-foreground")
                .arg("--log-file")
                .arg(&log_file)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
            if let Some(path) = config_path {
                child.arg("--config").arg(path);
            }
            // Detach from our process group so the daemon outlives the CLI.
            std::os::unix::process::CommandExt::process_group(&mut child, 0);
            child.spawn()?;
            println!("Daemon started in background (logs: {})", log_file.display());
        }

        DaemonCommand::Stop => {
            if daemon::stop_daemon(&pid_file).await? {
                println!("Daemon stopped");
            } else {
                println!("Daemon is not running");
            }
        }

        DaemonCommand::Status => match daemon::live_daemon_pid(&pid_file)? {
            Some(pid) => println!("Daemon is running (PID: {})", pid),
            None => println!("Daemon is not running"),
        },

        DaemonCommand::RunForeground { .. } => {
            if let Some(pid) = daemon::live_daemon_pid(&pid_file)? {
                eprintln!("Daemon is already running (PID: {})", pid);
                std::process::exit(daemon::EXIT_ALREADY_RUNNING);
            }
            daemon::run(config).await?;
        }
    }
    Ok(())
}

async fn open_db(config: &AppConfig) -> anyhow::Result<Arc<TriggerDb>> {
    Ok(Arc::new(TriggerDb::open(&config.db_path()).await?))
}

async fn set_enabled(config: &AppConfig, name: &str, enabled: bool) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let trigger = db
        .triggers
        .get_by_name(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Trigger '{}' not found", name))?;

    let state = if enabled { "enabled" } else { "disabled" };
    if trigger.enabled == enabled {
        println!("Trigger '{}' is already {}", name, state);
        return Ok(());
    }

    db.triggers
        .update(
            trigger.id,
            UpdateTrigger {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await?;
    println!("{} trigger '{}'", if enabled { "Enabled" } else { "Disabled" }, name);
    Ok(())
}
