//! `agentbox` command-line entry point.

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

use agentbox::command::Secrets;
use agentbox::core::parser::parse;
use agentbox::core::types::{AgentKind, TaskId, TaskKey};
use agentbox::exit_codes;
use agentbox::io::config::{AgentboxConfig, DEFAULT_CONFIG_FILE, load_config};
use agentbox::io::docker::DockerEngine;
use agentbox::io::script::{ScriptParams, render_script};
use agentbox::io::store::FileTaskStore;
use agentbox::logging;
use agentbox::pipeline::{TaskOutcome, TaskRunner};
use agentbox::reaper::Reaper;

#[derive(Parser)]
#[command(
    name = "agentbox",
    version,
    about = "Run coding-agent tasks in ephemeral container environments"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one attempt per task, concurrently.
    Run {
        /// Task to run (repeatable).
        #[arg(long = "task-id", required = true)]
        task_ids: Vec<TaskId>,
        /// Owner of the tasks.
        #[arg(long)]
        user_id: String,
        /// Token embedded into clone URLs for configured hosts.
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        github_token: Option<String>,
    },
    /// Destroy stale environments once and print how many were removed.
    Reap,
    /// Decode a captured console log (`-` for stdin) and print it as JSON.
    Parse { file: PathBuf },
    /// Print the in-environment task script.
    Script,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task_ids,
            user_id,
            github_token,
        } => {
            let config = load_config(&cli.config)?;
            let mut secrets = Secrets::from_env();
            if github_token.is_some() {
                secrets.github_token = github_token;
            }
            run_tasks(&config, &secrets, &task_ids, &user_id)
        }
        Command::Reap => {
            let config = load_config(&cli.config)?;
            let engine = DockerEngine::new(&config.engine);
            let count = Reaper::from_config(&engine, &config).reap();
            println!("{count}");
            Ok(exit_codes::OK)
        }
        Command::Parse { file } => {
            let raw = read_input(&file)?;
            let parsed = parse(&raw);
            println!("{}", serde_json::to_string_pretty(&parsed)?);
            Ok(exit_codes::OK)
        }
        Command::Script => {
            let config = load_config(&cli.config)?;
            let params = ScriptParams::from_config(AgentKind::Claude, &config.engine, &config.git);
            print!("{}", render_script(&params)?);
            Ok(exit_codes::OK)
        }
    }
}

fn run_tasks(
    config: &AgentboxConfig,
    secrets: &Secrets,
    task_ids: &[TaskId],
    user_id: &str,
) -> Result<i32> {
    let engine = DockerEngine::new(&config.engine);
    let store = FileTaskStore::new(&config.store.dir)?;
    let runner = TaskRunner::new(&engine, &store, config, secrets);
    let task_ids = unique_task_ids(task_ids);
    info!(tasks = task_ids.len(), store = %store.root().display(), "running tasks");

    let outcomes: Vec<(TaskId, TaskOutcome)> = thread::scope(|scope| {
        let handles: Vec<_> = task_ids
            .iter()
            .map(|&task_id| {
                let runner = &runner;
                let key = TaskKey::new(task_id, user_id);
                scope.spawn(move || (task_id, runner.run(&key)))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("task thread panicked"))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut code = exit_codes::OK;
    for (task_id, outcome) in &outcomes {
        println!("{task_id}\t{}", describe(outcome));
        if outcome.is_failure() {
            code = exit_codes::TASK_FAILED;
        }
    }
    Ok(code)
}

/// One pipeline per task: a repeated `--task-id` must not launch two
/// environments for the same task.
fn unique_task_ids(task_ids: &[TaskId]) -> Vec<TaskId> {
    task_ids
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn describe(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Completed {
            commit_hash: Some(hash),
        } => format!("completed {hash}"),
        TaskOutcome::Completed { commit_hash: None } => "completed (no changes)".to_string(),
        TaskOutcome::Failed { error } => {
            let first_line = error.lines().next().unwrap_or_default();
            format!("failed: {first_line}")
        }
        TaskOutcome::NotFound => "not found".to_string(),
        TaskOutcome::Skipped { status } => format!("skipped (already {status})"),
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read console output from stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_repeated_task_ids() {
        let cli = Cli::parse_from([
            "agentbox", "run", "--task-id", "1", "--task-id", "2", "--user-id", "alice",
        ]);
        match cli.command {
            Command::Run {
                task_ids, user_id, ..
            } => {
                assert_eq!(task_ids, [1, 2]);
                assert_eq!(user_id, "alice");
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn repeated_task_ids_run_once() {
        assert_eq!(unique_task_ids(&[42, 7, 42, 7, 42]), [7, 42]);
    }

    #[test]
    fn run_requires_a_task_id() {
        assert!(Cli::try_parse_from(["agentbox", "run", "--user-id", "alice"]).is_err());
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["agentbox", "reap", "--config", "custom.toml"]);
        assert!(matches!(cli.command, Command::Reap));
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
    }

    #[test]
    fn describe_outcomes() {
        assert_eq!(
            describe(&TaskOutcome::Completed { commit_hash: None }),
            "completed (no changes)"
        );
        assert_eq!(
            describe(&TaskOutcome::Failed {
                error: "Environment exited with code 1: line one\nline two".to_string()
            }),
            "failed: Environment exited with code 1: line one"
        );
    }
}
