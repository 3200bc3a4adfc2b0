//! vigil - agent session monitor
//!
//! Launches a coding agent as an opaque subprocess, pins the transcript the
//! agent writes, and streams parsed steps to the terminal while persisting
//! them to the session store. Also serves the historical read path: list,
//! show, tail.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Session store: $XDG_DATA_HOME/vigil/sessions
//! - Logs: $XDG_STATE_HOME/vigil/vigil.log
//! - Config: $XDG_CONFIG_HOME/vigil/config.toml

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command as ProcessCommand;
use std::sync::Arc;
use std::thread;
use vigil_core::monitor::{self, Monitor, MonitorOutcome, Registry, SessionControl};
use vigil_core::{
    format, AgentType, Config, SessionFilter, SessionQuery, SessionStatus, SessionStore,
};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Monitor coding agent sessions through their transcripts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch an agent command and monitor the session it produces
    Run {
        /// Agent whose transcripts to watch
        #[arg(long, default_value = "claude_code")]
        agent: AgentType,

        /// Working directory of the invocation (defaults to the current dir)
        #[arg(long)]
        project: Option<PathBuf>,

        /// Emit steps as JSON lines instead of human-readable status lines
        #[arg(long)]
        json: bool,

        /// The agent command to launch
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// List monitored sessions
    List {
        /// Filter by status (running, completed, error, cancelled)
        #[arg(long)]
        status: Option<SessionStatus>,

        /// Filter by agent type
        #[arg(long)]
        agent: Option<AgentType>,

        /// Maximum number of sessions to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one session's steps and summary
    Show {
        session_id: String,

        /// Skip this many steps
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Window size
        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Follow a session's step log as it grows
    Tail {
        session_id: String,

        /// Start after this step id (0 replays from the beginning)
        #[arg(long, default_value = "0")]
        from: u64,

        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("failed to load configuration")?;
    let _log_guard =
        vigil_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let store = SessionStore::new(Config::store_root());

    match cli.command {
        Command::Run {
            agent,
            project,
            json,
            command,
        } => {
            let exit_code = run(&config, store, agent, project, json, command)?;
            // Flush pending log writes before propagating the agent's exit code
            drop(_log_guard);
            std::process::exit(exit_code);
        }
        Command::List {
            status,
            agent,
            limit,
        } => {
            // Sweep up sessions a crashed monitor left behind first
            monitor::recover_dangling(&store, &config.monitor)?;
            list(&store, status, agent, limit)
        }
        Command::Show {
            session_id,
            offset,
            limit,
            json,
        } => show(&config, store, &session_id, offset, limit, json),
        Command::Tail {
            session_id,
            from,
            json,
        } => tail(&config, store, &session_id, from, json),
    }
}

fn run(
    config: &Config,
    store: SessionStore,
    agent: AgentType,
    project: Option<PathBuf>,
    json: bool,
    command: Vec<String>,
) -> Result<i32> {
    let recovered = monitor::recover_dangling(&store, &config.monitor)?;
    if !recovered.is_empty() {
        tracing::info!(count = recovered.len(), "Recovered dangling sessions");
    }

    let project = match project {
        Some(p) => p,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    let Some(transcript_root) = config.transcript_root(agent) else {
        bail!("no transcript root known for agent {}", agent);
    };

    let t0 = Utc::now();
    tracing::info!(
        agent = %agent,
        project = %project.display(),
        command = ?command,
        "Launching agent"
    );

    let control = SessionControl::new();
    let ctrlc_control = Arc::clone(&control);
    ctrlc::set_handler(move || {
        ctrlc_control.cancel();
    })
    .context("failed to install ctrl-c handler")?;

    // The agent runs as an opaque subprocess; its stdout/stderr pass through
    // untouched and are never parsed.
    let waiter_control = Arc::clone(&control);
    let child_project = project.clone();
    let waiter = thread::spawn(move || -> Result<i32> {
        let status = ProcessCommand::new(&command[0])
            .args(&command[1..])
            .current_dir(&child_project)
            .status()
            .with_context(|| format!("failed to launch {}", command[0]))?;
        waiter_control.record_exit(status.success());
        Ok(status.code().unwrap_or(1))
    });

    let registry = Registry::new();
    let monitor = Monitor::new(
        store,
        registry,
        config.monitor.clone(),
        agent,
        project,
        transcript_root,
        t0,
    );

    let outcome = monitor.run(&control, |step| {
        let line = if json {
            format::step_json(step).unwrap_or_default()
        } else {
            format::step_line(step)
        };
        println!("{}", line);
    });

    match outcome {
        Ok(MonitorOutcome::Finished(summary)) => {
            println!("{}", format::summary_line(&summary));
        }
        Ok(MonitorOutcome::Unavailable { reason }) => {
            eprintln!("vigil: monitoring unavailable ({})", reason);
        }
        Err(e) => {
            // Monitoring faults never fail the agent run itself
            eprintln!("vigil: monitoring failed ({})", e);
            tracing::error!(error = %e, "Monitor run failed");
        }
    }

    match waiter.join() {
        Ok(Ok(code)) => Ok(code),
        Ok(Err(e)) => Err(e),
        Err(_) => bail!("agent waiter thread panicked"),
    }
}

fn list(
    store: &SessionStore,
    status: Option<SessionStatus>,
    agent: Option<AgentType>,
    limit: usize,
) -> Result<()> {
    let sessions = store.list_sessions(&SessionFilter {
        status,
        agent_type: agent,
        limit: Some(limit),
    })?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    for session in sessions {
        println!(
            "{}  {:<11} {:<9} {:>5} steps  {:>4} tools  {}",
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
            session.agent_type,
            session.status,
            session.step_count,
            session.tool_call_count,
            session.session_id,
        );
    }
    Ok(())
}

fn show(
    config: &Config,
    store: SessionStore,
    session_id: &str,
    offset: u64,
    limit: usize,
    json: bool,
) -> Result<()> {
    let query = SessionQuery::new(store, config.monitor.tail_poll());
    let detail = query
        .detail(session_id, offset, limit)
        .with_context(|| format!("failed to read session {}", session_id))?;

    for step in &detail.steps {
        if json {
            println!("{}", format::step_json(step)?);
        } else {
            println!("{}", format::step_line(step));
        }
    }
    if detail.has_more {
        eprintln!(
            "... more steps follow (use --offset {})",
            offset + detail.steps.len() as u64
        );
    }
    if let Some(summary) = &detail.summary {
        if json {
            println!("{}", serde_json::to_string(summary)?);
        } else {
            println!("{}", format::summary_line(summary));
        }
    }
    Ok(())
}

fn tail(
    config: &Config,
    store: SessionStore,
    session_id: &str,
    from: u64,
    json: bool,
) -> Result<()> {
    let query = SessionQuery::new(store, config.monitor.tail_poll());
    let tail = query
        .tail(session_id, from)
        .with_context(|| format!("failed to tail session {}", session_id))?;

    for batch in tail {
        for step in batch? {
            if json {
                println!("{}", format::step_json(&step)?);
            } else {
                println!("{}", format::step_line(&step));
            }
        }
    }
    Ok(())
}
