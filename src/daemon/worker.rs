//! Worker processes.
//!
//! A spawned worker is an opaque external program. The daemon only sees its
//! exit status and how long it ran; each spawn is a bounded call that ends
//! in exactly one [`WorkerOutcome`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;

use crate::config::WorkerConfig;
use crate::error::ExitError;
use crate::mailbox::Message;

pub const ENV_CELL: &str = "COLONY_CELL";
pub const ENV_MESSAGE_ID: &str = "COLONY_MESSAGE_ID";
pub const ENV_AUTONOMOUS: &str = "COLONY_AUTONOMOUS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Success,
    Failure { code: Option<i32>, detail: String },
    Timeout,
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkerOutcome::Success => "success",
            WorkerOutcome::Failure { .. } => "failure",
            WorkerOutcome::Timeout => "timeout",
        }
    }

    /// Text recorded as a message's `failure`.
    pub fn describe(&self, max_runtime: Duration) -> String {
        match self {
            WorkerOutcome::Success => "success".into(),
            WorkerOutcome::Failure { detail, .. } => detail.clone(),
            WorkerOutcome::Timeout => format!("timed out after {}s", max_runtime.as_secs()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub cell: String,
    /// `None` for a heartbeat wake.
    pub message_id: Option<u64>,
    pub prompt: String,
    pub workdir: Option<PathBuf>,
    pub max_runtime: Duration,
    pub max_turns: u32,
}

pub trait WorkerHandle: Send {
    fn pid(&self) -> u32;

    /// Non-blocking check. Past the runtime bound the worker is killed and
    /// `Timeout` returned.
    fn poll(&mut self) -> anyhow::Result<Option<WorkerOutcome>>;
}

pub trait WorkerRunner: Send {
    fn spawn(&self, request: &WorkerRequest) -> anyhow::Result<Box<dyn WorkerHandle>>;
}

/// Launches the configured agent program as an independent OS process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    log_dir: PathBuf,
}

impl ProcessRunner {
    pub fn new(config: &WorkerConfig, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            log_dir: log_dir.into(),
        }
    }

    fn render_args(&self, request: &WorkerRequest) -> Vec<String> {
        let workdir = request
            .workdir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.args
            .iter()
            .map(|a| {
                a.replace("{prompt}", &request.prompt)
                    .replace("{cell}", &request.cell)
                    .replace("{max_turns}", &request.max_turns.to_string())
                    .replace("{workdir}", &workdir)
            })
            .collect()
    }
}

impl WorkerRunner for ProcessRunner {
    fn spawn(&self, request: &WorkerRequest) -> anyhow::Result<Box<dyn WorkerHandle>> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("creating {}", self.log_dir.display()))?;
        let log_path = self.log_dir.join(format!("{}.log", request.cell));
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening {}", log_path.display()))?;
        writeln!(
            log,
            "--- {} cell={} message={} ---",
            chrono::Utc::now().to_rfc3339(),
            request.cell,
            request
                .message_id
                .map_or_else(|| "heartbeat".to_string(), |id| id.to_string())
        )?;
        let stderr_log = log.try_clone().context("duplicating worker log handle")?;

        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(request))
            .env(ENV_CELL, &request.cell)
            .env(ENV_AUTONOMOUS, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log));
        if let Some(id) = request.message_id {
            cmd.env(ENV_MESSAGE_ID, id.to_string());
        }
        if let Some(dir) = &request.workdir {
            cmd.current_dir(dir);
        }
        // Own process group: a Ctrl-C aimed at the daemon must not take
        // in-flight workers down with it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| -> anyhow::Error {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExitError::ToolNotFound {
                    tool: self.program.clone(),
                }
                .into()
            } else {
                anyhow::Error::new(e).context(format!("spawning {}", self.program))
            }
        })?;

        Ok(Box::new(ProcessHandle {
            child,
            started: Instant::now(),
            max_runtime: request.max_runtime,
        }))
    }
}

struct ProcessHandle {
    child: Child,
    started: Instant,
    max_runtime: Duration,
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn poll(&mut self) -> anyhow::Result<Option<WorkerOutcome>> {
        match self.child.try_wait().context("waiting for worker")? {
            Some(status) if status.success() => Ok(Some(WorkerOutcome::Success)),
            Some(status) => Ok(Some(WorkerOutcome::Failure {
                code: status.code(),
                detail: match status.code() {
                    Some(code) => format!("worker exited with code {code}"),
                    None => "worker killed by signal".to_string(),
                },
            })),
            None if self.started.elapsed() >= self.max_runtime => {
                let _ = self.child.kill();
                let _ = self.child.wait();
                Ok(Some(WorkerOutcome::Timeout))
            }
            None => Ok(None),
        }
    }
}

/// Task prompt handed to a worker for a message.
pub fn message_prompt(message: &Message) -> String {
    let reply_to = message
        .reply_to_cell
        .as_deref()
        .unwrap_or(&message.from_cell);
    format!(
        "You are the `{cell}` cell, running unattended.\n\
         Message #{id} from {from}: {subject}\n\n\
         {body}\n\n\
         When done, report back with: colony send --from {cell} --to {reply_to} --subject \"re: {subject}\" --body \"<summary>\"\n",
        cell = message.to_cell,
        id = message.id,
        from = message.from_cell,
        subject = message.subject,
        body = message.body.trim(),
    )
}

pub fn heartbeat_prompt(cell: &str) -> String {
    format!(
        "You are the `{cell}` cell, woken for a scheduled heartbeat.\n\
         Run your self-checks, review `colony inbox {cell}`, and exit when there is nothing to do.\n"
    )
}
