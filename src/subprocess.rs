//! Short-lived helper commands with a hard time bound.

use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::error::ExitError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Builder for a helper invocation. Every run is bounded: past the timeout
/// the child is killed and `ExitError::Timeout` returned.
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Tool {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| (*s).to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn run(&self) -> anyhow::Result<RunOutput> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ExitError::ToolNotFound {
                        tool: self.program.clone(),
                    }
                    .into()
                } else {
                    anyhow::Error::new(e).context(format!("spawning {}", self.program))
                }
            })?;
        let output = self.wait_bounded(child)?;
        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        })
    }

    fn wait_bounded(&self, mut child: Child) -> anyhow::Result<Output> {
        let start = Instant::now();
        while child
            .try_wait()
            .with_context(|| format!("waiting for {}", self.program))?
            .is_none()
        {
            if start.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExitError::Timeout {
                    tool: self.program.clone(),
                    timeout_secs: self.timeout.as_secs(),
                }
                .into());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        child
            .wait_with_output()
            .with_context(|| format!("collecting output of {}", self.program))
    }
}

/// Whether a process with this pid exists, via `kill -0`.
pub fn is_process_alive(pid: u32) -> bool {
    // kill -0 0 would probe our own process group
    if pid == 0 {
        return false;
    }
    Tool::new("kill")
        .args(&["-0", &pid.to_string()])
        .timeout(Duration::from_secs(5))
        .run()
        .is_ok_and(|out| out.success())
}
