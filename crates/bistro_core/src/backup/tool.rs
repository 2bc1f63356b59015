//! External process seam for dump and restore tools.

use crate::error::{CoreError, CoreResult};
use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// A command line to run, with extra environment variables.
///
/// Credentials belong in `env`, never in `args`. `Debug` output redacts
/// environment values.
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<OsString>,
    /// Variables added to the child environment.
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Starts an invocation of `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Arguments as lossy strings, for logging and tests.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env: Vec<String> = self.env.iter().map(|(k, _)| format!("{k}=***")).collect();
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args_lossy())
            .field("env", &env)
            .finish()
    }
}

/// What a finished process left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` if the process was killed by a signal.
    pub status: Option<i32>,
    /// Combined stdout and stderr, line by line, in arrival order.
    pub lines: Vec<String>,
}

impl ToolOutput {
    /// Returns true for exit code 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Converts a non-zero exit into [`CoreError::ToolFailed`].
    pub fn check(self, program: &str) -> CoreResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(CoreError::ToolFailed {
                program: program.to_string(),
                code: self.status,
                output: self.lines,
            })
        }
    }
}

/// Runs external tools.
pub trait ToolRunner: Send + Sync {
    /// Runs `invocation` to completion, killing it after `timeout`.
    ///
    /// Fails with [`CoreError::ToolMissing`] if the program cannot be
    /// started and [`CoreError::ToolTimeout`] if it overruns. A non-zero
    /// exit is not an error at this level.
    fn run(&self, invocation: &Invocation, timeout: Duration) -> CoreResult<ToolOutput>;
}

/// [`ToolRunner`] that spawns real child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    poll_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ProcessRunner {
    /// Creates a runner with the default poll interval.
    pub fn new() -> Self {
        Self::default()
    }

    fn pump(
        source: impl Read + Send + 'static,
        tx: mpsc::Sender<String>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for line in BufReader::new(source).split(b'\n') {
                let Ok(line) = line else { break };
                let line = String::from_utf8_lossy(&line).trim_end().to_string();
                tracing::debug!(target: "bistro::tool", "{line}");
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
    }

    fn wait(&self, child: &mut Child, program: &str, timeout: Duration) -> CoreResult<Option<i32>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status.code());
            }
            if Instant::now() >= deadline {
                tracing::error!(program, ?timeout, "external tool timed out, killing it");
                if let Err(e) = child.kill() {
                    tracing::warn!(program, error = %e, "kill failed");
                }
                child.wait()?;
                return Err(CoreError::ToolTimeout {
                    program: program.to_string(),
                    timeout,
                });
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation, timeout: Duration) -> CoreResult<ToolOutput> {
        tracing::info!(
            program = %invocation.program,
            args = ?invocation.args_lossy(),
            "running external tool"
        );
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => CoreError::ToolMissing {
                program: invocation.program.clone(),
            },
            _ => CoreError::Io(e),
        })?;

        let (tx, rx) = mpsc::channel();
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(Self::pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(Self::pump(stderr, tx.clone()));
        }
        drop(tx);

        let status = self.wait(&mut child, &invocation.program, timeout);
        for pump in pumps {
            if pump.join().is_err() {
                tracing::warn!(program = %invocation.program, "output reader panicked");
            }
        }
        let lines: Vec<String> = rx.try_iter().collect();
        let status = status?;
        tracing::info!(
            program = %invocation.program,
            ?status,
            lines = lines.len(),
            "external tool finished"
        );
        Ok(ToolOutput { status, lines })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_environment() {
        let inv = Invocation::new("pg_dump")
            .arg("--verbose")
            .env("PGPASSWORD", "hunter2");
        let shown = format!("{inv:?}");
        assert!(shown.contains("PGPASSWORD=***"));
        assert!(!shown.contains("hunter2"));
        assert_eq!(inv.args_lossy(), ["--verbose"]);
    }

    #[test]
    fn missing_program_is_tool_missing() {
        let err = ProcessRunner::new()
            .run(
                &Invocation::new("bistro-definitely-not-installed"),
                Duration::from_secs(5),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::ToolMissing { .. }));
    }

    #[test]
    fn non_zero_exit_is_reported_by_check() {
        let output = ToolOutput {
            status: Some(2),
            lines: vec!["bad".into()],
        };
        let err = output.check("psql").unwrap_err();
        assert_eq!(err.tool_output(), ["bad".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn captures_both_streams() {
        let out = ProcessRunner::new()
            .run(
                &Invocation::new("sh")
                    .arg("-c")
                    .arg("echo out; echo err 1>&2; echo \"$BISTRO_X\"; exit 3")
                    .env("BISTRO_X", "from-env"),
                Duration::from_secs(10),
            )
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert!(out.lines.contains(&"out".to_string()));
        assert!(out.lines.contains(&"err".to_string()));
        assert!(out.lines.contains(&"from-env".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn overrunning_tool_is_killed() {
        let started = Instant::now();
        let err = ProcessRunner::new()
            .run(
                &Invocation::new("sleep").arg("30"),
                Duration::from_millis(200),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::ToolTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
