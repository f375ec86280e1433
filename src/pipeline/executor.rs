//! Stage execution: the external unit of work behind a stage.
//!
//! The state machine only knows the [`StageExecutor`] trait. The shell
//! implementation runs the configured command, streams its output to a log,
//! refreshes the heartbeat on every line of output and enforces a timeout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use crate::heartbeat::HeartbeatPulse;

/// Lines of output kept for error messages.
const TAIL_LINES: usize = 20;

/// One iteration of one stage.
#[derive(Debug, Clone)]
pub struct StageRequest<'a> {
    pub job_id: &'a str,
    pub stage: &'a str,
    pub iteration: u32,
    pub goal: &'a str,
    pub model: &'a str,
    pub branch: &'a str,
    pub command: &'a str,
    pub test_command: Option<&'a str>,
    pub workdir: &'a Path,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationOutcome {
    /// `None` when the process was killed or timed out
    pub exit_code: Option<i32>,
    pub tests_passing: bool,
    pub timed_out: bool,
    pub output_tail: Vec<String>,
}

impl IterationOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.tests_passing
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn run(&self, request: &StageRequest<'_>, pulse: &HeartbeatPulse)
    -> Result<IterationOutcome>;
}

/// Runs stage commands through `sh -c`.
pub struct ShellStageExecutor {
    timeout: Duration,
    log_dir: Option<PathBuf>,
}

struct CommandRun {
    exit_code: Option<i32>,
    timed_out: bool,
    tail: Vec<String>,
}

impl ShellStageExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            log_dir: None,
        }
    }

    /// Append each iteration's output to `<dir>/<job>/<stage>-<iteration>.log`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    fn log_file(&self, request: &StageRequest<'_>) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| {
            dir.join(request.job_id)
                .join(format!("{}-{}.log", request.stage, request.iteration))
        })
    }

    async fn run_command(
        &self,
        command: &str,
        request: &StageRequest<'_>,
        pulse: &HeartbeatPulse,
        log: &mut Option<tokio::fs::File>,
    ) -> Result<CommandRun> {
        tracing::debug!(stage = request.stage, iteration = request.iteration, command, "spawning stage command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CONVOY_JOB_ID", request.job_id)
            .env("CONVOY_STAGE", request.stage)
            .env("CONVOY_ITERATION", request.iteration.to_string())
            .env("CONVOY_GOAL", request.goal)
            .env("CONVOY_MODEL", request.model)
            .env("CONVOY_BRANCH", request.branch)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn stage command: {}", command))?;

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let stderr = child.stderr.take().context("Failed to get stderr")?;

        let stream = async {
            let mut out = BufReader::new(stdout);
            let mut err = BufReader::new(stderr);
            // read_until keeps partial reads in the buffer if the other branch wins
            let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
            let (mut out_done, mut err_done) = (false, false);
            let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

            while !(out_done && err_done) {
                let line = tokio::select! {
                    n = out.read_until(b'\n', &mut out_buf), if !out_done => take_line(n?, &mut out_buf, &mut out_done),
                    n = err.read_until(b'\n', &mut err_buf), if !err_done => take_line(n?, &mut err_buf, &mut err_done),
                };
                let Some(line) = line else { continue };
                pulse.beat(&line);
                if let Some(file) = log.as_mut() {
                    file.write_all(line.as_bytes()).await?;
                    file.write_all(b"\n").await?;
                }
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, tail))
        };

        let result = timeout(self.timeout, stream).await;
        match result {
            Ok(result) => {
                let (status, tail) = result.context("Failed while streaming stage output")?;
                Ok(CommandRun {
                    exit_code: status.code(),
                    timed_out: false,
                    tail: tail.into(),
                })
            }
            Err(_) => {
                tracing::warn!(
                    stage = request.stage,
                    iteration = request.iteration,
                    timeout_secs = self.timeout.as_secs(),
                    "stage command timed out"
                );
                let _ = child.kill().await;
                Ok(CommandRun {
                    exit_code: None,
                    timed_out: true,
                    tail: vec![format!("timed out after {}s", self.timeout.as_secs())],
                })
            }
        }
    }
}

/// One complete output line, decoded lossily. `None` once the stream hits EOF.
fn take_line(read: usize, buf: &mut Vec<u8>, done: &mut bool) -> Option<String> {
    if read == 0 {
        *done = true;
        return None;
    }
    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(['\n', '\r'])
        .to_string();
    buf.clear();
    Some(line)
}

#[async_trait]
impl StageExecutor for ShellStageExecutor {
    async fn run(
        &self,
        request: &StageRequest<'_>,
        pulse: &HeartbeatPulse,
    ) -> Result<IterationOutcome> {
        let mut log = match self.log_file(request) {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Some(
                    tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                )
            }
            None => None,
        };

        pulse.force(&format!("running {}", request.command));
        let main = self.run_command(request.command, request, pulse, &mut log).await?;
        if main.timed_out || main.exit_code != Some(0) {
            return Ok(IterationOutcome {
                exit_code: main.exit_code,
                tests_passing: false,
                timed_out: main.timed_out,
                output_tail: main.tail,
            });
        }

        let Some(test_command) = request.test_command else {
            return Ok(IterationOutcome {
                exit_code: main.exit_code,
                tests_passing: true,
                timed_out: false,
                output_tail: main.tail,
            });
        };

        pulse.force(&format!("testing with {}", test_command));
        let tests = self.run_command(test_command, request, pulse, &mut log).await?;
        Ok(IterationOutcome {
            exit_code: main.exit_code,
            tests_passing: tests.exit_code == Some(0),
            timed_out: tests.timed_out,
            output_tail: tests.tail,
        })
    }
}
