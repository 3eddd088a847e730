//! External collector process wrapper -- spawn, stream stdout as progress,
//! kill on cancellation.

use std::path::PathBuf;
use std::process::Stdio;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{Worker, WorkerContext, WorkerOutcome};
use crate::events::EventKind;
use crate::scheduler::RunParameters;

/// How to launch the collector program.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandWorkerConfig {
    /// Executable to run.
    pub program: String,
    /// Arguments placed before the generated `--count/--output/--headless` flags.
    pub args: Vec<String>,
    /// Working directory for the child, if different from ours.
    pub working_dir: Option<PathBuf>,
    /// Where result files are written.
    pub output_dir: PathBuf,
    /// Result file name prefix; the timestamp and `.csv` are appended.
    pub file_prefix: String,
}

impl Default for CommandWorkerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["scraper_only.py".to_string()],
            working_dir: None,
            output_dir: PathBuf::from("data/hotdata"),
            file_prefix: "iqiyi_".to_string(),
        }
    }
}

/// Runs the collector as a child process, one process per run.
pub struct CommandWorker {
    config: CommandWorkerConfig,
}

impl CommandWorker {
    pub fn new(config: CommandWorkerConfig) -> Self {
        Self { config }
    }
}

/// Result file name for a run started at `at`, e.g. `iqiyi_20240501_093000.csv`.
pub fn artifact_name(prefix: &str, at: DateTime<Local>) -> String {
    format!("{}{}.csv", prefix, at.format("%Y%m%d_%H%M%S"))
}

/// Map a collector stdout line to an event kind and message.
fn classify_line(line: &str) -> Option<(EventKind, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    for (prefix, kind) in [("error:", EventKind::Error), ("done:", EventKind::Success)] {
        // `get` keeps multi-byte lines from splitting mid-character.
        if let Some(head) = line.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                return Some((kind, line[prefix.len()..].trim_start()));
            }
        }
    }
    Some((EventKind::Info, line))
}

/// Line reader over a child pipe that tolerates bytes which are not UTF-8.
struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line with invalid sequences replaced by U+FFFD. `None` at end of
    /// stream or on a read error.
    ///
    /// Cancel safe: bytes of a partially read line stay buffered for the next call.
    async fn next_line(&mut self) -> Option<String> {
        let line = match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => return None,
            Ok(_) => String::from_utf8_lossy(&self.buf)
                .trim_end_matches(['\n', '\r'])
                .to_string(),
            Err(e) => {
                warn!("collector output unreadable: {}", e);
                return None;
            }
        };
        self.buf.clear();
        Some(line)
    }
}

async fn next_line(lines: &mut Option<LossyLines<ChildStdout>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => None,
    }
}

#[async_trait::async_trait]
impl Worker for CommandWorker {
    async fn invoke(&self, params: RunParameters, ctx: WorkerContext) -> WorkerOutcome {
        if ctx.is_cancelled() {
            return WorkerOutcome::Cancelled;
        }

        let filename = artifact_name(&self.config.file_prefix, Local::now());
        let output = self.config.output_dir.join(&filename);
        if let Err(e) = tokio::fs::create_dir_all(&self.config.output_dir).await {
            return WorkerOutcome::Failed {
                reason: format!(
                    "cannot create output dir {}: {e}",
                    self.config.output_dir.display()
                ),
            };
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg("--count")
            .arg(params.item_count.to_string())
            .arg("--output")
            .arg(&output);
        if params.headless {
            cmd.arg("--headless");
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run_id = ctx.run_id();
        info!(%run_id, program = %self.config.program, output = %output.display(), "launching collector");
        ctx.info("launching collector");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return WorkerOutcome::Failed {
                    reason: format!("failed to launch collector '{}': {e}", self.config.program),
                }
            }
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = LossyLines::new(stderr);
                while let Some(line) = lines.next_line().await {
                    debug!(%run_id, "collector stderr: {}", line);
                }
            });
        }

        let mut stdout = child.stdout.take().map(LossyLines::new);
        let mut stdout_open = stdout.is_some();

        let status = loop {
            tokio::select! {
                _ = ctx.cancelled() => break None,
                line = next_line(&mut stdout), if stdout_open => match line {
                    Some(line) => {
                        if let Some((kind, message)) = classify_line(&line) {
                            ctx.emit(kind, message);
                        }
                    }
                    // End of stream or read error; our end of the pipe is dropped below.
                    None => stdout_open = false,
                },
                status = child.wait(), if !stdout_open => break Some(status),
            }
            if !stdout_open {
                stdout = None;
            }
        };

        let Some(status) = status else {
            info!(%run_id, "stop requested, killing collector");
            if let Err(e) = child.kill().await {
                warn!(%run_id, "failed to kill collector: {}", e);
            }
            return WorkerOutcome::Cancelled;
        };

        match status {
            Ok(status) if status.success() => {
                if tokio::fs::try_exists(&output).await.unwrap_or(false) {
                    WorkerOutcome::Succeeded {
                        summary: format!("collection finished, saved {filename}"),
                        artifact: filename,
                    }
                } else {
                    WorkerOutcome::Failed {
                        reason: "collector produced no data".to_string(),
                    }
                }
            }
            Ok(status) => WorkerOutcome::Failed {
                reason: format!("collector exited with {status}"),
            },
            Err(e) => WorkerOutcome::Failed {
                reason: format!("failed waiting for collector: {e}"),
            },
        }
    }
}
