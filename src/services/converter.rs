//! Supervision of the external document converter.
//!
//! The converter is a black box invoked as
//! `<program> [args...] <input_file> <output_dir>`. Its stdout and stderr are
//! read line by line and classified into progress payloads with a best-effort
//! heuristic: the converter's output is human-readable text, not a protocol.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::models::progress::ProgressPayload;
use crate::services::storage::content_type_for;

/// Number of trailing stderr lines kept for failure messages.
const STDERR_TAIL_LINES: usize = 20;

static PERCENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^\d.])(\d{1,3}(?:\.\d+)?)\s?%").expect("valid regex")
});

static VALIDATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bvalidation\b.*\b(passed|succeeded|successful|ok)\b").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// A regular file the converter wrote under the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOutput {
    /// Path relative to the output directory, `/`-separated.
    pub name: String,
    pub path: PathBuf,
    pub content_type: String,
    pub size: u64,
}

#[derive(Debug)]
pub struct RunResult {
    pub exit_code: i32,
    pub outputs: Vec<CollectedOutput>,
}

/// Spawns one converter process per call. Holds no per-run state, so a single
/// runner serves any number of concurrent jobs.
#[derive(Debug, Clone)]
pub struct ConverterRunner {
    program: String,
    args: Vec<String>,
}

impl ConverterRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the converter to completion.
    ///
    /// Every output line is classified and handed to `on_event` in the order
    /// it was read; stdout order is preserved. The child is killed if the
    /// returned future is dropped before it finishes.
    pub async fn run(
        &self,
        input: &Path,
        output_dir: &Path,
        on_event: &(dyn Fn(ProgressPayload) + Send + Sync),
    ) -> Result<RunResult, ConverterError> {
        tokio::fs::create_dir_all(output_dir).await?;

        tracing::debug!(program = %self.program, input = %input.display(), "Spawning converter");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(input)
            .arg(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConverterError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(ConverterError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ConverterError::MissingPipe("stderr"))?;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let stdout_reader = tokio::spawn(forward_lines(StreamKind::Stdout, stdout, line_tx.clone()));
        let stderr_reader = tokio::spawn(forward_lines(StreamKind::Stderr, stderr, line_tx));

        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Some((stream, line)) = line_rx.recv().await {
            if stream == StreamKind::Stderr {
                if stderr_tail.len() == STDERR_TAIL_LINES {
                    stderr_tail.pop_front();
                }
                stderr_tail.push_back(line.clone());
            }
            on_event(classify_line(stream, line));
        }
        let _ = stdout_reader.await;
        let _ = stderr_reader.await;

        let status = child.wait().await?;
        let exit_code = exit_code_of(&status);

        if exit_code != 0 {
            return Err(ConverterError::Failed {
                exit_code,
                stderr_tail: Vec::from(stderr_tail).join("\n"),
            });
        }

        let outputs = collect_outputs(output_dir.to_path_buf()).await?;
        if outputs.is_empty() {
            return Err(ConverterError::EmptyOutput);
        }

        tracing::debug!(program = %self.program, outputs = outputs.len(), "Converter finished");
        Ok(RunResult { exit_code, outputs })
    }
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // Shell convention for signal deaths: 128 + signal number.
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Read `reader` to EOF, sending each non-empty line. Carriage returns split
/// lines too, so progress bars that redraw in place still produce events.
async fn forward_lines<R>(stream: StreamKind, reader: R, tx: mpsc::UnboundedSender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                for segment in text.split(['\r', '\n']) {
                    if segment.trim().is_empty() {
                        continue;
                    }
                    if tx.send((stream, segment.to_string())).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(?stream, error = %e, "Converter output stream closed");
                break;
            }
        }
    }
}

/// Classify one line of converter output.
fn classify_line(stream: StreamKind, line: String) -> ProgressPayload {
    if stream == StreamKind::Stderr {
        return ProgressPayload::Error(line);
    }

    if let Some(value) = PERCENT_RE
        .captures(&line)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .filter(|value| (0.0..=100.0).contains(value))
    {
        return ProgressPayload::Percentage(value);
    }

    if VALIDATION_RE.is_match(&line) {
        return ProgressPayload::Validation(line);
    }

    ProgressPayload::ProgressText(line)
}

/// Recursively list regular files under `dir`, flattened and sorted by path.
async fn collect_outputs(dir: PathBuf) -> Result<Vec<CollectedOutput>, ConverterError> {
    tokio::task::spawn_blocking(move || {
        let mut outputs = Vec::new();
        for entry in walkdir::WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(|e| ConverterError::Collect(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&dir)
                .map_err(|e| ConverterError::Collect(e.to_string()))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry
                .metadata()
                .map_err(|e| ConverterError::Collect(e.to_string()))?
                .len();
            outputs.push(CollectedOutput {
                content_type: content_type_for(&name),
                name,
                path: entry.into_path(),
                size,
            });
        }
        Ok(outputs)
    })
    .await
    .map_err(|e| ConverterError::Collect(e.to_string()))?
}

#[derive(Debug, thiserror::Error)]
pub enum ConverterError {
    #[error("failed to start converter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("converter exited with code {exit_code}: {stderr_tail}")]
    Failed { exit_code: i32, stderr_tail: String },

    #[error("converter reported success but produced no output files")]
    EmptyOutput,

    #[error("converter {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("failed to collect converter outputs: {0}")]
    Collect(String),

    #[error("converter I/O error: {0}")]
    Io(#[from] std::io::Error),
}
