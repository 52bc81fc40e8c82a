//! External runtime process execution.
//!
//! Runs one [`CommandSpec`] and relays its stdout/stderr live, chunk by chunk,
//! to the gateway's own output streams. The outcome is only reported once both
//! streams are fully drained.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::BoxFuture;

/// Read size for the output relay loops.
const RELAY_CHUNK: usize = 8 * 1024;

/// One external runtime invocation: program plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Errors from running an external program.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("output relay for {program} failed: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with status {code}")]
    Failed { program: String, code: i32 },

    #[error("runtime program {program} is unavailable: {reason}")]
    Unavailable { program: String, reason: String },
}

/// Result of a completed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    pub code: i32,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// Something that can run a [`CommandSpec`].
pub trait Executor: Send + Sync {
    /// Run the command to completion.
    fn execute(&self, spec: CommandSpec) -> BoxFuture<'_, Result<ExecOutcome, ExecError>>;
}

/// In-memory output buffer shared between a sink and its reader.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().map(|buf| buf.clone()).unwrap_or_default()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    fn extend(&self, chunk: &[u8]) {
        if let Ok(mut buf) = self.0.lock() {
            buf.extend_from_slice(chunk);
        }
    }
}

/// Where a child's output stream is relayed.
#[derive(Debug, Clone)]
pub enum OutputSink {
    /// The gateway's own stdout.
    Stdout,
    /// The gateway's own stderr.
    Stderr,
    /// An in-memory buffer.
    Capture(CaptureBuffer),
}

impl OutputSink {
    async fn write_chunk(&self, chunk: &[u8]) -> std::io::Result<()> {
        match self {
            OutputSink::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(chunk).await?;
                out.flush().await
            }
            OutputSink::Stderr => {
                let mut err = tokio::io::stderr();
                err.write_all(chunk).await?;
                err.flush().await
            }
            OutputSink::Capture(buf) => {
                buf.extend(chunk);
                Ok(())
            }
        }
    }
}

async fn relay<R: AsyncRead + Unpin>(mut source: R, sink: &OutputSink) -> std::io::Result<u64> {
    let mut buf = vec![0u8; RELAY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        sink.write_chunk(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Runs commands as child processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    stdout: OutputSink,
    stderr: OutputSink,
}

impl ProcessExecutor {
    /// Relay child output to the gateway's own stdout/stderr.
    pub fn new() -> Self {
        Self {
            stdout: OutputSink::Stdout,
            stderr: OutputSink::Stderr,
        }
    }

    /// Relay child output to custom sinks.
    pub fn with_sinks(stdout: OutputSink, stderr: OutputSink) -> Self {
        Self { stdout, stderr }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ProcessExecutor {
    fn execute(&self, spec: CommandSpec) -> BoxFuture<'_, Result<ExecOutcome, ExecError>> {
        Box::pin(async move {
            tracing::info!(command = %spec, "running external runtime");

            let program = spec.program.clone();
            let mut child = tokio::process::Command::new(&spec.program)
                .args(&spec.args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| ExecError::Spawn {
                    program: program.clone(),
                    source,
                })?;

            let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
                return Err(ExecError::Spawn {
                    program,
                    source: std::io::Error::other("output pipes unavailable"),
                });
            };

            let (stdout_bytes, stderr_bytes) =
                tokio::try_join!(relay(stdout, &self.stdout), relay(stderr, &self.stderr))
                    .map_err(|source| ExecError::Io {
                        program: program.clone(),
                        source,
                    })?;

            let status = child.wait().await.map_err(|source| ExecError::Io {
                program: program.clone(),
                source,
            })?;

            let code = status.code().unwrap_or(-1);
            tracing::debug!(
                command = %spec,
                code,
                stdout_bytes,
                stderr_bytes,
                "external runtime finished"
            );

            if !status.success() {
                return Err(ExecError::Failed { program, code });
            }

            Ok(ExecOutcome {
                code,
                stdout_bytes,
                stderr_bytes,
            })
        })
    }
}

/// Resolve `program` on `PATH` (or as a path), failing if it cannot be run.
pub fn ensure_program_available(program: &str) -> Result<PathBuf, ExecError> {
    which::which(program).map_err(|e| ExecError::Unavailable {
        program: program.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn capturing() -> (ProcessExecutor, CaptureBuffer, CaptureBuffer) {
        let out = CaptureBuffer::new();
        let err = CaptureBuffer::new();
        let exec = ProcessExecutor::with_sinks(
            OutputSink::Capture(out.clone()),
            OutputSink::Capture(err.clone()),
        );
        (exec, out, err)
    }

    #[test]
    fn test_command_spec_display() {
        let spec = CommandSpec::new("rkt", ["image", "list"]);
        assert_eq!(spec.to_string(), "rkt image list");
        assert_eq!(CommandSpec::new("rkt", Vec::<String>::new()).to_string(), "rkt");
    }

    #[tokio::test]
    async fn test_relays_stdout_and_stderr() {
        let (exec, out, err) = capturing();
        let spec = CommandSpec::new("sh", ["-c", "echo hello; echo oops >&2"]);

        let outcome = exec.execute(spec).await.unwrap();
        assert_eq!(outcome.code, 0);
        assert_eq!(out.to_string_lossy(), "hello\n");
        assert_eq!(err.to_string_lossy(), "oops\n");
        assert_eq!(outcome.stdout_bytes, 6);
        assert_eq!(outcome.stderr_bytes, 5);
    }

    #[tokio::test]
    async fn test_non_zero_exit_reported_after_drain() {
        let (exec, out, _err) = capturing();
        let spec = CommandSpec::new("sh", ["-c", "echo partial; exit 3"]);

        let err = exec.execute(spec).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed { code: 3, .. }));
        assert_eq!(out.to_string_lossy(), "partial\n");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (exec, out, _err) = capturing();
        let spec = CommandSpec::new("/nonexistent/berth-runtime", ["version"]);

        let err = exec.execute(spec).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
        assert!(out.contents().is_empty());
    }

    #[tokio::test]
    async fn test_large_output_is_fully_relayed() {
        let (exec, out, _err) = capturing();
        let spec = CommandSpec::new("sh", ["-c", "head -c 100000 /dev/zero"]);

        let outcome = exec.execute(spec).await.unwrap();
        assert_eq!(outcome.stdout_bytes, 100_000);
        assert_eq!(out.contents().len(), 100_000);
    }

    #[test]
    fn test_ensure_program_available() {
        assert!(ensure_program_available("sh").is_ok());
        let err = ensure_program_available("berth-definitely-missing-binary").unwrap_err();
        assert!(matches!(err, ExecError::Unavailable { .. }));
    }
}
