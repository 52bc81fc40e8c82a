//! An [`Executor`] that records invocations instead of spawning processes.

use std::sync::{Arc, Mutex};

use berth_core::BoxFuture;
use berth_core::executor::{CommandSpec, ExecError, ExecOutcome, Executor};

/// Records every [`CommandSpec`] it is asked to run.
///
/// By default each command "succeeds" with exit code 0; [`failing`](Self::failing)
/// makes every command report a non-zero exit instead.
#[derive(Debug, Clone, Default)]
pub struct RecordingExecutor {
    calls: Arc<Mutex<Vec<CommandSpec>>>,
    exit_code: i32,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor whose commands all exit with `code`.
    pub fn failing(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    /// Commands run so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Argument vectors of the commands run so far.
    pub fn argv(&self) -> Vec<Vec<String>> {
        self.calls().into_iter().map(|spec| spec.args).collect()
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, spec: CommandSpec) -> BoxFuture<'_, Result<ExecOutcome, ExecError>> {
        Box::pin(async move {
            tracing::debug!(command = %spec, "recording runtime command");
            let program = spec.program.clone();
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(spec);
            }

            if self.exit_code != 0 {
                return Err(ExecError::Failed {
                    program,
                    code: self.exit_code,
                });
            }
            Ok(ExecOutcome {
                code: 0,
                stdout_bytes: 0,
                stderr_bytes: 0,
            })
        })
    }
}
