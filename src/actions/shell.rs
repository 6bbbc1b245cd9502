//! Built-in shell action.
//!
//! Resolves `run:` expressions, executes the command through the host's
//! shell capability (falling back to [`ProcessShell`]), and captures output
//! to state or to a file. Subprocesses run in their own process group and
//! are terminated with SIGTERM, then SIGKILL after a grace period, on
//! timeout or cancellation.

use crate::actions::{
    Action, ActionResult, CancellationToken, ExecutionContext, ShellCapability, ShellOutput,
    ShellRequest, StepOutcome,
};
use crate::error::{io_error, WorkflowError};
use crate::evaluator::{stringify, Evaluator};
use crate::schema::{CaptureMode, StepConfig};
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct ShellAction;

impl Action for ShellAction {
    fn action_type(&self) -> &str {
        "shell"
    }

    fn reads(&self) -> &[&str] {
        &["inputs", "env", "steps", "loop"]
    }

    fn execute(
        &self,
        step: &StepConfig,
        context: &Map<String, Value>,
        exec: &ExecutionContext,
    ) -> Result<ActionResult, WorkflowError> {
        let Some(run) = &step.run else {
            return Ok(ActionResult::failure(
                "shell action requires a `run` command",
                "validation",
            ));
        };

        let mut evaluator = Evaluator::new(context.clone());
        if let Some(workspace) = &exec.workspace {
            evaluator = evaluator.with_workspace(workspace.clone());
        }
        let command = stringify(&evaluator.resolve(run)?);

        let mut env = Vec::new();
        for (key, value) in &step.env {
            let resolved = evaluator.resolve_all(value)?;
            env.push((key.clone(), stringify(&resolved)));
        }

        // The runtime folds the step timeout and the remaining workflow
        // budget into `exec.step_timeout`; the raw step value is only a
        // fallback for direct invocation.
        let timeout = exec
            .step_timeout
            .or_else(|| step.timeout.map(Duration::from_secs_f64));
        let request = ShellRequest {
            command,
            env,
            cwd: exec.workspace.clone(),
            timeout,
        };

        let output = match &exec.shell {
            Some(shell) => shell.run(&request, &exec.cancel)?,
            None => ProcessShell.run(&request, &exec.cancel)?,
        };

        if output.timed_out {
            let mut result = ActionResult::failure(
                format!(
                    "command timed out after {}s",
                    timeout.map(|t| t.as_secs()).unwrap_or_default()
                ),
                "timeout",
            );
            result.outputs.insert("stderr".to_string(), json!(output.stderr));
            return Ok(result);
        }

        let mut outputs = Map::new();
        outputs.insert("exit_code".to_string(), json!(output.exit_code));
        outputs.insert("stderr".to_string(), json!(output.stderr));
        match step.capture_mode {
            Some(CaptureMode::File) => {
                let path = std::env::temp_dir().join(format!(
                    "step_output_{}_{}.log",
                    step.id.as_ref().map(|id| id.as_str()).unwrap_or("step"),
                    std::process::id(),
                ));
                fs::write(&path, output.stdout.as_bytes())
                    .map_err(|err| io_error(&path, err))?;
                outputs.insert("stdout_file".to_string(), json!(path.display().to_string()));
                outputs.insert("bytes_written".to_string(), json!(output.stdout.len()));
            }
            _ => {
                outputs.insert("stdout".to_string(), json!(output.stdout));
            }
        }

        if output.exit_code != 0 {
            return Ok(ActionResult {
                outputs,
                outcome: StepOutcome::Failure,
                error: Some(format!("command exited with status {}", output.exit_code)),
                error_type: Some("subprocess".to_string()),
                next_hint: None,
            });
        }
        Ok(ActionResult::success(outputs))
    }
}

/// Default shell capability: `sh -c` in a fresh process group.
pub struct ProcessShell;

impl ShellCapability for ProcessShell {
    fn run(
        &self,
        request: &ShellRequest,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, WorkflowError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &request.env {
            command.env(key, value);
        }
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        new_process_group(&mut command);

        let mut child = command.spawn().map_err(|err| WorkflowError::ActionFailed {
            step_id: "shell".to_string(),
            kind: "subprocess".to_string(),
            message: format!("failed to spawn `sh`: {err}"),
        })?;

        // Drain pipes on threads so a chatty child cannot deadlock on a
        // full pipe buffer while we poll for exit.
        let stdout_handle = drain_thread(child.stdout.take());
        let stderr_handle = drain_thread(child.stderr.take());

        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);
        let mut timed_out = false;
        let exit_code = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code().unwrap_or(-1),
                Ok(None) => {}
                Err(err) => {
                    kill_process_group(&mut child);
                    return Err(WorkflowError::ActionFailed {
                        step_id: "shell".to_string(),
                        kind: "subprocess".to_string(),
                        message: format!("failed to wait for child: {err}"),
                    });
                }
            }
            if cancel.is_cancelled() {
                kill_process_group(&mut child);
                let _ = child.wait();
                return Err(WorkflowError::Interrupted);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    timed_out = true;
                    kill_process_group(&mut child);
                    let _ = child.wait();
                    break -1;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout_handle
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let stderr = stderr_handle
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        Ok(ShellOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

fn drain_thread<R: Read + Send + 'static>(
    source: Option<R>,
) -> Option<std::thread::JoinHandle<String>> {
    source.map(|mut reader| {
        std::thread::spawn(move || {
            let mut buffer = String::new();
            let _ = reader.read_to_string(&mut buffer);
            buffer
        })
    })
}

#[cfg(unix)]
fn new_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // Safety: setsid is async-signal-safe and called before exec.
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn new_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
    let deadline = Instant::now() + KILL_GRACE_PERIOD;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}
