use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::execution::{
    CommandError, CommandOutput, CommandRunner, CommandSpec, missing_binary_advice,
};

/// Tokio-backed command runner. The child is always spawned with piped
/// stdout/stderr and a null stdin; on timeout the whole process group is
/// killed and partial output is returned with the error.
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        spec.validate()?;

        let program_display = spec.program.to_string_lossy().to_string();
        let mut cmd = build_command(&spec);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the in-flight future (stream cancellation) must not
        // orphan the child.
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program = %program_display, args = ?spec.args, "spawning command");

        let child = cmd.spawn().map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                CommandError::NotFound {
                    advice: missing_binary_advice(&program_display),
                    program: program_display.clone(),
                }
            } else {
                CommandError::Spawn {
                    message: format!("failed to spawn '{program_display}': {error}"),
                }
            }
        })?;

        let pid = child.id();
        let started = Instant::now();

        // wait_with_output() consumes the child. On timeout the future (and
        // with it the child handle) is dropped; the stored pid is used to
        // kill the process group.
        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(error)) => Err(CommandError::Spawn {
                message: format!("failed to wait for '{program_display}': {error}"),
            }),
            Err(_) => {
                kill_by_pid(pid);
                Err(CommandError::Timeout {
                    elapsed: started.elapsed(),
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }
    }
}

fn build_command(spec: &CommandSpec) -> tokio::process::Command {
    let mut cmd = if spec.via_shell && cfg!(windows) {
        // .cmd/.bat wrappers cannot be CreateProcess'd directly; route
        // through cmd.exe with the arguments still as discrete argv entries.
        let mut shell = tokio::process::Command::new("cmd");
        shell.arg("/C");
        shell.arg(&spec.program);
        shell.args(&spec.args);
        shell
    } else {
        let mut direct = tokio::process::Command::new(&spec.program);
        direct.args(&spec.args);
        direct
    };

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

#[cfg(unix)]
fn kill_by_pid(pid: Option<u32>) {
    if let Some(pid) = pid {
        let pgid = -(pid as libc::pid_t);
        unsafe {
            libc::kill(pgid, libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
fn kill_by_pid(pid: Option<u32>) {
    if let Some(pid) = pid {
        // taskkill tears down the whole child tree, which matters for the
        // cmd.exe wrapper case.
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_by_pid(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TokioCommandRunner;
    use crate::execution::{CommandError, CommandRunner, CommandSpec};

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = TokioCommandRunner;
        let output = runner
            .run(CommandSpec::new("echo").arg("hello"))
            .await
            .expect("echo should run");
        assert_eq!(output.code, 0);
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn missing_binary_maps_to_not_found_with_advice() {
        let runner = TokioCommandRunner;
        let error = runner
            .run(CommandSpec::new("definitely-not-a-real-binary-ae41"))
            .await
            .expect_err("binary does not exist");
        match error {
            CommandError::NotFound { program, advice } => {
                assert_eq!(program, "definitely-not-a-real-binary-ae41");
                assert!(!advice.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_kills_the_child() {
        let runner = TokioCommandRunner;
        let started = std::time::Instant::now();
        let error = runner
            .run(
                CommandSpec::new("sleep")
                    .arg("30")
                    .timeout(Duration::from_millis(200)),
            )
            .await
            .expect_err("sleep must exceed the deadline");
        assert!(matches!(error, CommandError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
