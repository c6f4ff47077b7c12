pub mod tokio_runner;

pub use tokio_runner::TokioCommandRunner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

/// Default deadline for catalog/list subprocesses.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(60);
/// Default deadline for install subprocesses.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
/// Default deadline for uninstall subprocesses.
pub const UNINSTALL_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Spawn through the platform shell. Required on Windows when the
    /// target is a `.cmd`/`.bat` wrapper (notably `npm.cmd`).
    pub via_shell: bool,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            via_shell: false,
            timeout: LIST_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn via_shell(mut self, via_shell: bool) -> Self {
        self.via_shell = via_shell;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if self.program.as_os_str().is_empty() {
            return Err(CommandError::Spawn {
                message: "command program path must not be empty".to_string(),
            });
        }

        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(CommandError::Spawn {
                message: "command args must not contain NUL bytes".to_string(),
            });
        }

        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(CommandError::Spawn {
                message: "environment keys and values must be non-empty and must not contain NUL bytes"
                    .to_string(),
            });
        }

        if self.timeout.is_zero() {
            return Err(CommandError::Spawn {
                message: "timeout must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandError {
    /// The binary is missing from PATH. `advice` names the absent ecosystem
    /// so the caller can tell the user what to install.
    NotFound { program: String, advice: String },
    /// Deadline exceeded. The child has been terminated; whatever output it
    /// produced before the deadline is carried along.
    Timeout {
        elapsed: Duration,
        stdout: String,
        stderr: String,
    },
    /// Any other OS-level spawn or wait failure.
    Spawn { message: String },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::NotFound { program, advice } => {
                write!(f, "'{program}' not found in PATH. {advice}")
            }
            CommandError::Timeout { elapsed, .. } => {
                write!(f, "command timed out after {}s", elapsed.as_secs())
            }
            CommandError::Spawn { message } => write!(f, "failed to run command: {message}"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Runs an external program to completion with a deadline, capturing
/// stdout, stderr and the exit code.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Install advice shown when a manager binary is absent, keyed by program
/// name.
pub fn missing_binary_advice(program: &str) -> String {
    match program {
        "winget" => {
            "WinGet ships with Windows 11; on Windows 10 install App Installer from the Microsoft Store.".to_string()
        }
        "choco" => "Install Chocolatey from https://chocolatey.org/install.".to_string(),
        "scoop" => "Install Scoop from https://scoop.sh.".to_string(),
        "npm" => "Install Node.js (which includes npm) from https://nodejs.org.".to_string(),
        "cargo" => "Install the Rust toolchain from https://rustup.rs.".to_string(),
        other => format!("Install '{other}' and make sure it is on PATH."),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CommandError, CommandSpec, missing_binary_advice};

    #[test]
    fn builder_collects_args_in_order() {
        let spec = CommandSpec::new("winget")
            .args(["install", "--id"])
            .arg("Microsoft.VisualStudioCode")
            .timeout(Duration::from_secs(300));
        assert_eq!(
            spec.args,
            vec!["install", "--id", "Microsoft.VisualStudioCode"]
        );
        assert_eq!(spec.timeout, Duration::from_secs(300));
        assert!(!spec.via_shell);
    }

    #[test]
    fn validate_rejects_empty_program_and_zero_timeout() {
        assert!(CommandSpec::new("").validate().is_err());
        assert!(
            CommandSpec::new("choco")
                .timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(CommandSpec::new("choco").validate().is_ok());
    }

    #[test]
    fn validate_rejects_nul_bytes() {
        let spec = CommandSpec::new("npm").arg("bad\0arg");
        assert!(matches!(
            spec.validate(),
            Err(CommandError::Spawn { .. })
        ));
    }

    #[test]
    fn advice_names_the_absent_ecosystem() {
        assert!(missing_binary_advice("choco").contains("chocolatey.org"));
        assert!(missing_binary_advice("cargo").contains("rustup"));
        assert!(missing_binary_advice("weird-tool").contains("weird-tool"));
    }
}
