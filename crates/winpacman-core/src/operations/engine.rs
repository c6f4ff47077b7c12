use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::execution::{
    CommandError, CommandRunner, CommandSpec, INSTALL_TIMEOUT, UNINSTALL_TIMEOUT,
};
use crate::models::{
    CoreError, CoreErrorKind, CoreResult, HistoryEntry, Manager, OperationEvent, OperationKind,
    OperationPhase, OperationRequest, OperationResult,
};
use crate::operations::history::HistoryLog;
use crate::registry::descriptor;

const MESSAGE_LIMIT: usize = 500;

/// Build the CLI invocation for a request. Arguments are discrete argv
/// entries throughout; only `.cmd` wrappers get routed through the shell,
/// and only on Windows.
pub fn command_for(request: &OperationRequest) -> CoreResult<CommandSpec> {
    let manager = request.manager;
    let id = request.package_id.as_str();

    let Some(program) = descriptor(manager).cli_program else {
        // Also covers installs: no spawn ever happens for an unattributed
        // record.
        return Err(CoreError::for_manager(
            manager,
            CoreErrorKind::UnattributedPackage,
            format!(
                "cannot {} '{id}': package is not attributed to a manager; resolve it first",
                request.op.as_str()
            ),
        )
        .operation(request.op));
    };

    let spec = match (manager, request.op) {
        (Manager::Winget, OperationKind::Install) => {
            let mut spec = CommandSpec::new(program).args(["install", "--id", id]);
            if let Some(version) = request.version.as_deref() {
                spec = spec.args(["--version", version]);
            }
            spec.args(["--accept-source-agreements", "--accept-package-agreements"])
        }
        (Manager::Winget, OperationKind::Uninstall) => {
            CommandSpec::new(program).args(["uninstall", "--id", id])
        }
        (Manager::Chocolatey, OperationKind::Install) => {
            CommandSpec::new(program).args(["install", id, "-y"])
        }
        (Manager::Chocolatey, OperationKind::Uninstall) => {
            CommandSpec::new(program).args(["uninstall", id, "-y"])
        }
        (Manager::Scoop, OperationKind::Install) => {
            CommandSpec::new(program).args(["install", id])
        }
        (Manager::Scoop, OperationKind::Uninstall) => {
            CommandSpec::new(program).args(["uninstall", id])
        }
        (Manager::Npm, OperationKind::Install) => {
            CommandSpec::new(program).args(["install", "-g", id])
        }
        (Manager::Npm, OperationKind::Uninstall) => {
            CommandSpec::new(program).args(["uninstall", "-g", id])
        }
        (Manager::Cargo, OperationKind::Install) => {
            CommandSpec::new(program).args(["install", id])
        }
        (Manager::Cargo, OperationKind::Uninstall) => {
            CommandSpec::new(program).args(["uninstall", id])
        }
        (Manager::MsStore | Manager::Unknown, _) => unreachable!("no cli_program above"),
    };

    let timeout = match request.op {
        OperationKind::Install => INSTALL_TIMEOUT,
        OperationKind::Uninstall => UNINSTALL_TIMEOUT,
    };

    Ok(spec
        .via_shell(descriptor(manager).cli_via_shell)
        .timeout(timeout))
}

/// Runs install/uninstall requests through the manager CLIs. Requests for
/// the same `(manager, package_id)` are serialized; different packages run
/// freely in parallel.
pub struct OperationEngine {
    runner: Arc<dyn CommandRunner>,
    history: Arc<HistoryLog>,
    locks: Mutex<HashMap<(Manager, String), Arc<tokio::sync::Mutex<()>>>>,
    on_success: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl OperationEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, history: Arc<HistoryLog>) -> Self {
        Self {
            runner,
            history,
            locks: Mutex::new(HashMap::new()),
            on_success: None,
        }
    }

    /// Hook fired after a successful operation; the facade uses it to
    /// request an installed-inventory rescan.
    pub fn with_success_hook(mut self, hook: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.on_success = Some(hook);
        self
    }

    pub async fn execute(
        &self,
        request: OperationRequest,
        events: Option<mpsc::UnboundedSender<OperationEvent>>,
    ) -> CoreResult<OperationResult> {
        let spec = command_for(&request)?;

        let lock = self.lock_for(request.manager, &request.package_id);
        let _serialized = lock.lock().await;

        emit(
            &events,
            OperationEvent::Progress {
                phase: OperationPhase::Starting,
                line: None,
            },
        );
        info!(
            op = request.op.as_str(),
            manager = %request.manager,
            package_id = %request.package_id,
            "running package operation"
        );
        emit(
            &events,
            OperationEvent::Progress {
                phase: OperationPhase::Running,
                line: None,
            },
        );

        let outcome = match self.runner.run(spec).await {
            Ok(output) => {
                let result = OperationResult {
                    success: output.success(),
                    message: derive_message(output.code, &output.stdout, &output.stderr),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.code,
                };

                if !result.success && looks_like_elevation_failure(&result) {
                    Err(CoreError::for_manager(
                        request.manager,
                        CoreErrorKind::PermissionDenied,
                        format!(
                            "{} requires elevation; re-run the application as administrator or use the manager's elevated shell",
                            request.op.as_str()
                        ),
                    )
                    .operation(request.op))
                } else {
                    Ok(result)
                }
            }
            Err(CommandError::NotFound { program, advice }) => Err(CoreError::for_manager(
                request.manager,
                CoreErrorKind::ProviderUnavailable,
                format!("'{program}' is not installed. {advice}"),
            )
            .operation(request.op)),
            Err(CommandError::Timeout {
                elapsed,
                stdout,
                stderr,
            }) => Err(CoreError::for_manager(
                request.manager,
                CoreErrorKind::OperationTimeout,
                format!(
                    "{} of '{}' timed out after {}s. partial output: {}",
                    request.op.as_str(),
                    request.package_id,
                    elapsed.as_secs(),
                    truncate(&format!("{stdout}{stderr}"), MESSAGE_LIMIT)
                ),
            )
            .operation(request.op)),
            Err(CommandError::Spawn { message }) => Err(CoreError::for_manager(
                request.manager,
                CoreErrorKind::OperationFailed,
                message,
            )
            .operation(request.op)),
        };

        let (success, message) = match &outcome {
            Ok(result) => (result.success, result.message.clone()),
            Err(error) => (false, error.message.clone()),
        };
        self.history.append(HistoryEntry {
            op: request.op,
            package_id: request.package_id.clone(),
            manager: request.manager,
            success,
            message,
            timestamp: now_unix(),
        });

        if success && let Some(hook) = &self.on_success {
            hook();
        }

        if let Ok(result) = &outcome {
            emit(&events, OperationEvent::Finished(result.clone()));
        } else {
            emit(
                &events,
                OperationEvent::Progress {
                    phase: OperationPhase::Finished,
                    line: None,
                },
            );
        }

        if let Err(error) = &outcome {
            warn!(
                op = request.op.as_str(),
                package_id = %request.package_id,
                error = %error,
                "package operation failed"
            );
        }
        outcome
    }

    fn lock_for(&self, manager: Manager, package_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry((manager, package_id.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn emit(events: &Option<mpsc::UnboundedSender<OperationEvent>>, event: OperationEvent) {
    if let Some(events) = events {
        let _ = events.send(event);
    }
}

/// stderr first, then stdout, then the exit code.
fn derive_message(code: i32, stdout: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return truncate(stderr, MESSAGE_LIMIT).to_string();
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return truncate(stdout, MESSAGE_LIMIT).to_string();
    }
    format!("exit code {code}")
}

fn looks_like_elevation_failure(result: &OperationResult) -> bool {
    // 5 = ERROR_ACCESS_DENIED, 740 = ERROR_ELEVATION_REQUIRED.
    if result.exit_code == 5 || result.exit_code == 740 {
        return true;
    }
    let combined = format!("{}\n{}", result.stderr, result.stdout).to_lowercase();
    combined.contains("access is denied")
        || combined.contains("access denied")
        || combined.contains("requires elevation")
        || combined.contains("run as administrator")
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::{OperationEngine, command_for, derive_message};
    use crate::execution::{
        CommandError, CommandOutput, CommandRunner, CommandSpec, INSTALL_TIMEOUT,
    };
    use crate::models::{CoreErrorKind, Manager, OperationKind, OperationRequest};
    use crate::operations::history::HistoryLog;

    fn request(
        op: OperationKind,
        manager: Manager,
        id: &str,
        version: Option<&str>,
    ) -> OperationRequest {
        OperationRequest {
            op,
            package_id: id.to_string(),
            manager,
            version: version.map(str::to_string),
        }
    }

    #[test]
    fn command_builders_use_expected_argv() {
        let spec = command_for(&request(
            OperationKind::Install,
            Manager::Winget,
            "Microsoft.VisualStudioCode",
            Some("1.94.0"),
        ))
        .expect("builds");
        assert_eq!(spec.program, PathBuf::from("winget"));
        assert_eq!(
            spec.args,
            vec![
                "install",
                "--id",
                "Microsoft.VisualStudioCode",
                "--version",
                "1.94.0",
                "--accept-source-agreements",
                "--accept-package-agreements"
            ]
        );
        assert_eq!(spec.timeout, INSTALL_TIMEOUT);
        assert!(!spec.via_shell);

        let spec = command_for(&request(
            OperationKind::Uninstall,
            Manager::Winget,
            "vim.vim",
            None,
        ))
        .expect("builds");
        assert_eq!(spec.args, vec!["uninstall", "--id", "vim.vim"]);

        let spec = command_for(&request(OperationKind::Install, Manager::Chocolatey, "vlc", None))
            .expect("builds");
        assert_eq!(spec.args, vec!["install", "vlc", "-y"]);

        let spec =
            command_for(&request(OperationKind::Uninstall, Manager::Npm, "typescript", None))
                .expect("builds");
        assert_eq!(spec.args, vec!["uninstall", "-g", "typescript"]);
        assert!(spec.via_shell);

        let spec = command_for(&request(OperationKind::Install, Manager::Cargo, "ripgrep", None))
            .expect("builds");
        assert_eq!(spec.args, vec!["install", "ripgrep"]);
    }

    #[test]
    fn unattributed_requests_are_refused_before_any_spawn() {
        for manager in [Manager::Unknown, Manager::MsStore] {
            let error = command_for(&request(
                OperationKind::Uninstall,
                manager,
                "Some Legacy App",
                None,
            ))
            .expect_err("refused");
            assert_eq!(error.kind, CoreErrorKind::UnattributedPackage);

            let error =
                command_for(&request(OperationKind::Install, manager, "Some App", None))
                    .expect_err("refused");
            assert_eq!(error.kind, CoreErrorKind::UnattributedPackage);
        }
    }

    #[test]
    fn message_derivation_prefers_stderr() {
        assert_eq!(derive_message(1, "out", "bad things"), "bad things");
        assert_eq!(derive_message(1, "only stdout", "  "), "only stdout");
        assert_eq!(derive_message(3, " ", ""), "exit code 3");
    }

    struct ScriptedRunner {
        calls: AtomicUsize,
        result: Result<CommandOutput, CommandError>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _spec: CommandSpec) -> Result<CommandOutput, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn engine(
        result: Result<CommandOutput, CommandError>,
    ) -> (tempfile::TempDir, Arc<ScriptedRunner>, OperationEngine) {
        let dir = tempfile::tempdir().expect("temp dir");
        let runner = Arc::new(ScriptedRunner {
            calls: AtomicUsize::new(0),
            result,
        });
        let history = Arc::new(HistoryLog::new(dir.path().join("history.json")));
        let engine = OperationEngine::new(runner.clone(), history);
        (dir, runner, engine)
    }

    #[tokio::test]
    async fn successful_operation_lands_in_history_and_fires_the_hook() {
        let (dir, _runner, engine) = engine(Ok(CommandOutput {
            code: 0,
            stdout: "Successfully installed ripgrep".to_string(),
            stderr: String::new(),
        }));
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_counter = fired.clone();
        let engine = engine.with_success_hook(Arc::new(move || {
            hook_counter.fetch_add(1, Ordering::SeqCst);
        }));

        let result = engine
            .execute(
                request(OperationKind::Install, Manager::Cargo, "ripgrep", None),
                None,
            )
            .await
            .expect("operation runs");

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let history = HistoryLog::new(dir.path().join("history.json"));
        let entries = history.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].package_id, "ripgrep");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failed_result_not_an_error() {
        let (_dir, _runner, engine) = engine(Ok(CommandOutput {
            code: 1,
            stdout: String::new(),
            stderr: "package not found".to_string(),
        }));

        let result = engine
            .execute(
                request(OperationKind::Uninstall, Manager::Chocolatey, "ghost", None),
                None,
            )
            .await
            .expect("engine reports, does not raise");
        assert!(!result.success);
        assert_eq!(result.message, "package not found");
    }

    #[tokio::test]
    async fn elevation_failures_map_to_permission_denied() {
        let (_dir, _runner, engine) = engine(Ok(CommandOutput {
            code: 1,
            stdout: String::new(),
            stderr: "Access is denied. Run as administrator.".to_string(),
        }));

        let error = engine
            .execute(
                request(OperationKind::Uninstall, Manager::Chocolatey, "vlc", None),
                None,
            )
            .await
            .expect_err("elevation failure");
        assert_eq!(error.kind, CoreErrorKind::PermissionDenied);
        assert!(error.message.contains("administrator"));
    }

    #[tokio::test]
    async fn missing_binary_maps_to_provider_unavailable_with_advice() {
        let (_dir, _runner, engine) = engine(Err(CommandError::NotFound {
            program: "choco".to_string(),
            advice: "Install Chocolatey from https://chocolatey.org/install.".to_string(),
        }));

        let error = engine
            .execute(
                request(OperationKind::Install, Manager::Chocolatey, "vlc", None),
                None,
            )
            .await
            .expect_err("binary missing");
        assert_eq!(error.kind, CoreErrorKind::ProviderUnavailable);
        assert!(error.message.contains("chocolatey.org"));
    }

    #[tokio::test]
    async fn unattributed_uninstall_never_reaches_the_runner() {
        let (_dir, runner, engine) = engine(Ok(CommandOutput {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }));

        let error = engine
            .execute(
                request(
                    OperationKind::Uninstall,
                    Manager::Unknown,
                    "Some Legacy App",
                    None,
                ),
                None,
            )
            .await
            .expect_err("refused");
        assert_eq!(error.kind, CoreErrorKind::UnattributedPackage);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }
}
