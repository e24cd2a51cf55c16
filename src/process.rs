use crate::config::{MuxConfig, DELEGATED_OWNER_VAR, PUBLIC_HOST_VAR};
use crate::error::MuxError;
use crate::output::rewrite_chunk;
use crate::process_group::{self, kill_on_exit_group, PlatformGroup, ProcessGroup};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long captured output may keep draining after the backend exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit code reported when the backend's status carries no code at all
const UNKNOWN_EXIT_CODE: i32 = 1;

/// How the backend's stdout/stderr reach the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Inherit our streams; the backend talks to the terminal directly
    Raw,
    /// Pipe, rewrite line by line, then relay to our streams
    Captured,
}

/// Lifecycle of a backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Spawned, not yet bound to its process group
    Starting,
    /// Bound and running
    Running,
    /// Exited with the given code
    Exited(i32),
}

/// A running backend, killed together with its group when dropped
pub struct BackendProcess {
    child: Child,
    group: PlatformGroup,
    state: BackendState,
    pid: Option<u32>,
}

impl BackendProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    /// Wait for exit, passing Ctrl+C on to the backend instead of dying from it.
    ///
    /// The backend decides how to react to the interrupt; its exit code is what
    /// we report.
    pub async fn wait(&mut self) -> std::io::Result<i32> {
        let status = loop {
            tokio::select! {
                status = self.child.wait() => break status?,
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "Failed to listen for interrupts");
                        break self.child.wait().await?;
                    }
                    debug!(pid = ?self.pid, "Interrupt forwarded to backend");
                    self.group.interrupt();
                }
            }
        };

        let code = exit_code(status);
        self.group.child_exited();
        self.state = BackendState::Exited(code);
        debug!(pid = ?self.pid, code, "Backend exited");
        Ok(code)
    }

    /// Force-kill the backend and everything in its group
    pub async fn kill(&mut self) {
        self.group.terminate();
        match self.child.wait().await {
            Ok(status) => {
                self.group.child_exited();
                self.state = BackendState::Exited(exit_code(status));
            }
            Err(e) => warn!(pid = ?self.pid, error = %e, "Failed to reap backend"),
        }
    }
}

/// Owns the backend executable's lifecycle.
///
/// Every backend it starts is bound to the private execution address through
/// `OLLAMA_HOST` and to this process's lifetime through a [`ProcessGroup`].
pub struct BackendSupervisor {
    config: Arc<MuxConfig>,
}

impl BackendSupervisor {
    pub fn new(config: Arc<MuxConfig>) -> Self {
        Self { config }
    }

    /// Locate the configured backend executable on PATH
    pub fn resolve_program(&self) -> Result<PathBuf, MuxError> {
        which::which(&self.config.backend_program).map_err(|e| {
            MuxError::launch_failure(format!(
                "could not find '{}': {}",
                self.config.backend_program, e
            ))
        })
    }

    /// Start the backend with `args` passed through verbatim
    pub fn spawn(&self, args: &[String], mode: OutputMode) -> Result<BackendProcess, MuxError> {
        let program = self.resolve_program()?;

        let mut command = Command::new(&program);
        command
            .args(args)
            .env(PUBLIC_HOST_VAR, self.config.hosts.execution.to_string())
            .env_remove(DELEGATED_OWNER_VAR)
            .stdin(Stdio::inherit());

        match mode {
            OutputMode::Raw => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputMode::Captured => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        let mut group = kill_on_exit_group(mode == OutputMode::Raw);
        group.prepare(&mut command);

        debug!(program = %program.display(), ?args, ?mode, "Starting backend");
        let child = command.spawn().map_err(|e| {
            MuxError::launch_failure(format!("could not start {}: {}", program.display(), e))
        })?;

        let pid = child.id();
        let mut process = BackendProcess {
            child,
            group,
            state: BackendState::Starting,
            pid,
        };

        if let Err(e) = process.group.adopt(&process.child) {
            // Never leave an unbound backend behind
            process.child.start_kill().ok();
            return Err(MuxError::launch_failure(format!(
                "could not bind backend to this process: {}",
                e
            )));
        }

        process.state = BackendState::Running;
        info!(pid = ?pid, execution = %self.config.hosts.execution, "Backend started");
        Ok(process)
    }

    /// Run the backend to completion and return its exit code
    pub async fn run_foreground(&self, args: &[String], mode: OutputMode) -> Result<i32, MuxError> {
        let mut process = self.spawn(args, mode)?;

        let relay = match mode {
            OutputMode::Raw => None,
            OutputMode::Captured => {
                let stdout = process.child.stdout.take();
                let stderr = process.child.stderr.take();
                Some(tokio::spawn(async move {
                    let out = async {
                        if let Some(stdout) = stdout {
                            relay_lines(BufReader::new(stdout), tokio::io::stdout()).await?;
                        }
                        Ok::<_, std::io::Error>(())
                    };
                    let err = async {
                        if let Some(stderr) = stderr {
                            relay_lines(BufReader::new(stderr), tokio::io::stderr()).await?;
                        }
                        Ok::<_, std::io::Error>(())
                    };
                    let (out, err) = tokio::join!(out, err);
                    out.and(err)
                }))
            }
        };

        let code = process.wait().await?;

        if let Some(relay) = relay {
            // A lingering descendant can hold the pipes open; don't wait on it forever
            match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, relay).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => debug!(error = %e, "Output relay stopped early"),
                Ok(Err(e)) => warn!(error = %e, "Output relay task failed"),
                Err(_) => debug!("Output relay still open after backend exit"),
            }
        }

        Ok(code)
    }

    /// Launch `program` detached so it outlives this process.
    ///
    /// Succeeds once the child has survived the launch grace window; an exit
    /// inside the window is a launch failure. Stdout is discarded and stderr
    /// is appended to `log_path`.
    pub async fn launch_detached(
        &self,
        program: &Path,
        args: &[&str],
        envs: &[(&str, &str)],
        log_path: &Path,
    ) -> Result<(), MuxError> {
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(envs.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        process_group::detach(&mut command);

        let mut child = command.spawn().map_err(|e| {
            MuxError::launch_failure(format!("could not start {}: {}", program.display(), e))
        })?;
        let pid = child.id();

        match tokio::time::timeout(self.config.launch_grace, child.wait()).await {
            Ok(Ok(status)) => Err(MuxError::launch_failure(format!(
                "{} exited during startup with code {} (see {})",
                program.display(),
                exit_code(status),
                log_path.display()
            ))),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                info!(pid = ?pid, log = %log_path.display(), "Detached process running");
                Ok(())
            }
        }
    }
}

/// Copy `reader` to `sink` one rewritten line at a time
async fn relay_lines<R, W>(mut reader: R, mut sink: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        sink.write_all(&rewrite_chunk(&line)).await?;
        sink.flush().await?;
    }
    Ok(())
}

/// Exit code for a finished process; a signal death maps to `128 + signal`
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    UNKNOWN_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostAddress, HostPair};

    fn test_config(program: &str) -> Arc<MuxConfig> {
        let hosts = HostPair::new(HostAddress::loopback(21434), HostAddress::loopback(21435)).unwrap();
        let mut config = MuxConfig::with_hosts(hosts);
        config.backend_program = program.to_string();
        config.launch_grace = Duration::from_millis(300);
        Arc::new(config)
    }

    #[test]
    fn test_missing_program_is_launch_failure() {
        let supervisor = BackendSupervisor::new(test_config("definitely-not-an-ollama-binary"));
        let err = supervisor.resolve_program().unwrap_err();
        assert!(matches!(err, MuxError::BackendLaunchFailure { .. }));
        assert!(err.to_string().contains("in your PATH"));
    }

    #[tokio::test]
    async fn test_relay_rewrites_lines() {
        let input: &[u8] = b"Usage: ollama [flags]\nsee https://ollama.com\r\ntail";
        let mut output = Vec::new();
        relay_lines(input, &mut output).await.unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "Usage: ollamamux [flags]\nsee https://ollama.com\r\ntail"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_for_signal() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_foreground_propagates_exit_code() {
        let supervisor = BackendSupervisor::new(test_config("sh"));
        let args = vec!["-c".to_string(), "exit 7".to_string()];
        let code = supervisor.run_foreground(&args, OutputMode::Raw).await.unwrap();
        assert_eq!(code, 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_backend_sees_execution_address() {
        let supervisor = BackendSupervisor::new(test_config("sh"));
        let args = vec![
            "-c".to_string(),
            "test \"$OLLAMA_HOST\" = http://127.0.0.1:21435/".to_string(),
        ];
        let code = supervisor.run_foreground(&args, OutputMode::Captured).await.unwrap();
        assert_eq!(code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_reports_exited() {
        let supervisor = BackendSupervisor::new(test_config("sleep"));
        let mut process = supervisor.spawn(&["30".to_string()], OutputMode::Captured).unwrap();
        assert_eq!(process.state(), BackendState::Running);
        assert!(process.pid().is_some());

        process.kill().await;
        assert_eq!(process.state(), BackendState::Exited(137));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detached_early_exit_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = BackendSupervisor::new(test_config("sh"));
        let result = supervisor
            .launch_detached(
                Path::new("/bin/sh"),
                &["-c", "exit 3"],
                &[],
                &dir.path().join("launch.log"),
            )
            .await;
        assert!(matches!(result, Err(MuxError::BackendLaunchFailure { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detached_survivor_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 5", pid_file.display());

        let supervisor = BackendSupervisor::new(test_config("sh"));
        supervisor
            .launch_detached(Path::new("/bin/sh"), &["-c", &script], &[], &dir.path().join("launch.log"))
            .await
            .unwrap();

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        unsafe {
            assert_eq!(libc::kill(pid, 0), 0);
            libc::kill(pid, libc::SIGKILL);
        }
    }
}
