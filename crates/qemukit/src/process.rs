//! Supervision of the hypervisor child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use qemukit_core::{Error, Result, VmConfig};
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cmdline;

const DEFAULT_BINARY: &str = "qemu-system-x86_64";

const SOCKET_POLL_ATTEMPTS: u32 = 20;
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(500);
// Socket-file creation and listen() are not one observable event, so a
// short pad covers the gap. The monitor client additionally retries refused
// connects on its side.
const SOCKET_LISTEN_GRACE: Duration = Duration::from_millis(200);

/// Where the child's stdout and stderr go.
///
/// The hypervisor is chatty, and a pipe nobody reads stalls the writer once
/// the kernel buffer fills. Output therefore goes to a log file or to the
/// null device, never to an in-process pipe.
enum OutputSink {
    LogFile(PathBuf),
    Null,
}

impl OutputSink {
    fn from_env() -> Self {
        Self::from_value(std::env::var("ENABLE_QEMU_PROCESS_LOG_FILES").ok().as_deref())
    }

    fn from_value(value: Option<&str>) -> Self {
        let enabled = value
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "yes" | "1"))
            .unwrap_or(false);
        if enabled {
            OutputSink::LogFile(std::env::temp_dir().join(format!("qemukit-{}.log", Uuid::new_v4())))
        } else {
            OutputSink::Null
        }
    }
}

/// Supervisor for one hypervisor child process: launch, readiness wait,
/// termination, and exit observation.
pub struct QemuProcess {
    binary: PathBuf,
    child: Option<Child>,
    socket_path: Option<PathBuf>,
}

impl QemuProcess {
    /// Creates a supervisor, resolving the hypervisor binary from
    /// `QEMUKIT_QEMU_PATH`, then `PATH`, falling back to the bare name so a
    /// later spawn reports the lookup failure.
    pub fn new() -> Self {
        Self {
            binary: Self::find_binary(),
            child: None,
            socket_path: None,
        }
    }

    /// Creates a supervisor for a specific hypervisor binary.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            child: None,
            socket_path: None,
        }
    }

    fn find_binary() -> PathBuf {
        if let Ok(path) = std::env::var("QEMUKIT_QEMU_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return path;
            }
        }
        which::which(DEFAULT_BINARY).unwrap_or_else(|_| PathBuf::from(DEFAULT_BINARY))
    }

    /// Launches the hypervisor and waits for its control socket to appear.
    ///
    /// If the socket never shows up within the budget the child is
    /// terminated before the error is returned.
    pub async fn start(&mut self, config: &VmConfig) -> Result<()> {
        if self.is_running() {
            return Err(Error::ProcessAlreadyRunning);
        }

        let socket_path = config.socket_path.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("qemukit-{}.sock", Uuid::new_v4()))
        });
        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let args = cmdline::build_args(config, &socket_path);
        debug!(binary = %self.binary.display(), ?args, "starting hypervisor");

        let mut command = Command::new(&self.binary);
        command.args(&args).stdin(Stdio::null()).kill_on_drop(true);
        match OutputSink::from_env() {
            OutputSink::LogFile(log_path) => {
                let log = std::fs::File::create(&log_path)?;
                debug!(path = %log_path.display(), "hypervisor output goes to a log file");
                command.stdout(log.try_clone()?).stderr(log);
            }
            OutputSink::Null => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        self.child = Some(command.spawn()?);
        self.socket_path = Some(socket_path.clone());

        for _ in 0..SOCKET_POLL_ATTEMPTS {
            if socket_path.exists() {
                sleep(SOCKET_LISTEN_GRACE).await;
                return Ok(());
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        warn!(path = %socket_path.display(), "control socket never appeared");
        self.stop();
        Err(Error::SocketCreationFailed(socket_path))
    }

    /// Terminates the child and removes the control socket. No-op when not
    /// running.
    pub fn stop(&mut self) {
        if let Some(child) = self.child.take() {
            if let Some(pid) = child.id() {
                debug!(pid, "terminating hypervisor");
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Suspends until the child exits and returns its exit code (`-1` when
    /// killed by a signal).
    pub async fn wait(&mut self) -> Result<i32> {
        let child = self.child.as_mut().ok_or(Error::ProcessNotRunning)?;
        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Whether the OS still considers the child alive.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// The control socket path computed by [`start`](Self::start).
    pub fn control_socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }
}

impl Default for QemuProcess {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::stub_hypervisor;
    use qemukit_core::VmConfig;

    mod output_sink {
        use super::*;

        #[test]
        fn truthy_values_select_a_log_file() {
            for value in ["true", "yes", "1", "TRUE", "Yes", " true "] {
                assert!(
                    matches!(OutputSink::from_value(Some(value)), OutputSink::LogFile(_)),
                    "{value:?} should enable log files"
                );
            }
        }

        #[test]
        fn everything_else_selects_the_null_device() {
            for value in [None, Some(""), Some("0"), Some("false"), Some("no"), Some("on")] {
                assert!(
                    matches!(OutputSink::from_value(value), OutputSink::Null),
                    "{value:?} should select the null device"
                );
            }
        }

        #[test]
        fn log_files_land_in_the_temp_dir() {
            let OutputSink::LogFile(path) = OutputSink::from_value(Some("yes")) else {
                panic!("expected a log file sink");
            };
            assert!(path.starts_with(std::env::temp_dir()));
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn wait_without_a_child_fails() {
            let mut process = QemuProcess::with_binary("/bin/true");
            assert!(matches!(process.wait().await, Err(Error::ProcessNotRunning)));
        }

        #[tokio::test]
        async fn stop_without_a_child_is_a_noop() {
            let mut process = QemuProcess::with_binary("/bin/true");
            process.stop();
            assert!(!process.is_running());
        }

        #[tokio::test]
        async fn spawn_failure_surfaces_as_io() {
            let dir = tempfile::tempdir().unwrap();
            let mut process = QemuProcess::with_binary("/nonexistent/hypervisor");
            let config = VmConfig::new().socket_path(dir.path().join("vm.sock"));
            let err = process.start(&config).await.unwrap_err();
            assert!(matches!(err, Error::Io(_)));
            assert!(!process.is_running());
        }

        #[tokio::test(start_paused = true)]
        async fn missing_socket_times_out_and_kills_the_child() {
            let dir = tempfile::tempdir().unwrap();
            // The stub never creates the socket.
            let binary = stub_hypervisor(dir.path(), "exec sleep 30");
            let mut process = QemuProcess::with_binary(binary);
            let socket_path = dir.path().join("vm.sock");
            let config = VmConfig::new().socket_path(&socket_path);

            let started = tokio::time::Instant::now();
            let err = process.start(&config).await.unwrap_err();
            assert!(matches!(err, Error::SocketCreationFailed(p) if p == socket_path));

            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_secs(10), "elapsed {elapsed:?}");
            assert!(elapsed < Duration::from_secs(11), "elapsed {elapsed:?}");
            assert!(!process.is_running());
        }

        #[tokio::test]
        async fn start_reports_readiness_once_the_socket_exists() {
            let dir = tempfile::tempdir().unwrap();
            let socket_path = dir.path().join("vm.sock");
            let binary = stub_hypervisor(
                dir.path(),
                &format!("touch {}\nexec sleep 30", socket_path.display()),
            );
            let mut process = QemuProcess::with_binary(binary);
            let config = VmConfig::new().socket_path(&socket_path);

            process.start(&config).await.unwrap();
            assert!(process.is_running());
            assert_eq!(process.control_socket_path(), Some(socket_path.as_path()));

            let err = process.start(&config).await.unwrap_err();
            assert!(matches!(err, Error::ProcessAlreadyRunning));

            process.stop();
            assert!(!process.is_running());
            assert!(!socket_path.exists());
        }

        #[tokio::test]
        async fn stale_socket_files_are_unlinked_before_launch() {
            let dir = tempfile::tempdir().unwrap();
            let socket_path = dir.path().join("vm.sock");
            std::fs::write(&socket_path, b"stale").unwrap();

            // The stub proves the unlink happened by exiting immediately;
            // start then times out only if the stale file is gone.
            let binary = stub_hypervisor(dir.path(), "exit 0");
            let mut process = QemuProcess::with_binary(binary);
            let config = VmConfig::new().socket_path(&socket_path);

            tokio::time::pause();
            let err = process.start(&config).await.unwrap_err();
            assert!(matches!(err, Error::SocketCreationFailed(_)));
        }
    }
}
