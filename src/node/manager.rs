//! Embedded daemon process management
//!
//! Starts hushd with a resolved launch plan, waits until it accepts
//! connections on its RPC port, and stops it again on shutdown.

use super::config::{Network, NodeConfFile, TOR_PROXY_ADDR};
use super::rpc::NodeRpc;
use crate::error::WalletError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Log target for lines the daemon prints. Warnings on this target are
/// forwarded to the UI activity feed.
pub const DAEMON_LOG_TARGET: &str = "hushd";

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a stopped daemon may take before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

const READINESS_POLL: Duration = Duration::from_millis(250);
const CAPTURED_LINES: usize = 200;

/// Everything needed to start the embedded daemon
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub daemon_path: PathBuf,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub rpc_port: u16,
    pub use_tor: bool,
    pub extra_args: Vec<String>,
    pub startup_timeout: Duration,
}

impl LaunchPlan {
    /// Command line arguments for the daemon
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-datadir={}", self.data_dir.display()),
            format!("-conf={}", self.conf_path.display()),
        ];
        if self.network == Network::Testnet {
            args.push("-testnet".to_string());
        }
        if self.use_tor {
            args.push(format!("-proxy={}", TOR_PROXY_ADDR));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn process_name(&self) -> Option<String> {
        self.daemon_path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// We started the process and own its handle
    Spawned { pid: Option<u32> },
    /// A daemon was already running; we only waited for it
    AlreadyRunning { pid: u32 },
}

/// Starts and stops the embedded node on behalf of the RPC session
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, WalletError>;
    async fn stop(&self, rpc: &dyn NodeRpc, grace: Duration) -> Result<(), WalletError>;
}

type LineBuffer = Arc<Mutex<VecDeque<String>>>;

/// Supervises the embedded daemon process
pub struct DaemonLauncher {
    /// Child process handle (if we spawned it)
    process: tokio::sync::Mutex<Option<Child>>,
}

impl Default for DaemonLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonLauncher {
    pub fn new() -> Self {
        Self {
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Find the PID of a running process with the given executable name
    pub fn find_daemon_pid(process_name: &str) -> Option<u32> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());

        let wanted = process_name.to_lowercase();
        sys.processes()
            .iter()
            .find(|(_, process)| process.name().to_string_lossy().to_lowercase() == wanted)
            .map(|(pid, _)| pid.as_u32())
    }

    /// Check if we have the child process handle (we started it)
    pub async fn has_process_handle(&self) -> bool {
        self.process.lock().await.is_some()
    }

    /// Start the daemon and wait until it listens on its RPC port
    pub async fn launch(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, WalletError> {
        log::info!("Starting embedded node...");

        reject_daemon_mode(plan)?;

        if let Some(pid) = plan.process_name().as_deref().and_then(Self::find_daemon_pid) {
            log::info!("Node already running with PID {}, waiting for it", pid);
            wait_for_listening(plan.rpc_port, plan.startup_timeout, || Ok(())).await?;
            return Ok(LaunchOutcome::AlreadyRunning { pid });
        }

        if !plan.daemon_path.exists() {
            return Err(WalletError::Configuration(format!(
                "Cannot start the embedded node: {} was not found",
                plan.daemon_path.display()
            )));
        }

        std::fs::create_dir_all(&plan.data_dir).map_err(|e| {
            WalletError::Configuration(format!("Failed to create data directory: {}", e))
        })?;

        let mut cmd = Command::new(&plan.daemon_path);
        cmd.args(plan.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // On Windows, prevent console window from appearing
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        log::info!("Starting hushd: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| {
            WalletError::Configuration(format!("Failed to start {}: {}", plan.daemon_path.display(), e))
        })?;

        let pid = child.id();
        log::info!("hushd started with PID {:?}", pid);

        // Drain both pipes so a chatty daemon never blocks on a full pipe
        let stdout_lines = LineBuffer::default();
        let stderr_lines = LineBuffer::default();
        let readers = [
            child.stdout.take().map(|out| spawn_reader(out, stdout_lines.clone(), false)),
            child.stderr.take().map(|err| spawn_reader(err, stderr_lines.clone(), true)),
        ];

        let mut exit: Option<ExitStatus> = None;
        let ready = wait_for_listening(plan.rpc_port, plan.startup_timeout, || {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit = Some(status);
                    Err(WalletError::Configuration(String::new()))
                }
                Ok(None) => Ok(()),
                Err(e) => Err(WalletError::Configuration(format!("Failed to poll hushd: {}", e))),
            }
        })
        .await;

        match (ready, exit) {
            (Ok(()), _) => {
                *self.process.lock().await = Some(child);
                Ok(LaunchOutcome::Spawned { pid })
            }
            (Err(_), Some(status)) => {
                for reader in readers.into_iter().flatten() {
                    let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
                }
                let detail = diagnostic_output(&stderr_lines, &stdout_lines);
                log::error!("hushd exited with {}: {}", status, detail);
                Err(WalletError::Configuration(if detail.is_empty() {
                    format!("hushd exited immediately ({})", status)
                } else {
                    detail
                }))
            }
            (Err(err), None) => {
                // Leave a slow starter running; the session keeps polling it
                if err.is_retryable() {
                    *self.process.lock().await = Some(child);
                }
                Err(err)
            }
        }
    }

    /// Ask the node to stop, killing our child if it ignores the request
    pub async fn stop(&self, rpc: &dyn NodeRpc, grace: Duration) -> Result<(), WalletError> {
        log::info!("Stopping embedded node...");

        match rpc.stop().await {
            Ok(()) => log::info!("RPC stop command sent - node will shutdown gracefully"),
            Err(e) => log::warn!("RPC stop command failed: {}", e),
        }

        let Some(mut child) = self.process.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("hushd exited with {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(WalletError::Configuration(format!("Failed to wait for hushd: {}", e))),
            Err(_) => {
                log::warn!("hushd did not exit within {:?}, killing it", grace);
                child
                    .kill()
                    .await
                    .map_err(|e| WalletError::Configuration(format!("Failed to kill hushd: {}", e)))
            }
        }
    }
}

#[async_trait]
impl Launcher for DaemonLauncher {
    async fn launch(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, WalletError> {
        DaemonLauncher::launch(self, plan).await
    }

    async fn stop(&self, rpc: &dyn NodeRpc, grace: Duration) -> Result<(), WalletError> {
        DaemonLauncher::stop(self, rpc, grace).await
    }
}

fn reject_daemon_mode(plan: &LaunchPlan) -> Result<(), WalletError> {
    if !plan.conf_path.exists() {
        return Ok(());
    }
    let conf = NodeConfFile::load(&plan.conf_path).map_err(WalletError::Configuration)?;
    if conf.is_daemon_mode() {
        return Err(WalletError::Configuration(format!(
            "hushd is set to run as a background daemon, which is not supported by the embedded node. \
             Please remove \"daemon=1\" from {} and restart the wallet",
            plan.conf_path.display()
        )));
    }
    Ok(())
}

/// Poll until something accepts TCP connections on the loopback RPC port.
/// `check_process` runs every tick and aborts the wait when it fails.
async fn wait_for_listening<F>(port: u16, timeout: Duration, mut check_process: F) -> Result<(), WalletError>
where
    F: FnMut() -> Result<(), WalletError>,
{
    let start = Instant::now();
    let addr = format!("127.0.0.1:{}", port);

    log::info!("Waiting for node to listen on {} (timeout: {:?})...", addr, timeout);

    loop {
        check_process()?;

        if let Ok(Ok(_)) = tokio::time::timeout(READINESS_POLL, TcpStream::connect(&addr)).await {
            log::info!("Node is listening (took {:?})", start.elapsed());
            return Ok(());
        }

        if start.elapsed() > timeout {
            return Err(WalletError::NodeBusy(format!(
                "node did not start listening within {} seconds",
                timeout.as_secs()
            )));
        }

        tokio::time::sleep(READINESS_POLL).await;
    }
}

fn spawn_reader<R>(stream: R, buffer: LineBuffer, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                log::warn!(target: DAEMON_LOG_TARGET, "{}", line);
            } else {
                log::debug!(target: DAEMON_LOG_TARGET, "{}", line);
            }
            if let Ok(mut buf) = buffer.lock() {
                if buf.len() == CAPTURED_LINES {
                    buf.pop_front();
                }
                buf.push_back(line);
            }
        }
    })
}

/// Captured stderr, or stdout when stderr is empty
fn diagnostic_output(stderr: &LineBuffer, stdout: &LineBuffer) -> String {
    let join = |buffer: &LineBuffer| {
        buffer
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    };
    let err = join(stderr);
    if err.trim().is_empty() {
        join(stdout).trim().to_string()
    } else {
        err.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::rpc::mock::MockNode;

    fn plan_in(dir: &std::path::Path, daemon: PathBuf, port: u16) -> LaunchPlan {
        LaunchPlan {
            daemon_path: daemon,
            data_dir: dir.join("data"),
            conf_path: dir.join("data").join("HUSH3.conf"),
            network: Network::Mainnet,
            rpc_port: port,
            use_tor: false,
            extra_args: vec![],
            startup_timeout: Duration::from_secs(5),
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_launch_args() {
        let mut plan = plan_in(std::path::Path::new("/tmp/w"), PathBuf::from("/opt/hushd"), 18031);
        plan.network = Network::Testnet;
        plan.use_tor = true;
        plan.extra_args = vec!["-rescan".into()];

        assert_eq!(
            plan.args(),
            vec![
                "-datadir=/tmp/w/data",
                "-conf=/tmp/w/data/HUSH3.conf",
                "-testnet",
                "-proxy=127.0.0.1:9050",
                "-rescan",
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_daemon_mode_conf() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_in(dir.path(), dir.path().join("hushd-missing"), 1);
        std::fs::create_dir_all(&plan.data_dir).unwrap();
        std::fs::write(&plan.conf_path, "server=1\ndaemon=1\n").unwrap();

        let err = DaemonLauncher::new().launch(&plan).await.unwrap_err();
        assert!(matches!(err, WalletError::Configuration(ref msg) if msg.contains("daemon=1")));
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_in(dir.path(), dir.path().join("hushd-not-installed"), 1);

        let err = DaemonLauncher::new().launch(&plan).await.unwrap_err();
        assert!(matches!(err, WalletError::Configuration(ref msg) if msg.contains("not found")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_immediate_exit_surfaces_stderr_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = write_script(
            dir.path(),
            "hushd-failing-test",
            "echo 'Error: Cannot obtain a lock on data directory' >&2\nexit 1",
        );
        let plan = plan_in(dir.path(), daemon, 1);

        let err = DaemonLauncher::new().launch(&plan).await.unwrap_err();
        assert_eq!(
            err,
            WalletError::Configuration("Error: Cannot obtain a lock on data directory".into())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_waits_for_port_then_stop_kills_stubborn_child() {
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let daemon = write_script(dir.path(), "hushd-sleeping-test", "sleep 30");
        let plan = plan_in(dir.path(), daemon, port);

        let launcher = DaemonLauncher::new();
        let outcome = launcher.launch(&plan).await.unwrap();
        assert!(matches!(outcome, LaunchOutcome::Spawned { .. }));
        assert!(launcher.has_process_handle().await);

        // The mock has no "stop" answer, so the child must be killed
        let node = MockNode::new();
        launcher.stop(&node, Duration::from_millis(100)).await.unwrap();
        assert!(!launcher.has_process_handle().await);
        assert_eq!(node.count("stop"), 1);
    }

    #[test]
    fn test_diagnostic_output_prefers_stderr() {
        let stderr = LineBuffer::default();
        let stdout = LineBuffer::default();
        stdout.lock().unwrap().push_back("starting".into());
        assert_eq!(diagnostic_output(&stderr, &stdout), "starting");

        stderr.lock().unwrap().push_back("fatal".into());
        assert_eq!(diagnostic_output(&stderr, &stdout), "fatal");
    }
}
