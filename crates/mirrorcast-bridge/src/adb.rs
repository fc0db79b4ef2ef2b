//! adb invocation.
//!
//! Short-lived bridge commands run on a private tokio runtime with a
//! per-command timeout; the companion process is spawned through the same
//! runtime and handed out as a [`CompanionProcess`] for polling.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::runtime::Runtime;
use tokio::time::timeout;
use tracing::{debug, instrument, trace};

use crate::error::BridgeError;
use crate::BridgeResult;

/// Exit notice of a companion process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code when the process terminated normally; `None` when it
    /// was killed by a signal.
    pub code: Option<i32>,
}

/// Handle on a running companion process.
pub trait CompanionProcess: Send {
    /// Poll for exit without blocking.
    fn try_wait(&mut self) -> BridgeResult<Option<ProcessExit>>;

    /// Terminate the process.
    fn kill(&mut self) -> BridgeResult<()>;
}

/// The debug-bridge tool surface the engine needs.
///
/// Implemented by [`AdbBridge`] in production; tests substitute mocks.
pub trait DebugBridge: Send + Sync {
    /// Copy a local file to a device path.
    fn push(&self, local: &Path, remote: &str) -> BridgeResult<()>;

    /// Ask the device to connect out to a listening host port.
    fn reverse(&self, socket_name: &str, port: u16) -> BridgeResult<()>;

    /// Remove a reverse tunnel.
    fn reverse_remove(&self, socket_name: &str) -> BridgeResult<()>;

    /// Expose a device socket on a local host port.
    fn forward(&self, port: u16, socket_name: &str) -> BridgeResult<()>;

    /// Remove a forward tunnel.
    fn forward_remove(&self, port: u16) -> BridgeResult<()>;

    /// Start a remote shell process on the device.
    fn spawn_shell(&self, args: &[String]) -> BridgeResult<Box<dyn CompanionProcess>>;
}

/// adb configuration, injected rather than discovered globally.
#[derive(Debug, Clone)]
pub struct AdbConfig {
    /// Path to the adb executable.
    pub adb_path: PathBuf,

    /// Device serial; omitted when only one device is attached.
    pub serial: Option<String>,

    /// Timeout applied to each short-lived bridge command.
    pub command_timeout: Duration,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            serial: None,
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Production [`DebugBridge`] shelling out to adb.
pub struct AdbBridge {
    config: AdbConfig,
    runtime: Runtime,
}

impl AdbBridge {
    /// Create a bridge for the given configuration.
    pub fn new(config: AdbConfig) -> BridgeResult<Self> {
        let runtime = Runtime::new().map_err(BridgeError::Io)?;
        Ok(Self { config, runtime })
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.config.adb_path);
        if let Some(serial) = &self.config.serial {
            command.arg("-s").arg(serial);
        }
        command.args(args);
        command
    }

    #[instrument(name = "adb_run", skip(self))]
    fn run(&self, args: &[&str]) -> BridgeResult<()> {
        let cmd_line = args.join(" ");
        trace!("Running bridge command");

        let mut command = self.command(args);
        command.stdin(Stdio::null());

        let output = self
            .runtime
            .block_on(async {
                timeout(self.config.command_timeout, command.output())
                    .await
                    .map_err(|_| BridgeError::CommandTimeout(cmd_line.clone()))
            })?
            .map_err(BridgeError::Io)?;

        if !output.status.success() {
            return Err(BridgeError::CommandFailed {
                command: cmd_line,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(command = %cmd_line, "Bridge command succeeded");
        Ok(())
    }
}

impl DebugBridge for AdbBridge {
    fn push(&self, local: &Path, remote: &str) -> BridgeResult<()> {
        self.run(&["push", &local.to_string_lossy(), remote])
    }

    fn reverse(&self, socket_name: &str, port: u16) -> BridgeResult<()> {
        self.run(&[
            "reverse",
            &format!("localabstract:{socket_name}"),
            &format!("tcp:{port}"),
        ])
    }

    fn reverse_remove(&self, socket_name: &str) -> BridgeResult<()> {
        self.run(&["reverse", "--remove", &format!("localabstract:{socket_name}")])
    }

    fn forward(&self, port: u16, socket_name: &str) -> BridgeResult<()> {
        self.run(&[
            "forward",
            &format!("tcp:{port}"),
            &format!("localabstract:{socket_name}"),
        ])
    }

    fn forward_remove(&self, port: u16) -> BridgeResult<()> {
        self.run(&["forward", "--remove", &format!("tcp:{port}")])
    }

    fn spawn_shell(&self, args: &[String]) -> BridgeResult<Box<dyn CompanionProcess>> {
        let mut command = self.command(&["shell"]);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = self
            .runtime
            .block_on(async { command.spawn() })
            .map_err(BridgeError::Io)?;

        debug!("Companion shell process spawned");
        Ok(Box::new(AdbCompanionProcess { child }))
    }
}

struct AdbCompanionProcess {
    child: Child,
}

impl CompanionProcess for AdbCompanionProcess {
    fn try_wait(&mut self) -> BridgeResult<Option<ProcessExit>> {
        let status = self.child.try_wait().map_err(BridgeError::Io)?;
        Ok(status.map(|s| ProcessExit { code: s.code() }))
    }

    fn kill(&mut self) -> BridgeResult<()> {
        self.child.start_kill().map_err(BridgeError::Io)
    }
}
