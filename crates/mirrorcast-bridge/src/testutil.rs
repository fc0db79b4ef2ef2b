//! Shared mocks for bridge unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::adb::{CompanionProcess, DebugBridge, ProcessExit};
use crate::error::BridgeError;
use crate::BridgeResult;

/// A recorded bridge invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    Push { local: PathBuf, remote: String },
    Reverse { socket_name: String, port: u16 },
    ReverseRemove { socket_name: String },
    Forward { port: u16, socket_name: String },
    ForwardRemove { port: u16 },
    SpawnShell { args: Vec<String> },
}

/// Shared control block for mock companion processes.
#[derive(Default)]
pub struct ProcessControl {
    exited: Mutex<Option<ProcessExit>>,
    killed: AtomicBool,
}

impl ProcessControl {
    /// Simulate the process exiting on its own.
    pub fn exit_with(&self, code: Option<i32>) {
        *self.exited.lock() = Some(ProcessExit { code });
    }

    /// Whether `kill` has been called.
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct MockProcess {
    control: Arc<ProcessControl>,
}

impl CompanionProcess for MockProcess {
    fn try_wait(&mut self) -> BridgeResult<Option<ProcessExit>> {
        if let Some(exit) = *self.control.exited.lock() {
            return Ok(Some(exit));
        }
        if self.control.killed.load(Ordering::SeqCst) {
            return Ok(Some(ProcessExit { code: None }));
        }
        Ok(None)
    }

    fn kill(&mut self) -> BridgeResult<()> {
        self.control.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted [`DebugBridge`] recording every call.
pub struct MockBridge {
    calls: Arc<Mutex<Vec<BridgeCall>>>,
    fail_reverse: bool,
    fail_forward: bool,
    fail_push: bool,
    process_control: Arc<ProcessControl>,
}

impl MockBridge {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_reverse: false,
            fail_forward: false,
            fail_push: false,
            process_control: Arc::new(ProcessControl::default()),
        }
    }

    pub fn fail_reverse(mut self) -> Self {
        self.fail_reverse = true;
        self
    }

    pub fn fail_forward(mut self) -> Self {
        self.fail_forward = true;
        self
    }

    pub fn fail_push(mut self) -> Self {
        self.fail_push = true;
        self
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().clone()
    }

    pub fn process_control(&self) -> Arc<ProcessControl> {
        Arc::clone(&self.process_control)
    }

    fn record(&self, call: BridgeCall) {
        self.calls.lock().push(call);
    }

    fn command_failed(&self, command: &str) -> BridgeError {
        BridgeError::CommandFailed {
            command: command.into(),
            detail: "mock failure".into(),
        }
    }
}

impl DebugBridge for MockBridge {
    fn push(&self, local: &Path, remote: &str) -> BridgeResult<()> {
        self.record(BridgeCall::Push {
            local: local.to_path_buf(),
            remote: remote.into(),
        });
        if self.fail_push {
            return Err(self.command_failed("push"));
        }
        Ok(())
    }

    fn reverse(&self, socket_name: &str, port: u16) -> BridgeResult<()> {
        self.record(BridgeCall::Reverse {
            socket_name: socket_name.into(),
            port,
        });
        if self.fail_reverse {
            return Err(self.command_failed("reverse"));
        }
        Ok(())
    }

    fn reverse_remove(&self, socket_name: &str) -> BridgeResult<()> {
        self.record(BridgeCall::ReverseRemove {
            socket_name: socket_name.into(),
        });
        Ok(())
    }

    fn forward(&self, port: u16, socket_name: &str) -> BridgeResult<()> {
        self.record(BridgeCall::Forward {
            port,
            socket_name: socket_name.into(),
        });
        if self.fail_forward {
            return Err(self.command_failed("forward"));
        }
        Ok(())
    }

    fn forward_remove(&self, port: u16) -> BridgeResult<()> {
        self.record(BridgeCall::ForwardRemove { port });
        Ok(())
    }

    fn spawn_shell(&self, args: &[String]) -> BridgeResult<Box<dyn CompanionProcess>> {
        self.record(BridgeCall::SpawnShell {
            args: args.to_vec(),
        });
        Ok(Box::new(MockProcess {
            control: Arc::clone(&self.process_control),
        }))
    }
}
