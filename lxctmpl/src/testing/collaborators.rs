//! Recording fakes for the host-supplied hook and remote shell.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::host::{Communicator, ConnectTarget, Hook};

/// A hook that records each invocation.
#[derive(Debug, Default)]
pub struct FakeHook {
    calls: Mutex<Vec<(String, Value)>>,
    failure: Mutex<Option<String>>,
    cancel: Mutex<Option<Arc<CancellationToken>>>,
}

impl FakeHook {
    /// Creates a hook that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later run fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    /// Cancels `token` while the hook runs, like an operator interrupt.
    pub fn cancel_on_run(&self, token: Arc<CancellationToken>) {
        *self.cancel.lock() = Some(token);
    }

    /// Hook name and payload of every run.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Hook for FakeHook {
    async fn run(
        &self,
        name: &str,
        data: &Value,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.calls.lock().push((name.to_string(), data.clone()));
        let token = self.cancel.lock().clone();
        if let Some(token) = token {
            token.cancel("interrupted during provisioning");
        }
        let failure = self.failure.lock().clone();
        match failure {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }
}

/// A remote shell that records hosts and commands.
#[derive(Debug, Default)]
pub struct FakeCommunicator {
    targets: Mutex<Vec<ConnectTarget>>,
    commands: Mutex<Vec<String>>,
    connect_failure: Mutex<Option<String>>,
    exit_status: Mutex<i32>,
}

impl FakeCommunicator {
    /// Creates a communicator whose commands exit 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later connect fail with `message`.
    pub fn fail_connect(&self, message: impl Into<String>) {
        *self.connect_failure.lock() = Some(message.into());
    }

    /// Exit status reported for every later command.
    pub fn set_exit_status(&self, status: i32) {
        *self.exit_status.lock() = status;
    }

    /// Hosts connected to, in order.
    #[must_use]
    pub fn connected_hosts(&self) -> Vec<String> {
        self.targets.lock().iter().map(|t| t.host.clone()).collect()
    }

    /// Full connection targets, in order.
    #[must_use]
    pub fn targets(&self) -> Vec<ConnectTarget> {
        self.targets.lock().clone()
    }

    /// Commands run, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl Communicator for FakeCommunicator {
    async fn connect(&self, target: &ConnectTarget) -> anyhow::Result<()> {
        let failure = self.connect_failure.lock().clone();
        if let Some(message) = failure {
            anyhow::bail!("{message}");
        }
        self.targets.lock().push(target.clone());
        Ok(())
    }

    async fn run_command(&self, command: &str) -> anyhow::Result<i32> {
        self.commands.lock().push(command.to_string());
        Ok(*self.exit_status.lock())
    }
}
