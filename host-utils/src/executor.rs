// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{command_to_string, output_to_exec_error, ExecutionError};

use async_trait::async_trait;
use slog::{debug, error, info, Logger};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

fn log_input(log: &Logger, id: u64, command: &str) {
    info!(
        log,
        "running command via executor"; "id" => id, "command" => command
    );
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "finished running command via executor";
        "id" => id,
        "result" => if output.status.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        debug!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => from_utf8(&output.stderr).unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Describes an "executor", which can run commands and return a response.
///
/// - In production, this is usually simply a [HostExecutor].
/// - Under test, this can be customized, and a [FakeExecutor] may be used.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a task, waiting for it to complete, and returning output.
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError>;
}

pub struct HostExecutor {
    log: Logger,
    counter: AtomicU64,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let command_str = command_to_string(command.as_std());
        log_input(&self.log, id, &command_str);
        let output = command.output().await.map_err(|err| {
            error!(self.log, "Could not start program asynchronously!"; "id" => id);
            ExecutionError::ExecutionStart { command: command_str.clone(), err }
        })?;
        log_output(&self.log, id, &output);
        if !output.status.success() {
            return Err(output_to_exec_error(command_str, &output));
        }
        Ok(output)
    }
}

/// Handler called with the full command line of each command run through a
/// [FakeExecutor].
pub type BoxedCommandFn = Box<dyn FnMut(&str) -> Output + Send + Sync>;

/// An executor which records its inputs, and responds with caller-chosen
/// outputs.
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    handler: Mutex<BoxedCommandFn>,
    commands: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            log,
            counter: AtomicU64::new(0),
            handler: Mutex::new(Box::new(|_cmd| success_output())),
            commands: Mutex::new(Vec::new()),
        })
    }

    /// Set the command handler to an arbitrary function.
    pub fn set_handler(&self, f: BoxedCommandFn) {
        *self.handler.lock().unwrap() = f;
    }

    /// Returns every command line executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let command_str = command_to_string(command.as_std());
        log_input(&self.log, id, &command_str);
        self.commands.lock().unwrap().push(command_str.clone());

        let output = (self.handler.lock().unwrap())(&command_str);
        log_output(&self.log, id, &output);
        if !output.status.success() {
            return Err(output_to_exec_error(command_str, &output));
        }
        Ok(output)
    }
}

/// Output of a command which exited successfully without printing anything.
pub fn success_output() -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

/// Output of a command which exited with status 1, printing `stderr`.
pub fn failure_output(stderr: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(1 << 8),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}
