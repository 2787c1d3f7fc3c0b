//! Isolated compute worker controller (spec.md §6).
//!
//! The production driver for this trait talks to a cloud VM control
//! plane (start/stop an instance, run a command script on it over
//! SSH or an agent API). [`ProcessWorkerPool`] is the same shape
//! running the command script as a local subprocess, which is enough
//! to drive the Verifier end-to-end in a single-machine deployment or
//! an integration test without a real worker fleet.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{CoordinatorError, Result};

#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn start(&self, instance_id: &str) -> Result<()>;
    async fn status(&self, instance_id: &str) -> Result<bool>;
    /// Runs the ordered command script on the worker, returning an
    /// opaque command id to poll with [`WorkerPool::fetch_output`].
    async fn run_command(&self, instance_id: &str, commands: &[String]) -> Result<String>;
    async fn fetch_output(&self, command_id: &str, instance_id: &str) -> Result<String>;
    async fn stop(&self, instance_id: &str) -> Result<()>;
}

/// Runs each worker's command script as a local shell subprocess.
/// `commands` are joined with `&&` so a failing step aborts the rest,
/// matching the production driver's semantics of an ordered script.
pub struct ProcessWorkerPool {
    running: Mutex<HashMap<String, bool>>,
    outputs: Mutex<HashMap<String, String>>,
}

impl Default for ProcessWorkerPool {
    fn default() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
        }
    }
}

impl ProcessWorkerPool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerPool for ProcessWorkerPool {
    async fn start(&self, instance_id: &str) -> Result<()> {
        self.running
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), true);
        Ok(())
    }

    async fn status(&self, instance_id: &str) -> Result<bool> {
        Ok(self
            .running
            .lock()
            .unwrap()
            .get(instance_id)
            .copied()
            .unwrap_or(false))
    }

    async fn run_command(&self, instance_id: &str, commands: &[String]) -> Result<String> {
        if !self.status(instance_id).await? {
            return Err(CoordinatorError::Worker(format!(
                "worker {instance_id} is not running"
            )));
        }
        let script = commands.join(" && ");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoordinatorError::Worker(format!("spawn failed: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CoordinatorError::Worker(format!("command failed: {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let command_id = uuid::Uuid::new_v4().to_string();
        self.outputs.lock().unwrap().insert(command_id.clone(), combined);
        Ok(command_id)
    }

    async fn fetch_output(&self, command_id: &str, _instance_id: &str) -> Result<String> {
        self.outputs
            .lock()
            .unwrap()
            .get(command_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::Worker(format!("no output for command {command_id}")))
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        self.running
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), false);
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Scripted worker pool for unit tests: returns a fixed transcript
    /// regardless of the command script, and can be configured to fail
    /// at `start`/`run_command` to exercise the WorkerError path.
    pub struct FakeWorkerPool {
        pub transcript: String,
        pub fail_start: bool,
        pub fail_run: bool,
        pub stopped: StdMutex<Vec<String>>,
    }

    impl FakeWorkerPool {
        pub fn valid() -> Self {
            Self {
                transcript: "... ZKey Ok! ...".to_string(),
                fail_start: false,
                fail_run: false,
                stopped: StdMutex::new(vec![]),
            }
        }

        pub fn invalid() -> Self {
            Self {
                transcript: "... ZKey verification failed ...".to_string(),
                fail_start: false,
                fail_run: false,
                stopped: StdMutex::new(vec![]),
            }
        }

        pub fn failing_run() -> Self {
            Self {
                transcript: String::new(),
                fail_start: false,
                fail_run: true,
                stopped: StdMutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl WorkerPool for FakeWorkerPool {
        async fn start(&self, _instance_id: &str) -> Result<()> {
            if self.fail_start {
                return Err(CoordinatorError::Worker("start failed".into()));
            }
            Ok(())
        }

        async fn status(&self, _instance_id: &str) -> Result<bool> {
            Ok(true)
        }

        async fn run_command(&self, _instance_id: &str, _commands: &[String]) -> Result<String> {
            if self.fail_run {
                return Err(CoordinatorError::Worker("run_command failed".into()));
            }
            Ok("cmd-1".to_string())
        }

        async fn fetch_output(&self, _command_id: &str, _instance_id: &str) -> Result<String> {
            Ok(self.transcript.clone())
        }

        async fn stop(&self, instance_id: &str) -> Result<()> {
            self.stopped.lock().unwrap().push(instance_id.to_string());
            Ok(())
        }
    }
}
