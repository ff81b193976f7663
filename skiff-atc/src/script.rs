//! Script Process Supervisor
//!
//! Runs one script inside a container as a cancellable unit: the JSON
//! request goes to the process's stdin, stdout and stderr are captured, and
//! waiting for the exit races a cancellation signal. On cancellation the
//! container is stopped and the process awaited before returning, so an
//! aborted script never keeps running.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use skiff_client::{ClientError, Container, ProcessExit, ProcessIo, ProcessSpec};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// A script exited with a non-zero status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFailed {
    pub path: String,
    pub args: Vec<String>,
    pub exit_status: i32,
    pub stderr: String,
}

impl std::fmt::Display for ScriptFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut command = self.path.clone();
        for arg in &self.args {
            command.push(' ');
            command.push_str(arg);
        }

        write!(
            f,
            "script '{}' failed: exit status {}",
            command, self.exit_status
        )?;

        if !self.stderr.is_empty() {
            write!(f, "\n\nstderr:\n{}", self.stderr)?;
        }

        Ok(())
    }
}

impl std::error::Error for ScriptFailed {}

/// Errors raised while running a script
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Failed(#[from] ScriptFailed),

    #[error("script aborted")]
    Aborted,

    #[error("failed to start script: {0}")]
    Start(#[source] ClientError),

    #[error("failed waiting for script: {0}")]
    Wait(#[source] ClientError),

    #[error("failed to encode script request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode script response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A cancellation receiver that never fires
pub fn never_cancelled() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// One script invocation inside a container
pub struct ScriptProcess {
    container: Arc<dyn Container>,
    path: String,
    args: Vec<String>,
    ready: Option<oneshot::Sender<()>>,
    stdout: String,
    stderr: String,
}

impl ScriptProcess {
    pub fn new(container: Arc<dyn Container>, path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            container,
            path: path.into(),
            args,
            ready: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Signals `ready` once the process has started
    pub fn with_ready_signal(mut self, ready: oneshot::Sender<()>) -> Self {
        self.ready = Some(ready);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Output captured by the last run
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Error output captured by the last run
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Runs the script with `request` on stdin and decodes its stdout.
    ///
    /// Fires when `cancel` turns true; a dropped sender never cancels.
    pub async fn run<Req, Resp>(
        &mut self,
        request: &Req,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Resp, ScriptError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let stdin = serde_json::to_string(request).map_err(ScriptError::Encode)?;

        debug!(
            handle = %self.container.handle(),
            path = %self.path,
            args = ?self.args,
            "Starting script"
        );

        let process = self
            .container
            .run(
                ProcessSpec::new(self.path.clone(), self.args.clone()),
                ProcessIo { stdin },
            )
            .await
            .map_err(ScriptError::Start)?;

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }

        let exit = tokio::select! {
            exit = process.wait() => exit.map_err(ScriptError::Wait)?,
            _ = cancelled(&mut cancel) => {
                info!(handle = %self.container.handle(), path = %self.path, "Aborting script");

                if let Err(e) = self.container.stop(false).await {
                    warn!(handle = %self.container.handle(), error = %e, "Failed to stop container, killing it");
                    if let Err(e) = self.container.stop(true).await {
                        warn!(handle = %self.container.handle(), error = %e, "Failed to kill container");
                    }
                }

                match process.wait().await {
                    Ok(exit) => self.capture(exit),
                    Err(e) => warn!(
                        handle = %self.container.handle(),
                        error = %e,
                        "Failed to collect aborted script"
                    ),
                }

                return Err(ScriptError::Aborted);
            }
        };

        let exit_status = exit.exit_status;
        self.capture(exit);

        if exit_status != 0 {
            return Err(ScriptFailed {
                path: self.path.clone(),
                args: self.args.clone(),
                exit_status,
                stderr: self.stderr.clone(),
            }
            .into());
        }

        serde_json::from_str(&self.stdout).map_err(ScriptError::Decode)
    }

    fn capture(&mut self, exit: ProcessExit) {
        self.stdout = exit.stdout;
        self.stderr = exit.stderr;
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
