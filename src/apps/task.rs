//! The per-app task runner.
//!
//! Every long-running mutation of an app (cloning, running, updating) is a
//! task. At most one task is active per app; the task slot is only ever
//! transitioned here.

use std::fmt;
use std::sync::Arc;

use tracing::error;

use super::app::App;
use crate::error::{Error, Result};

pub const STATE_ERROR: &str = "error";
pub const STATE_IDLE: &str = "stopped";
pub const STATE_STARTING_TASK: &str = "starting task...";

/// The kind of task currently executing on an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    None,
    CloneSource,
    Run,
    Update,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::None => "none",
            TaskKind::CloneSource => "clone-source",
            TaskKind::Run => "run",
            TaskKind::Update => "update",
        };
        f.write_str(name)
    }
}

impl App {
    /// Claim the task slot and run `body` on a background worker.
    ///
    /// Returns [`Error::Busy`] if another task is active. The slot is reset
    /// and the outcome recorded when the body finishes, also when it
    /// panics, which is caught through the join handle.
    pub(crate) async fn run_task<F>(self: &Arc<Self>, kind: TaskKind, body: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let _gate = self.task_gate.lock().await;

        {
            let mut task = self.task.lock().unwrap();
            if *task != TaskKind::None {
                return Err(Error::Busy);
            }
            *task = kind;
        }

        *self.task_err.lock().unwrap() = None;
        self.set_state(STATE_STARTING_TASK);

        let handle = tokio::spawn(body);

        let app = Arc::clone(self);
        tokio::spawn(async move {
            let result = handle.await;

            // Serialize the transition with any gate-holding operation.
            let _gate = app.task_gate.lock().await;
            *app.task.lock().unwrap() = TaskKind::None;

            match result {
                Ok(Ok(())) => app.set_state(STATE_IDLE),
                Ok(Err(err)) => {
                    app.set_state(STATE_ERROR);
                    error!(app = %app.name(), task = %kind, %err, "task failed");
                    *app.task_err.lock().unwrap() = Some(err);
                }
                Err(join_err) => {
                    app.set_state(STATE_ERROR);
                    error!(app = %app.name(), task = %kind, "task panicked: {join_err}");
                    *app.task_err.lock().unwrap() =
                        Some(Error::Runtime(format!("task {kind} panicked: {join_err}")));
                }
            }
        });

        Ok(())
    }
}
