use std::future::Future;

use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

/// In-flight run tasks for one session. A failing task is logged and never
/// affects its siblings.
#[derive(Debug, Default)]
pub struct RunTaskSet {
    tasks: JoinSet<()>,
}

impl RunTaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        self.tasks.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Collects finished tasks without waiting. Returns how many were reaped.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(outcome) = self.tasks.try_join_next() {
            log_outcome(outcome);
            reaped += 1;
        }
        reaped
    }

    /// Aborts every running task and waits until each one has stopped.
    /// Returns how many tasks were still running.
    pub async fn cancel_all(&mut self) -> usize {
        let running = self.tasks.len();
        self.tasks.abort_all();
        while let Some(outcome) = self.tasks.join_next().await {
            log_outcome(outcome);
        }
        running
    }
}

fn log_outcome(outcome: Result<(), JoinError>) {
    match outcome {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => debug!("run task cancelled"),
        Err(err) => error!("run task failed error={err}"),
    }
}
