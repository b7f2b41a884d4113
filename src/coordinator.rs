use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutorDescriptor, ExecutorRegistry};
use crate::line_processor::{process_stderr, process_stdout, ResultForwarder};
use crate::process::{
    build_environment, inherited_environment, run_dependency_checks, ProcessHandle,
};
use crate::protocol::{parse_inbound, AgentMessage, RunRequest, RunStatus};
use crate::session::Outbox;
use crate::sink::{now_ms, ResultSink, RunContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Received,
    Validated,
    Running,
    Succeeded,
    Failed,
    /// Stopped before anything was spawned.
    Rejected,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

/// Every argument problem found in one pass over a run request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub unexpected: Vec<String>,
    pub missing_mandatory: Vec<String>,
    pub invalid: Vec<(String, String)>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.unexpected.is_empty() && self.missing_mandatory.is_empty() && self.invalid.is_empty()
    }

    pub fn message(&self, executor: &str, agent: &str) -> String {
        let mut parts = Vec::new();
        if !self.unexpected.is_empty() {
            parts.push(format!(
                "unexpected argument(s) {}",
                self.unexpected.join(", ")
            ));
        }
        if !self.missing_mandatory.is_empty() {
            parts.push(format!(
                "mandatory argument(s) not passed {}",
                self.missing_mandatory.join(", ")
            ));
        }
        if !self.invalid.is_empty() {
            let invalid = self
                .invalid
                .iter()
                .map(|(name, reason)| format!("{name} ({reason})"))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("invalid argument value(s) {invalid}"));
        }
        format!(
            "Invalid arguments for {executor} executor from {agent} agent: {}",
            parts.join("; ")
        )
    }
}

/// Checks passed arguments against the declared parameters. A passed key is
/// accepted when it contains a declared name; a mandatory name is satisfied
/// when some passed key contains it. Type checks use exact names.
pub fn validate_arguments(
    descriptor: &ExecutorDescriptor,
    args: &Map<String, Value>,
) -> ValidationReport {
    let params = descriptor.params();
    let mut report = ValidationReport::default();
    for (key, value) in args {
        if !params.keys().any(|name| key.contains(name.as_str())) {
            report.unexpected.push(key.clone());
            continue;
        }
        if let Some(spec) = params.get(key) {
            if let Err(reason) = spec.check_value(value) {
                report.invalid.push((key.clone(), reason));
            }
        }
    }
    for (name, spec) in params {
        if spec.mandatory && !args.keys().any(|key| key.contains(name.as_str())) {
            report.missing_mandatory.push(name.clone());
        }
    }
    report
}

/// Drives one run request from its raw frame to a terminal status.
#[derive(Clone)]
pub struct RunCoordinator {
    agent_name: String,
    executors: Arc<ExecutorRegistry>,
    outbox: Outbox,
    sink: Arc<dyn ResultSink>,
}

impl RunCoordinator {
    pub fn new(
        agent_name: impl Into<String>,
        executors: Arc<ExecutorRegistry>,
        outbox: Outbox,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            executors,
            outbox,
            sink,
        }
    }

    /// Never fails: protocol problems become structured replies and any error
    /// or panic during the run becomes a failed status.
    pub async fn handle_frame(&self, text: &str) -> RunState {
        let request = match parse_inbound(text) {
            Ok(request) => request,
            Err(err) => {
                warn!("rejected inbound frame error={err}");
                self.outbox.send_value(&err.response()).await;
                return RunState::Rejected;
            }
        };
        let execution_ids = request.execution_ids.clone();
        let executor = request.executor.clone();
        debug!(
            "run state={} executor={} execution_ids={execution_ids:?}",
            RunState::Received.as_str(),
            executor.as_deref().unwrap_or("-")
        );

        let outcome = AssertUnwindSafe(self.execute(request)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(state)) => return state,
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => panic_message(panic.as_ref()),
        };
        let name = executor.as_deref().unwrap_or("unknown");
        error!("run failed executor={name} error={failure}");
        self.send_status(RunStatus {
            execution_ids,
            executor_name: executor.clone(),
            running: Some(false),
            successful: Some(false),
            message: format!(
                "Executor {name} from {} failed: {failure}",
                self.agent_name
            ),
        })
        .await;
        RunState::Failed
    }

    async fn execute(&self, request: RunRequest) -> Result<RunState> {
        let agent = &self.agent_name;
        let ids = &request.execution_ids;

        let Some(executor_name) = request.executor.as_deref() else {
            self.send_status(RunStatus::rejected(
                ids,
                None,
                format!("No executor selected to {agent} agent"),
            ))
            .await;
            return Ok(RunState::Rejected);
        };
        let Some(descriptor) = self.executors.get(executor_name) else {
            warn!("unknown executor requested executor={executor_name}");
            self.send_status(RunStatus::rejected(
                ids,
                Some(executor_name),
                format!("The selected executor {executor_name} not exists in {agent} agent"),
            ))
            .await;
            return Ok(RunState::Rejected);
        };

        let report = validate_arguments(&descriptor, &request.args);
        if !report.is_empty() {
            let message = report.message(executor_name, agent);
            warn!("run rejected executor={executor_name} reason={message}");
            self.send_status(RunStatus::rejected(ids, Some(executor_name), message))
                .await;
            return Ok(RunState::Rejected);
        }
        debug!(
            "run state={} executor={executor_name}",
            RunState::Validated.as_str()
        );

        if let Err(failure) = run_dependency_checks(&descriptor).await {
            self.send_status(RunStatus::finished(
                ids,
                executor_name,
                false,
                format!(
                    "Dependency check failed for {executor_name} executor from {agent} agent: {failure}"
                ),
            ))
            .await;
            return Ok(RunState::Failed);
        }

        let env = match build_environment(inherited_environment(), &request, &descriptor) {
            Ok(env) => env,
            Err(err) => {
                warn!("run environment rejected executor={executor_name} error={err}");
                self.send_status(RunStatus::finished(
                    ids,
                    executor_name,
                    false,
                    format!("Executor {executor_name} from {agent} failed: {err}"),
                ))
                .await;
                return Ok(RunState::Failed);
            }
        };

        let mut handle = ProcessHandle::spawn(&descriptor, &env)?;
        let stdout = handle
            .take_stdout()
            .context("executor stdout was not captured")?;
        let stderr = handle
            .take_stderr()
            .context("executor stderr was not captured")?;
        self.send_status(RunStatus::running(
            ids,
            executor_name,
            format!("Running {executor_name} executor from {agent} agent"),
        ))
        .await;
        info!(
            "run state={} executor={executor_name} execution_ids={ids:?}",
            RunState::Running.as_str()
        );

        let forwarder = ResultForwarder::new(
            self.sink.clone(),
            RunContext {
                executor_name: executor_name.to_owned(),
                command: descriptor.command().to_owned(),
                execution_ids: ids.clone(),
                workspaces: request.workspaces.clone(),
                args: request.args.clone(),
                started_at_ms: now_ms(),
            },
        );
        let max_size = handle.max_size();
        let (out_summary, err_summary, exit_code) = tokio::join!(
            process_stdout(stdout, max_size, &forwarder),
            process_stderr(stderr, max_size, executor_name),
            handle.wait(),
        );
        let exit_code = exit_code?;

        let successful = exit_code == 0;
        let state = if successful {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        info!(
            "run state={} executor={executor_name} exit_code={exit_code} forwarded={} dropped={} oversized={} stderr_lines={}",
            state.as_str(),
            out_summary.forwarded,
            out_summary.dropped,
            out_summary.oversized + err_summary.oversized,
            err_summary.lines
        );
        for (stream, summary) in [("stdout", &out_summary), ("stderr", &err_summary)] {
            if let Some(err) = summary.read_error.as_deref() {
                warn!("run output cut short executor={executor_name} stream={stream} error={err}");
            }
        }
        let message = if successful {
            format!("Executor {executor_name} from {agent} finished successfully")
        } else {
            format!("Executor {executor_name} from {agent} failed")
        };
        self.send_status(RunStatus::finished(ids, executor_name, successful, message))
            .await;
        Ok(state)
    }

    async fn send_status(&self, status: RunStatus) {
        if !self.outbox.send(&AgentMessage::RunStatus(status)).await {
            warn!("run status dropped: channel closed");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("panic: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("panic: {text}")
    } else {
        "panic".to_owned()
    }
}
