use std::collections::BTreeMap;
use std::process::Stdio;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

use crate::executor::ExecutorDescriptor;
use crate::protocol::RunRequest;

pub const ARG_ENV_PREFIX: &str = "EXECUTOR_CONFIG_";
pub const PLUGIN_ENV_PREFIX: &str = "AGENT_CONFIG_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentErrorCode {
    UnsupportedArgValue,
    UnsupportedPluginValue,
}

impl EnvironmentErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedArgValue => "unsupported_arg_value",
            Self::UnsupportedPluginValue => "unsupported_plugin_value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentError {
    pub code: EnvironmentErrorCode,
    pub key: String,
    pub message: String,
}

impl std::fmt::Display for EnvironmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} key={}: {}", self.code.as_str(), self.key, self.message)
    }
}

impl std::error::Error for EnvironmentError {}

/// The agent's own environment, skipping entries that are not valid UTF-8.
pub fn inherited_environment() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Merges the child environment. Later layers win: inherited, run arguments,
/// plugin arguments, then the executor's static variables.
pub fn build_environment<I>(
    inherited: I,
    request: &RunRequest,
    descriptor: &ExecutorDescriptor,
) -> Result<BTreeMap<String, String>, EnvironmentError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = inherited.into_iter().collect();

    for (key, value) in &request.args {
        let rendered = render_scalar_or_object(value).ok_or_else(|| EnvironmentError {
            code: EnvironmentErrorCode::UnsupportedArgValue,
            key: key.clone(),
            message: format!("argument values cannot be {}", value_kind(value)),
        })?;
        env.insert(format!("{ARG_ENV_PREFIX}{}", key.to_uppercase()), rendered);
    }

    for (key, value) in &request.plugin_args {
        let rendered = match value {
            Value::Array(items) => items
                .iter()
                .map(render_scalar)
                .collect::<Option<Vec<_>>>()
                .map(|items| items.join(",")),
            other => render_scalar_or_object(other),
        }
        .ok_or_else(|| EnvironmentError {
            code: EnvironmentErrorCode::UnsupportedPluginValue,
            key: key.clone(),
            message: format!("plugin values cannot be {}", value_kind(value)),
        })?;
        env.insert(format!("{PLUGIN_ENV_PREFIX}{}", key.to_uppercase()), rendered);
    }

    for (key, value) in descriptor.varenvs() {
        env.insert(key.to_uppercase(), value.clone());
    }
    Ok(env)
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn render_scalar_or_object(value: &Value) -> Option<String> {
    match value {
        Value::Object(_) => serde_json::to_string(value).ok(),
        other => render_scalar(other),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
        _ => "this type",
    }
}

/// Shell invocation used for executor commands and dependency checks.
pub fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut builder = Command::new("cmd");
        builder.arg("/C").arg(command);
        builder
    } else {
        let mut builder = Command::new("sh");
        builder.arg("-c").arg(command);
        builder
    }
}

/// One live executor child. Dropping the handle kills the child.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    executor: String,
    max_size: usize,
}

impl ProcessHandle {
    pub fn spawn(
        descriptor: &ExecutorDescriptor,
        env: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = shell_command(descriptor.command());
        cmd.env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().with_context(|| {
            format!(
                "failed spawning executor {} command={}",
                descriptor.name(),
                descriptor.command()
            )
        })?;
        debug!(
            "executor spawned executor={} pid={}",
            descriptor.name(),
            child.id().unwrap_or_default()
        );
        Ok(Self {
            child,
            executor: descriptor.name().to_owned(),
            max_size: descriptor.max_size(),
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn take_stdout(&mut self) -> Option<BufReader<ChildStdout>> {
        self.child.stdout.take().map(BufReader::new)
    }

    pub fn take_stderr(&mut self) -> Option<BufReader<ChildStderr>> {
        self.child.stderr.take().map(BufReader::new)
    }

    /// Exit code once the child terminates; `-1` when a signal ended it.
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("failed waiting for executor {}", self.executor))?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCheckFailure {
    pub command: String,
    pub exit_code: Option<i32>,
    pub detail: String,
}

impl std::fmt::Display for DependencyCheckFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "check `{}` exited with {code}", self.command),
            None => write!(f, "check `{}` could not run: {}", self.command, self.detail),
        }
    }
}

impl std::error::Error for DependencyCheckFailure {}

/// Runs every dependency-check command in order and stops at the first
/// failure.
pub async fn run_dependency_checks(
    descriptor: &ExecutorDescriptor,
) -> Result<(), DependencyCheckFailure> {
    for check in descriptor.check_cmds() {
        let output = shell_command(check)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| DependencyCheckFailure {
                command: check.clone(),
                exit_code: None,
                detail: err.to_string(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            warn!(
                "dependency check failed executor={} check={check} stderr={stderr}",
                descriptor.name()
            );
            return Err(DependencyCheckFailure {
                command: check.clone(),
                exit_code: Some(output.status.code().unwrap_or(-1)),
                detail: stderr,
            });
        }
        debug!("dependency check ok executor={} check={check}", descriptor.name());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_inbound;
    use tokio::io::AsyncBufReadExt;

    fn descriptor(command: &str, varenvs: &[(&str, &str)]) -> ExecutorDescriptor {
        ExecutorDescriptor::new(
            "probe",
            command,
            1024,
            BTreeMap::new(),
            varenvs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        )
        .expect("descriptor")
    }

    fn request(args: &str, plugin_args: &str) -> RunRequest {
        parse_inbound(&format!(
            r#"{{"action":"RUN","execution_ids":[1],"workspaces":["w"],"executor":"probe","args":{args},"plugin_args":{plugin_args}}}"#
        ))
        .expect("request")
    }

    #[test]
    fn layers_apply_in_order() {
        let inherited = vec![
            ("PATH".to_owned(), "/bin".to_owned()),
            ("API_KEY".to_owned(), "inherited".to_owned()),
            ("EXECUTOR_CONFIG_TARGET".to_owned(), "stale".to_owned()),
        ];
        let env = build_environment(
            inherited,
            &request(
                r#"{"target":"10.0.0.1","ports":443,"fast":true,"opts":{"a":1}}"#,
                r#"{"tags":["x",2],"ignore_info":false}"#,
            ),
            &descriptor("true", &[("api_key", "configured")]),
        )
        .expect("environment");

        assert_eq!(env["PATH"], "/bin");
        assert_eq!(env["API_KEY"], "configured");
        assert_eq!(env["EXECUTOR_CONFIG_TARGET"], "10.0.0.1");
        assert_eq!(env["EXECUTOR_CONFIG_PORTS"], "443");
        assert_eq!(env["EXECUTOR_CONFIG_FAST"], "true");
        assert_eq!(env["EXECUTOR_CONFIG_OPTS"], r#"{"a":1}"#);
        assert_eq!(env["AGENT_CONFIG_TAGS"], "x,2");
        assert_eq!(env["AGENT_CONFIG_IGNORE_INFO"], "false");
    }

    #[test]
    fn list_and_null_arguments_fail_before_spawn() {
        let err = build_environment(
            Vec::new(),
            &request(r#"{"targets":["a","b"]}"#, "{}"),
            &descriptor("true", &[]),
        )
        .expect_err("list argument must fail");
        assert_eq!(err.code, EnvironmentErrorCode::UnsupportedArgValue);
        assert_eq!(err.key, "targets");

        let err = build_environment(
            Vec::new(),
            &request("{}", r#"{"nested":[[1]]}"#),
            &descriptor("true", &[]),
        )
        .expect_err("nested plugin list must fail");
        assert_eq!(err.code, EnvironmentErrorCode::UnsupportedPluginValue);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_child_sees_only_built_environment() {
        let descriptor = descriptor("printf '%s|%s\\n' \"$EXECUTOR_CONFIG_TARGET\" \"$HOME\"", &[]);
        let mut env = BTreeMap::new();
        env.insert("PATH".to_owned(), "/usr/bin:/bin".to_owned());
        env.insert("EXECUTOR_CONFIG_TARGET".to_owned(), "10.0.0.9".to_owned());

        let mut handle = ProcessHandle::spawn(&descriptor, &env).expect("spawn");
        let mut stdout = handle.take_stdout().expect("stdout");
        assert!(handle.take_stdout().is_none());
        let mut line = String::new();
        stdout.read_line(&mut line).await.expect("read line");
        assert_eq!(line, "10.0.0.9|\n");
        assert_eq!(handle.wait().await.expect("wait"), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_is_reported() {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_owned(), "/usr/bin:/bin".to_owned());
        let mut handle = ProcessHandle::spawn(&descriptor("exit 3", &[]), &env).expect("spawn");
        assert_eq!(handle.wait().await.expect("wait"), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dependency_checks_stop_at_first_failure() {
        let passing = descriptor("true", &[]).with_check_cmds(vec!["true".to_owned()]);
        run_dependency_checks(&passing).await.expect("checks pass");

        let failing = descriptor("true", &[]).with_check_cmds(vec![
            "true".to_owned(),
            "echo missing-tool >&2; exit 127".to_owned(),
            "exit 5".to_owned(),
        ]);
        let failure = run_dependency_checks(&failing)
            .await
            .expect_err("second check fails");
        assert_eq!(failure.exit_code, Some(127));
        assert_eq!(failure.detail, "missing-tool");
        assert!(failure.to_string().contains("exited with 127"));
    }
}
