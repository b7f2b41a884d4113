use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{AgentConfig, Config, ExecutorConfig};

/// Placeholder accepted inside a configured command line.
pub const EXECUTORS_DIR_PLACEHOLDER: &str = "{executors_dir}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    List,
    Range,
    Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseType {
    String,
    Integer,
    Boolean,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default)]
    pub mandatory: bool,
    #[serde(rename = "type", default = "default_param_type")]
    pub kind: ParamType,
    #[serde(default = "default_base_type")]
    pub base: BaseType,
}

impl ParamSpec {
    pub fn new(mandatory: bool, kind: ParamType) -> Self {
        let base = match kind {
            ParamType::Integer => BaseType::Integer,
            ParamType::Boolean => BaseType::Boolean,
            ParamType::List => BaseType::List,
            ParamType::String | ParamType::Range | ParamType::Url => BaseType::String,
        };
        Self {
            mandatory,
            kind,
            base,
        }
    }

    /// Checks one passed argument value against the declared type.
    pub fn check_value(&self, value: &Value) -> Result<(), String> {
        match self.kind {
            ParamType::String => match value {
                Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(()),
                other => Err(format!("expected a string, got {}", json_kind(other))),
            },
            ParamType::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
                Value::String(text) if text.trim().parse::<i64>().is_ok() => Ok(()),
                other => Err(format!("expected an integer, got {}", describe(other))),
            },
            ParamType::Boolean => match value {
                Value::Bool(_) => Ok(()),
                Value::String(text)
                    if matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "false") =>
                {
                    Ok(())
                }
                other => Err(format!("expected a boolean, got {}", describe(other))),
            },
            ParamType::List => match value {
                Value::String(text)
                    if text.split(',').all(|item| !item.trim().is_empty()) =>
                {
                    Ok(())
                }
                other => Err(format!(
                    "expected a comma-separated list, got {}",
                    describe(other)
                )),
            },
            ParamType::Range => match value {
                Value::Number(n) if n.is_u64() => Ok(()),
                Value::String(text) if parse_range(text).is_some() => Ok(()),
                other => Err(format!(
                    "expected a range like 1-1024, got {}",
                    describe(other)
                )),
            },
            ParamType::Url => match value {
                Value::String(text) => match url::Url::parse(text.trim()) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
                    Ok(parsed) => Err(format!("unsupported url scheme `{}`", parsed.scheme())),
                    Err(err) => Err(format!("invalid url: {err}")),
                },
                other => Err(format!("expected a url, got {}", json_kind(other))),
            },
        }
    }
}

fn default_param_type() -> ParamType {
    ParamType::String
}

fn default_base_type() -> BaseType {
    BaseType::String
}

fn parse_range(text: &str) -> Option<(u64, u64)> {
    let trimmed = text.trim();
    match trimmed.split_once('-') {
        Some((start, end)) => {
            let start = start.trim().parse::<u64>().ok()?;
            let end = end.trim().parse::<u64>().ok()?;
            (start <= end).then_some((start, end))
        }
        None => trimmed.parse::<u64>().ok().map(|value| (value, value)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(text) => format!("`{text}`"),
        other => json_kind(other).to_owned(),
    }
}

pub fn validate_executor_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("executor name must not be empty");
    }
    if name.contains(' ') {
        anyhow::bail!("executor name `{name}` must not contain spaces");
    }
    Ok(())
}

/// Shape of `<script stem>_manifest.json` next to a packaged executor.
#[derive(Debug, Clone, Deserialize)]
struct ExecutorManifest {
    #[serde(default)]
    arguments: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    environment_variables: Vec<String>,
    check_cmds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorDescriptor {
    name: String,
    command: String,
    repo_sourced: bool,
    max_size: usize,
    params: BTreeMap<String, ParamSpec>,
    varenvs: BTreeMap<String, String>,
    check_cmds: Vec<String>,
}

impl ExecutorDescriptor {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        max_size: usize,
        params: BTreeMap<String, ParamSpec>,
        varenvs: BTreeMap<String, String>,
    ) -> Result<Self> {
        let name = name.into();
        validate_executor_name(&name)?;
        let command = command.into();
        if command.trim().is_empty() {
            anyhow::bail!("executor `{name}` has an empty command");
        }
        if max_size == 0 {
            anyhow::bail!("executor `{name}` max_size must be > 0");
        }
        Ok(Self {
            name,
            command,
            repo_sourced: false,
            max_size,
            params,
            varenvs,
            check_cmds: Vec::new(),
        })
    }

    pub fn with_check_cmds(mut self, check_cmds: Vec<String>) -> Self {
        self.check_cmds = check_cmds;
        self
    }

    pub fn from_config(name: &str, cfg: &ExecutorConfig, agent: &AgentConfig) -> Result<Self> {
        match cfg.repo_executor.as_deref() {
            Some(script) => Self::from_manifest(name, script, cfg, agent),
            None => {
                let command = expand_command(&cfg.cmd, &agent.executors_dir);
                Ok(Self::new(
                    name,
                    command,
                    cfg.max_size,
                    cfg.params.clone(),
                    cfg.varenvs.clone(),
                )?
                .with_check_cmds(cfg.check_cmds.clone()))
            }
        }
    }

    fn from_manifest(
        name: &str,
        script: &str,
        cfg: &ExecutorConfig,
        agent: &AgentConfig,
    ) -> Result<Self> {
        let script_path = agent.executors_dir.join(script);
        let manifest_path = manifest_path_for(&script_path);
        let raw = std::fs::read_to_string(&manifest_path).with_context(|| {
            format!(
                "failed reading manifest {} for executor `{name}`",
                manifest_path.display()
            )
        })?;
        let manifest: ExecutorManifest = serde_json::from_str(&raw).with_context(|| {
            format!(
                "failed parsing manifest {} for executor `{name}`",
                manifest_path.display()
            )
        })?;

        let mut varenvs = BTreeMap::new();
        for variable in &manifest.environment_variables {
            let value = cfg
                .varenvs
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(variable))
                .map(|(_, value)| value.clone())
                .with_context(|| {
                    format!("executor `{name}` requires environment variable `{variable}` in varenvs")
                })?;
            varenvs.insert(variable.clone(), value);
        }

        let command = format!(
            "{} {}",
            shell_quote(&agent.interpreter),
            shell_quote(&script_path.to_string_lossy())
        );
        let mut descriptor = Self::new(name, command, cfg.max_size, manifest.arguments, varenvs)?
            .with_check_cmds(manifest.check_cmds);
        descriptor.repo_sourced = true;
        Ok(descriptor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_repo_sourced(&self) -> bool {
        self.repo_sourced
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn params(&self) -> &BTreeMap<String, ParamSpec> {
        &self.params
    }

    pub fn varenvs(&self) -> &BTreeMap<String, String> {
        &self.varenvs
    }

    pub fn check_cmds(&self) -> &[String] {
        &self.check_cmds
    }
}

fn manifest_path_for(script_path: &Path) -> PathBuf {
    let stem = script_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    script_path.with_file_name(format!("{stem}_manifest.json"))
}

fn expand_command(command: &str, executors_dir: &Path) -> String {
    if command.contains(EXECUTORS_DIR_PLACEHOLDER) {
        command.replace(
            EXECUTORS_DIR_PLACEHOLDER,
            &executors_dir.to_string_lossy(),
        )
    } else {
        command.to_owned()
    }
}

pub fn shell_quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '.' | '_' | '-' | ':' | '+'))
    {
        return token.to_owned();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

/// Executor entry announced to the server when joining.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorAnnouncement {
    pub executor_name: String,
    pub args: BTreeMap<String, ParamSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<ExecutorDescriptor>>,
}

impl ExecutorRegistry {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut registry = Self::default();
        for (name, executor) in &cfg.executors {
            registry.insert(ExecutorDescriptor::from_config(name, executor, &cfg.agent)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, descriptor: ExecutorDescriptor) {
        self.executors
            .insert(descriptor.name().to_owned(), Arc::new(descriptor));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ExecutorDescriptor>> {
        self.executors.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutorDescriptor> {
        self.executors.values().map(AsRef::as_ref)
    }

    pub fn announcements(&self) -> Vec<ExecutorAnnouncement> {
        self.iter()
            .map(|descriptor| ExecutorAnnouncement {
                executor_name: descriptor.name().to_owned(),
                args: descriptor.params().clone(),
            })
            .collect()
    }
}
