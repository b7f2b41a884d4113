use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::ServerConfig;

/// Run metadata attached to every forwarded result.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub executor_name: String,
    pub command: String,
    pub execution_ids: Vec<Value>,
    pub workspaces: Vec<String>,
    pub args: Map<String, Value>,
    pub started_at_ms: u64,
}

impl RunContext {
    /// Body posted for one result line.
    pub fn result_body(&self, payload: Value) -> Value {
        let mut body = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_owned(), other);
                map
            }
        };
        body.insert(
            "execution_ids".to_owned(),
            Value::Array(self.execution_ids.clone()),
        );
        body.insert(
            "command".to_owned(),
            json!({
                "tool": self.executor_name,
                "command": self.command,
                "params": Value::Object(self.args.clone()),
                "import_source": "agent",
                "start_date": self.started_at_ms,
            }),
        );
        Value::Object(body)
    }
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn forward(&self, ctx: &RunContext, payload: Value) -> Result<()>;
}

/// Posts results to every target workspace's bulk endpoint.
pub struct HttpResultSink {
    http: Client,
    api_base_url: String,
    agent_token: String,
}

impl HttpResultSink {
    pub fn new(http: Client, server: &ServerConfig, agent_token: impl Into<String>) -> Self {
        Self {
            http,
            api_base_url: server.api_base_url(),
            agent_token: agent_token.into(),
        }
    }

    pub fn bulk_create_url(&self, workspace: &str) -> String {
        format!("{}/_api/v3/ws/{workspace}/bulk_create", self.api_base_url)
    }

    /// No request timeout: large scan results may take a while to upload.
    async fn post_result(&self, url: &str, body: &Value) -> reqwest::Result<reqwest::Response> {
        self.http
            .post(url)
            .header("Authorization", format!("Agent {}", self.agent_token))
            .json(body)
            .send()
            .await
    }
}

#[async_trait]
impl ResultSink for HttpResultSink {
    async fn forward(&self, ctx: &RunContext, payload: Value) -> Result<()> {
        let body = ctx.result_body(payload);
        for workspace in &ctx.workspaces {
            let url = self.bulk_create_url(workspace);
            match self.post_result(&url, &body).await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        "result forwarded executor={} workspace={workspace}",
                        ctx.executor_name
                    );
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    warn!(
                        "result rejected executor={} workspace={workspace} status={status} body={}",
                        ctx.executor_name,
                        truncate_text(&text, 240)
                    );
                }
                Err(err) => warn!(
                    "result upload failed executor={} workspace={workspace} error={err}",
                    ctx.executor_name
                ),
            }
        }
        Ok(())
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_owned();
    }
    let mut out = value.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}
