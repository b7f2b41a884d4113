use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{Config, CHANNEL_TOKEN_PATH, INFO_PATH, REGISTRATION_PATH};
use crate::coordinator::RunCoordinator;
use crate::executor::ExecutorRegistry;
use crate::protocol::AgentMessage;
use crate::reachability::ReachabilityChecker;
use crate::registration::{
    request_agent_token, request_channel_token, validate_registration_token, RegistrationError,
    RegistrationErrorCode, RetryPolicy,
};
use crate::sink::{HttpResultSink, ResultSink};
use crate::task_set::RunTaskSet;
use crate::tls::{build_http_client, websocket_connector};

const NORMAL_CLOSE: u16 = 1000;
const LEAVE_SEND_TIMEOUT: Duration = Duration::from_secs(1);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type ChannelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sending side of the single channel writer. Clones share one queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, message: &AgentMessage) -> bool {
        match message.to_text() {
            Ok(text) => self.tx.send(Message::Text(text)).await.is_ok(),
            Err(err) => {
                warn!("failed encoding outbound message error={err}");
                false
            }
        }
    }

    pub async fn send_value(&self, value: &Value) -> bool {
        self.tx.send(Message::Text(value.to_string())).await.is_ok()
    }

    async fn send_frame(&self, message: Message) -> bool {
        self.tx.send(message).await.is_ok()
    }

    fn try_send_frame(&self, message: Message) -> bool {
        self.tx.try_send(message).is_ok()
    }
}

struct OpenChannel {
    outbox: Outbox,
    writer: JoinHandle<()>,
}

/// Why the receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEnd {
    ServerClosed(Option<String>),
    Abrupt(String),
}

pub struct ConnectionSession {
    config: Config,
    config_path: PathBuf,
    http: Client,
    executors: Arc<ExecutorRegistry>,
    channel_token: Option<String>,
    channel: Option<OpenChannel>,
    runs: RunTaskSet,
    probes: JoinSet<bool>,
    probe_cancel: watch::Sender<bool>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl ConnectionSession {
    pub fn new(config: Config, config_path: PathBuf) -> Result<Self> {
        let http = build_http_client(&config.server)?;
        let executors = Arc::new(ExecutorRegistry::from_config(&config)?);
        let (probe_cancel, _) = watch::channel(false);
        Ok(Self {
            config,
            config_path,
            http,
            executors,
            channel_token: None,
            channel: None,
            runs: RunTaskSet::new(),
            probes: JoinSet::new(),
            probe_cancel,
            sink: None,
        })
    }

    /// Replaces the HTTP result sink.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn agent_token(&self) -> Option<&str> {
        self.config.tokens.agent.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn in_flight_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn pending_probes(&self) -> usize {
        self.probes.len()
    }

    fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.http_timeout_secs.max(1))
    }

    pub fn reachability_checker(&self) -> ReachabilityChecker {
        ReachabilityChecker::new(
            self.http.clone(),
            self.config.server.api_url(INFO_PATH),
            self.http_timeout(),
            self.probe_cancel.subscribe(),
        )
    }

    /// Makes sure a persisted agent token and a fresh channel token exist.
    pub async fn register(
        &mut self,
        registration_token: Option<&str>,
    ) -> Result<(), RegistrationError> {
        let pending_token = if self.config.tokens.agent.is_some() {
            None
        } else {
            let token = registration_token
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .ok_or_else(|| {
                    RegistrationError::new(
                        RegistrationErrorCode::MissingToken,
                        "no agent token stored; pass a registration token with --token",
                    )
                })?;
            validate_registration_token(token)?;
            Some(token)
        };

        let checker = self.reachability_checker();
        if !checker.check_connection().await {
            return Err(RegistrationError::new(
                RegistrationErrorCode::Unreachable,
                format!("server unreachable url={}", checker.info_url()),
            ));
        }

        if let Some(token) = pending_token {
            let retry = RetryPolicy {
                attempts: self.config.agent.registration_attempts,
                delay: Duration::from_millis(self.config.agent.registration_retry_delay_ms),
            };
            let agent_token = request_agent_token(
                &self.http,
                &self.config.server.api_url(REGISTRATION_PATH),
                token,
                &self.config.agent.agent_name,
                retry,
                self.http_timeout(),
            )
            .await?;
            Config::persist_agent_token(&self.config_path, &agent_token).map_err(|err| {
                RegistrationError::new(
                    RegistrationErrorCode::Persist,
                    format!("failed persisting agent token: {err:#}"),
                )
            })?;
            self.config.tokens.agent = Some(agent_token);
            info!(
                "agent token stored config={}",
                self.config_path.display()
            );
        }

        self.refresh_channel_token().await?;
        Ok(())
    }

    async fn refresh_channel_token(&mut self) -> Result<String, RegistrationError> {
        let agent_token = self.config.tokens.agent.clone().ok_or_else(|| {
            RegistrationError::new(
                RegistrationErrorCode::MissingToken,
                "no agent token available for the channel token exchange",
            )
        })?;
        match request_channel_token(
            &self.http,
            &self.config.server.api_url(CHANNEL_TOKEN_PATH),
            &agent_token,
            self.http_timeout(),
        )
        .await
        {
            Ok(token) => {
                debug!("channel token refreshed");
                self.channel_token = Some(token.clone());
                Ok(token)
            }
            Err(err) => {
                if err.code == RegistrationErrorCode::InvalidAgentToken {
                    self.config.tokens.agent = None;
                }
                self.channel_token = None;
                Err(err)
            }
        }
    }

    async fn open_socket(&self) -> Result<ChannelStream, tungstenite::Error> {
        let url = self.config.server.websocket_url();
        let connector = websocket_connector(&self.config.server)
            .map_err(|err| tungstenite::Error::Io(std::io::Error::other(format!("{err:#}"))))?;
        let (ws, _) = connect_async_tls_with_config(url, None, false, connector).await?;
        Ok(ws)
    }

    /// Opens the channel, joins, and runs the receive loop until the server
    /// closes it or the transport fails.
    pub async fn connect(&mut self) -> Result<ChannelEnd> {
        if self.channel_token.is_none() {
            self.refresh_channel_token().await?;
        }
        let url = self.config.server.websocket_url();
        let ws = match self.open_socket().await {
            Ok(ws) => ws,
            Err(err) if is_auth_rejection(&err) => {
                warn!("channel upgrade refused url={url} error={err}; refreshing channel token");
                self.refresh_channel_token().await?;
                self.open_socket()
                    .await
                    .with_context(|| format!("failed opening channel {url}"))?
            }
            Err(err) => return Err(err).with_context(|| format!("failed opening channel {url}")),
        };
        info!("channel connected url={url}");

        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) =
            mpsc::channel::<Message>(self.config.agent.outbound_queue_capacity.max(1));
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });
        let outbox = Outbox::new(out_tx);
        self.channel = Some(OpenChannel {
            outbox: outbox.clone(),
            writer,
        });

        let join = AgentMessage::Join {
            token: self.channel_token.clone().unwrap_or_default(),
            executors: self.executors.announcements(),
        };
        if !outbox.send(&join).await {
            anyhow::bail!("channel closed before JOIN_AGENT was sent");
        }
        info!(
            "joined as agent={} executors={}",
            self.config.agent.agent_name,
            self.executors.len()
        );

        let coordinator = RunCoordinator::new(
            self.config.agent.agent_name.clone(),
            self.executors.clone(),
            outbox.clone(),
            self.result_sink(),
        );

        let end = loop {
            let inbound = read.next().await;
            self.runs.reap();
            match inbound {
                Some(Ok(Message::Text(text))) => {
                    let coordinator = coordinator.clone();
                    self.runs.spawn(async move {
                        coordinator.handle_frame(&text).await;
                    });
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = outbox.try_send_frame(Message::Pong(payload));
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|frame| {
                        format!("code={} reason={}", u16::from(frame.code), frame.reason)
                    });
                    info!(
                        "server closed channel {}",
                        reason.as_deref().unwrap_or("without reason")
                    );
                    break ChannelEnd::ServerClosed(reason);
                }
                Some(Ok(Message::Binary(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(err)) => {
                    warn!("channel lost error={err}");
                    self.spawn_probe();
                    break ChannelEnd::Abrupt(err.to_string());
                }
                None => {
                    warn!("channel ended without close frame");
                    self.spawn_probe();
                    break ChannelEnd::Abrupt("stream ended".to_owned());
                }
            }
        };
        Ok(end)
    }

    fn result_sink(&self) -> Arc<dyn ResultSink> {
        match &self.sink {
            Some(sink) => sink.clone(),
            None => Arc::new(HttpResultSink::new(
                self.http.clone(),
                &self.config.server,
                self.config.tokens.agent.clone().unwrap_or_default(),
            )),
        }
    }

    fn spawn_probe(&mut self) {
        let checker = self.reachability_checker();
        self.probes.spawn(async move {
            let reachable = checker.check_connection().await;
            if reachable {
                info!("server api still reachable; the channel endpoint dropped the connection");
            }
            reachable
        });
    }

    /// Leaves the channel and stops all work. Safe to call repeatedly; only
    /// the first call with an open channel sends anything.
    pub async fn close(&mut self, reason: &str) {
        if let Some(mut channel) = self.channel.take() {
            let leave = AgentMessage::Leave {
                token: self.channel_token.clone().unwrap_or_default(),
                reason: reason.to_owned(),
            };
            match tokio::time::timeout(LEAVE_SEND_TIMEOUT, channel.outbox.send(&leave)).await {
                Ok(true) => debug!("leave notice queued reason={reason}"),
                _ => debug!("leave notice not delivered reason={reason}"),
            }

            let cancelled = self.runs.cancel_all().await;
            if cancelled > 0 {
                info!("cancelled in-flight runs count={cancelled}");
            }

            let _ = tokio::time::timeout(
                LEAVE_SEND_TIMEOUT,
                channel
                    .outbox
                    .send_frame(Message::Close(Some(close_frame(NORMAL_CLOSE, reason)))),
            )
            .await;
            drop(channel.outbox);
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut channel.writer)
                .await
                .is_err()
            {
                error!("channel writer did not stop in time; aborting it");
                channel.writer.abort();
            }
            info!("channel closed reason={reason}");
        } else {
            self.runs.cancel_all().await;
        }

        self.probe_cancel.send_replace(true);
        self.probes.shutdown().await;
        tokio::time::sleep(Duration::from_millis(self.config.agent.close_grace_ms)).await;
    }
}

fn is_auth_rejection(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::Http(response) if matches!(response.status().as_u16(), 401 | 403)
    )
}

fn close_frame(code: u16, reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_owned().into(),
    }
}
