use std::error::Error as _;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReachabilityFailure {
    Tls(String),
    Refused(String),
    Timeout,
    Status(u16),
    Transport(String),
    Cancelled,
}

impl ReachabilityFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls(_) => "tls",
            Self::Refused(_) => "refused",
            Self::Timeout => "timeout",
            Self::Status(_) => "status",
            Self::Transport(_) => "transport",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Pre-flight probe against the server info endpoint.
#[derive(Debug, Clone)]
pub struct ReachabilityChecker {
    http: Client,
    info_url: String,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

impl ReachabilityChecker {
    pub fn new(
        http: Client,
        info_url: impl Into<String>,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            http,
            info_url: info_url.into(),
            timeout,
            cancel,
        }
    }

    pub fn info_url(&self) -> &str {
        &self.info_url
    }

    /// Returns `true` only when the server answered with a 2xx. Every failure
    /// is logged here and never escapes.
    pub async fn check_connection(&self) -> bool {
        match self.probe().await {
            Ok(()) => {
                debug!("reachability ok url={}", self.info_url);
                true
            }
            Err(failure) => {
                self.log_failure(&failure);
                false
            }
        }
    }

    pub async fn probe(&self) -> Result<(), ReachabilityFailure> {
        if *self.cancel.borrow() {
            return Err(ReachabilityFailure::Cancelled);
        }
        let request = self.http.get(&self.info_url).timeout(self.timeout).send();
        let response = tokio::select! {
            _ = cancelled(self.cancel.clone()) => return Err(ReachabilityFailure::Cancelled),
            response = request => response,
        };
        match response {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(ReachabilityFailure::Status(response.status().as_u16())),
            Err(err) => Err(classify_error(&err)),
        }
    }

    fn log_failure(&self, failure: &ReachabilityFailure) {
        let url = &self.info_url;
        debug!("reachability failed kind={} url={url}", failure.as_str());
        match failure {
            ReachabilityFailure::Tls(detail) => error!(
                "server certificate rejected url={url} detail={detail}; check server.ssl_cert or disable server.ssl"
            ),
            ReachabilityFailure::Refused(detail) => error!(
                "connection refused url={url} detail={detail}; check server.host and server.api_port"
            ),
            ReachabilityFailure::Timeout => error!(
                "server did not answer in {}s url={url}; check the network path or raise server.http_timeout_secs",
                self.timeout.as_secs()
            ),
            ReachabilityFailure::Status(status) => error!(
                "server answered status={status} url={url}; check that the host serves the api"
            ),
            ReachabilityFailure::Transport(detail) => {
                error!("server unreachable url={url} detail={detail}")
            }
            ReachabilityFailure::Cancelled => info!("reachability probe cancelled url={url}"),
        }
    }
}

async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn classify_error(err: &reqwest::Error) -> ReachabilityFailure {
    let detail = error_chain(err);
    if err.is_timeout() {
        return ReachabilityFailure::Timeout;
    }
    let lowered = detail.to_ascii_lowercase();
    if ["certificate", "tls", "handshake", "unknownissuer"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        return ReachabilityFailure::Tls(detail);
    }
    if err.is_connect() {
        return ReachabilityFailure::Refused(detail);
    }
    ReachabilityFailure::Transport(detail)
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}
