use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

pub const REGISTRATION_TOKEN_LEN: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationErrorCode {
    Unreachable,
    InvalidTokenFormat,
    MissingToken,
    NotFound,
    Unauthorized,
    LicenseInvalid,
    InvalidAgentToken,
    Transport,
    UnexpectedResponse,
    Persist,
}

impl RegistrationErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::InvalidTokenFormat => "invalid_token_format",
            Self::MissingToken => "missing_token",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::LicenseInvalid => "license_invalid",
            Self::InvalidAgentToken => "invalid_agent_token",
            Self::Transport => "transport_error",
            Self::UnexpectedResponse => "unexpected_response",
            Self::Persist => "persist_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationError {
    pub code: RegistrationErrorCode,
    pub message: String,
}

impl RegistrationError {
    pub fn new(code: RegistrationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Every registration abort ends the process with the same code.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for RegistrationError {}

type RegistrationResult<T> = Result<T, RegistrationError>;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

pub fn validate_registration_token(token: &str) -> RegistrationResult<()> {
    if token.len() == REGISTRATION_TOKEN_LEN && token.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(());
    }
    Err(RegistrationError::new(
        RegistrationErrorCode::InvalidTokenFormat,
        format!(
            "registration token must be exactly {REGISTRATION_TOKEN_LEN} digits; copy it again from the server agents page"
        ),
    ))
}

/// Trades a one-time registration token for the long-lived agent token.
pub async fn request_agent_token(
    http: &Client,
    url: &str,
    registration_token: &str,
    agent_name: &str,
    retry: RetryPolicy,
    timeout: Duration,
) -> RegistrationResult<String> {
    validate_registration_token(registration_token)?;
    let body = json!({ "token": registration_token, "name": agent_name });
    let attempts = retry.attempts.max(1);
    let mut attempt = 0;
    let response = loop {
        attempt += 1;
        match http.post(url).json(&body).timeout(timeout).send().await {
            Ok(response) => break response,
            Err(err) if attempt < attempts => {
                warn!(
                    "registration request failed attempt={attempt}/{attempts} url={url} error={err}; retrying in {}ms",
                    retry.delay.as_millis()
                );
                tokio::time::sleep(retry.delay).await;
            }
            Err(err) => {
                return Err(RegistrationError::new(
                    RegistrationErrorCode::Transport,
                    format!("registration failed after {attempts} attempts url={url}: {err}"),
                ))
            }
        }
    };

    match response.status() {
        status if status.is_success() => {
            let parsed = response.json::<TokenResponse>().await.map_err(|err| {
                RegistrationError::new(
                    RegistrationErrorCode::UnexpectedResponse,
                    format!("registration response without token: {err}"),
                )
            })?;
            info!("agent registered name={agent_name}");
            Ok(parsed.token)
        }
        StatusCode::NOT_FOUND => Err(RegistrationError::new(
            RegistrationErrorCode::NotFound,
            format!("server unreachable at this path url={url}; check server.host and server.api_port"),
        )),
        StatusCode::UNAUTHORIZED => Err(RegistrationError::new(
            RegistrationErrorCode::Unauthorized,
            "invalid registration token; generate a new one on the server and pass it with --token",
        )),
        status => Err(RegistrationError::new(
            RegistrationErrorCode::UnexpectedResponse,
            format!("registration rejected status={}", status.as_u16()),
        )),
    }
}

/// Exchanges the agent token for a short-lived channel token.
pub async fn request_channel_token(
    http: &Client,
    url: &str,
    agent_token: &str,
    timeout: Duration,
) -> RegistrationResult<String> {
    let response = http
        .post(url)
        .header("Authorization", format!("Agent {agent_token}"))
        .timeout(timeout)
        .send()
        .await
        .map_err(|err| {
            RegistrationError::new(
                RegistrationErrorCode::Transport,
                format!("channel token request failed url={url}: {err}"),
            )
        })?;

    match response.status() {
        status if status.is_success() => response
            .json::<TokenResponse>()
            .await
            .map(|parsed| parsed.token)
            .map_err(|err| {
                RegistrationError::new(
                    RegistrationErrorCode::UnexpectedResponse,
                    format!("channel token response without token: {err}"),
                )
            }),
        StatusCode::PAYMENT_REQUIRED => Err(RegistrationError::new(
            RegistrationErrorCode::LicenseInvalid,
            "server license is invalid or expired",
        )),
        status => Err(RegistrationError::new(
            RegistrationErrorCode::InvalidAgentToken,
            format!(
                "invalid agent token status={}; clear tokens.agent and register again with --token",
                status.as_u16()
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port_addr, spawn_http_stub};

    const GOOD_TOKEN: &str = "1234567890123456789012345";

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn token_format_requires_exactly_25_digits() {
        validate_registration_token(GOOD_TOKEN).expect("good token");
        for bad in ["", "123", "123456789012345678901234a", "12345678901234567890123456"] {
            let err = validate_registration_token(bad).expect_err("bad token");
            assert_eq!(err.code, RegistrationErrorCode::InvalidTokenFormat);
        }
    }

    #[tokio::test]
    async fn malformed_token_never_reaches_network() {
        let addr = closed_port_addr();
        let err = request_agent_token(
            &Client::new(),
            &format!("http://{addr}/_api/v3/agent_registration"),
            "not-a-token",
            "agent",
            retry(),
            TIMEOUT,
        )
        .await
        .expect_err("bad token");
        assert_eq!(err.code, RegistrationErrorCode::InvalidTokenFormat);
    }

    #[tokio::test]
    async fn registration_posts_token_and_name() {
        let (addr, server) = spawn_http_stub(vec![(201, r#"{"token":"agent-token"}"#.to_owned())]);
        let token = request_agent_token(
            &Client::new(),
            &format!("http://{addr}/_api/v3/agent_registration"),
            GOOD_TOKEN,
            "scanner-01",
            retry(),
            TIMEOUT,
        )
        .await
        .expect("registered");
        assert_eq!(token, "agent-token");
        let requests = server.join().expect("join server");
        assert!(requests[0].starts_with("POST /_api/v3/agent_registration "));
        assert!(requests[0].contains(GOOD_TOKEN));
        assert!(requests[0].contains("\"name\":\"scanner-01\""));
    }

    #[tokio::test]
    async fn registration_status_codes_map_to_error_codes() {
        let (addr, server) = spawn_http_stub(vec![
            (404, "{}".to_owned()),
            (401, "{}".to_owned()),
        ]);
        let url = format!("http://{addr}/_api/v3/agent_registration");
        let not_found =
            request_agent_token(&Client::new(), &url, GOOD_TOKEN, "a", retry(), TIMEOUT)
                .await
                .expect_err("404");
        assert_eq!(not_found.code, RegistrationErrorCode::NotFound);
        let unauthorized =
            request_agent_token(&Client::new(), &url, GOOD_TOKEN, "a", retry(), TIMEOUT)
                .await
                .expect_err("401");
        assert_eq!(unauthorized.code, RegistrationErrorCode::Unauthorized);
        assert_eq!(unauthorized.exit_code(), 1);
        server.join().expect("join server");
    }

    #[tokio::test]
    async fn registration_gives_up_after_bounded_attempts() {
        let addr = closed_port_addr();
        let err = request_agent_token(
            &Client::new(),
            &format!("http://{addr}/_api/v3/agent_registration"),
            GOOD_TOKEN,
            "a",
            retry(),
            TIMEOUT,
        )
        .await
        .expect_err("nothing listens");
        assert_eq!(err.code, RegistrationErrorCode::Transport);
        assert!(err.message.contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn channel_token_uses_agent_authorization_header() {
        let (addr, server) = spawn_http_stub(vec![(200, r#"{"token":"short"}"#.to_owned())]);
        let token = request_channel_token(
            &Client::new(),
            &format!("http://{addr}/_api/v3/agent_websocket_token"),
            "long-lived",
            TIMEOUT,
        )
        .await
        .expect("channel token");
        assert_eq!(token, "short");
        let requests = server.join().expect("join server");
        assert!(requests[0]
            .to_ascii_lowercase()
            .contains("authorization: agent long-lived"));
    }

    #[tokio::test]
    async fn channel_token_errors_distinguish_license() {
        let (addr, server) = spawn_http_stub(vec![
            (402, "{}".to_owned()),
            (403, "{}".to_owned()),
        ]);
        let url = format!("http://{addr}/_api/v3/agent_websocket_token");
        let license = request_channel_token(&Client::new(), &url, "t", TIMEOUT)
            .await
            .expect_err("402");
        assert_eq!(license.code, RegistrationErrorCode::LicenseInvalid);
        let invalid = request_channel_token(&Client::new(), &url, "t", TIMEOUT)
            .await
            .expect_err("403");
        assert_eq!(invalid.code, RegistrationErrorCode::InvalidAgentToken);
        server.join().expect("join server");
    }

    #[tokio::test]
    async fn silent_token_endpoint_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");
        let err = request_channel_token(
            &Client::new(),
            &format!("http://{addr}/_api/v3/agent_websocket_token"),
            "t",
            Duration::from_millis(300),
        )
        .await
        .expect_err("silent server");
        assert_eq!(err.code, RegistrationErrorCode::Transport);
        drop(listener);
    }
}
