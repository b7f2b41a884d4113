use std::path::PathBuf;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use crate::config::Config;
use crate::session::{ChannelEnd, ConnectionSession};

pub struct AgentRuntime {
    session: ConnectionSession,
    registration_token: Option<String>,
}

impl AgentRuntime {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        registration_token: Option<String>,
    ) -> Result<Self> {
        info!(
            "starting agent (name={}, host={}, api_port={}, websocket_port={}, ssl={}, executors={})",
            config.agent.agent_name,
            config.server.host,
            config.server.api_port,
            config.server.websocket_port,
            config.server.ssl,
            config.executors.len()
        );
        Ok(Self {
            session: ConnectionSession::new(config, config_path)?,
            registration_token,
        })
    }

    /// Registers, then serves the channel until a signal or the server ends it.
    pub async fn run(mut self) -> Result<()> {
        self.session
            .register(self.registration_token.as_deref())
            .await?;

        let reason = tokio::select! {
            end = self.session.connect() => match end {
                Ok(ChannelEnd::ServerClosed(_)) => "server closed the channel",
                Ok(ChannelEnd::Abrupt(_)) => "channel lost",
                Err(err) => {
                    error!("channel failed error={err:#}");
                    self.session.close("channel failed").await;
                    return Err(err);
                }
            },
            signal = shutdown_signal() => signal,
        };
        self.session.close(reason).await;
        info!("agent stopped reason={reason}");
        Ok(())
    }
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed listening for ctrl-c error={err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed installing SIGTERM handler error={err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "received ctrl-c",
        _ = terminate => "received SIGTERM",
    }
}
