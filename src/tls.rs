use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tokio_tungstenite::Connector;

use crate::config::ServerConfig;

/// Installs ring as the process-wide rustls provider. Safe to call twice.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// HTTP client shared by registration, reachability and the result sink.
/// Only connecting is bounded here; short calls set their own request timeout
/// so slow result uploads are not cut off.
pub fn build_http_client(server: &ServerConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(server.http_timeout_secs.max(1)));
    if let Some(path) = server.ssl_cert.as_deref().filter(|_| server.ssl) {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed reading ssl_cert {}", path.display()))?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem)
            .with_context(|| format!("failed parsing ssl_cert {}", path.display()))?;
        if certs.is_empty() {
            anyhow::bail!("ssl_cert {} holds no certificates", path.display());
        }
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }
    builder.build().context("failed building http client")
}

/// Connector for the streaming channel. `None` keeps the library default
/// (plain ws, or wss against the bundled web roots).
pub fn websocket_connector(server: &ServerConfig) -> Result<Option<Connector>> {
    if !server.ssl {
        return Ok(None);
    }
    let Some(path) = server.ssl_cert.as_deref() else {
        return Ok(None);
    };
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots
            .add(cert)
            .with_context(|| format!("rejected certificate from {}", path.display()))?;
    }
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("failed selecting tls protocol versions")?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Some(Connector::Rustls(Arc::new(config))))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed reading ssl_cert {}", path.display()))?;
    let mut reader = BufReader::new(&pem[..]);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed parsing ssl_cert {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("ssl_cert {} holds no certificates", path.display());
    }
    Ok(certs)
}
