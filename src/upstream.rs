//! Outbound connections to the hub.
//!
//! Every accepted client gets its own fresh TLS connection. The hub's
//! certificate is checked against the configured CA file only (no system
//! roots) and against `server_name`, which may differ from the host that is
//! actually dialled.

use crate::config::RelayConfig;
use crate::error::{ConnectError, RelayError};
use async_trait::async_trait;
use log::{debug, warn};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Byte stream usable as either half of a pair.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A connected, handshaken upstream socket.
pub struct Upstream {
    pub stream: BoxedStream,
    pub peer_addr: Option<SocketAddr>,
}

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Upstream, ConnectError>;

    /// Human readable target, for logs.
    fn target(&self) -> String;
}

pub struct TlsUpstream {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    server_name_text: String,
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsUpstream {
    pub fn from_config(config: &RelayConfig) -> Result<Self, RelayError> {
        let roots = load_trust_anchors(&config.ca_cert)?;
        Self::new(
            config.server_host.clone(),
            config.server_port,
            &config.server_name,
            roots,
            config.connect_timeout(),
        )
    }

    pub fn new(
        host: String,
        port: u16,
        server_name: &str,
        roots: RootCertStore,
        connect_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let server_name_text = server_name.to_string();
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| RelayError::Config(format!("Invalid TLS server name '{}': {}", server_name, e)))?;

        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            host,
            port,
            server_name,
            server_name_text,
            connector: TlsConnector::from(Arc::new(tls_config)),
            connect_timeout,
        })
    }
}

#[async_trait]
impl UpstreamConnector for TlsUpstream {
    async fn connect(&self) -> Result<Upstream, ConnectError> {
        let attempt = async {
            let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
            let peer_addr = tcp.peer_addr().ok();
            tcp.set_nodelay(true)?;
            debug!("TCP connection to {:?} established, starting TLS handshake", peer_addr);

            let tls = self
                .connector
                .connect(self.server_name.clone(), tcp)
                .await
                .map_err(|e| classify_handshake_error(e, &self.server_name_text))?;

            Ok::<_, ConnectError>(Upstream {
                stream: Box::new(tls),
                peer_addr,
            })
        };

        match timeout(self.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(self.connect_timeout)),
        }
    }

    fn target(&self) -> String {
        format!("{}:{} (verified as {})", self.host, self.port, self.server_name_text)
    }
}

/// A rejected certificate is a trust failure; anything else during the
/// handshake only concerns this one connection.
fn classify_handshake_error(err: std::io::Error, server_name: &str) -> ConnectError {
    let rejected = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .filter(|tls_err| matches!(tls_err, rustls::Error::InvalidCertificate(_)))
        .map(|tls_err| tls_err.to_string());

    match rejected {
        Some(reason) => ConnectError::Trust {
            server_name: server_name.to_string(),
            reason,
        },
        None => ConnectError::Io(err),
    }
}

/// Read the CA bundle that anchors trust in the hub's certificate.
pub fn load_trust_anchors(path: &Path) -> Result<RootCertStore, RelayError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| {
        RelayError::Config(format!(
            "Failed to open CA certificate file {}: {}",
            path.display(),
            e
        ))
    })?);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls(format!("Failed to read CA certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(RelayError::Tls(format!(
            "No certificate found in {}",
            path.display()
        )));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!("Ignored {} unparsable certificate(s) in {}", ignored, path.display());
    }
    if added == 0 {
        return Err(RelayError::Tls(format!(
            "No usable CA certificate in {}",
            path.display()
        )));
    }

    debug!("Loaded {} trust anchor(s) from {}", added, path.display());
    Ok(roots)
}
