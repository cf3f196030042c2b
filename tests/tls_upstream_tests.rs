//! End-to-end tests through a real TLS hub, with certificates generated
//! on the fly.

use hub_relay::error::{ConnectError, RelayError};
use hub_relay::relay::{Relay, RelaySettings};
use hub_relay::rewrite::RewriteRule;
use hub_relay::upstream::{TlsUpstream, UpstreamConnector, load_trust_anchors};
use rustls::ServerConfig;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

const WAIT: Duration = Duration::from_secs(5);
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

struct Hub {
    addr: SocketAddr,
    cert_pem: String,
    requests: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// A TLS server presenting a self-signed certificate for `name`. It records
/// each request head it receives and answers with a fixed response.
async fn spawn_hub(name: &str) -> Hub {
    let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    let cert_pem = certified.cert.pem();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, requests) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(head);
                let _ = tls.write_all(RESPONSE).await;
                let _ = tls.flush().await;
            });
        }
    });

    Hub {
        addr,
        cert_pem,
        requests,
    }
}

fn ca_file(pem: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(pem.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn connector(addr: SocketAddr, server_name: &str, ca_pem: &str) -> TlsUpstream {
    let ca = ca_file(ca_pem);
    let roots = load_trust_anchors(ca.path()).unwrap();
    TlsUpstream::new(
        addr.ip().to_string(),
        addr.port(),
        server_name,
        roots,
        Duration::from_secs(5),
    )
    .unwrap()
}

async fn start_relay(connector: TlsUpstream) -> (SocketAddr, tokio::task::JoinHandle<Result<(), RelayError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = Relay::new(
        listener,
        Arc::new(connector),
        RewriteRule::for_user("alice"),
        RelaySettings::default(),
    );
    let addr = relay.local_addr().unwrap();
    (addr, tokio::spawn(relay.run()))
}

#[tokio::test]
async fn test_relays_through_trusted_hub() {
    let mut hub = spawn_hub("jupyterhub").await;
    // Dialled by IP, verified by name
    let (relay_addr, _relay) = start_relay(connector(hub.addr, "jupyterhub", &hub.cert_pem)).await;

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client
        .write_all(b"GET /api/kernels HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let head = timeout(WAIT, hub.requests.recv()).await.unwrap().unwrap();
    assert_eq!(head, b"GET /user/alice/api/kernels HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());

    let mut response = vec![0u8; RESPONSE.len()];
    timeout(WAIT, client.read_exact(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, RESPONSE.to_vec());
}

#[tokio::test]
async fn test_unknown_issuer_is_fatal() {
    let hub = spawn_hub("jupyterhub").await;
    let other = rcgen::generate_simple_self_signed(vec!["jupyterhub".to_string()]).unwrap();
    let (relay_addr, relay) = start_relay(connector(hub.addr, "jupyterhub", &other.cert.pem())).await;

    let _client = TcpStream::connect(relay_addr).await.unwrap();

    let result = timeout(WAIT, relay).await.expect("relay kept running").unwrap();
    assert!(matches!(result, Err(RelayError::Trust { .. })));
}

#[tokio::test]
async fn test_name_mismatch_is_fatal() {
    let hub = spawn_hub("jupyterhub").await;
    let upstream = connector(hub.addr, "otherhub", &hub.cert_pem);

    match upstream.connect().await {
        Err(e @ ConnectError::Trust { .. }) => assert!(e.is_fatal()),
        Err(e) => panic!("expected trust failure, got {}", e),
        Ok(_) => panic!("handshake should fail"),
    }
}

#[tokio::test]
async fn test_refused_connect_is_not_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let hub_cert = rcgen::generate_simple_self_signed(vec!["jupyterhub".to_string()]).unwrap();
    let upstream = connector(addr, "jupyterhub", &hub_cert.cert.pem());

    match upstream.connect().await {
        Err(e) => assert!(!e.is_fatal(), "unexpected fatal error: {}", e),
        Ok(_) => panic!("nothing is listening"),
    }
}
