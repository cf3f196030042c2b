//! The relay loop.
//!
//! One task owns the listener and the [`ChannelRegistry`]. Every socket has
//! a reader task and a writer task around it: readers report what they saw
//! as [`Event`]s, writers drain a bounded per-endpoint outbox. Upstream
//! connects happen in per-client tasks that hand the finished pair back to
//! the loop. Registration, rewriting and teardown therefore all run in one
//! place and never race each other, and the loop itself never waits on a
//! socket.
//!
//! ```text
//!   listener ──accept──▶ connect task ──Connected──┐
//!                                                  ▼
//!   reader tasks ──Data / Closed / Failed──▶ relay loop ──outbox──▶ writer task ──▶ peer
//!                                                  ▲                     │
//!                                                  └──────Failed─────────┘
//! ```
//!
//! A reader reserves a slot in its peer's outbox before it reads, so a peer
//! that stops draining only stalls its own pair.

use crate::config::RelayConfig;
use crate::error::{ConnectError, RelayError};
use crate::registry::{ChannelRegistry, Endpoint, Side, SocketId};
use crate::rewrite::{Outcome, RewriteRule};
use crate::upstream::{Upstream, UpstreamConnector};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};

const EVENT_QUEUE_DEPTH: usize = 1024;
/// Chunks queued per socket before its peer's reader stops reading.
const OUTBOX_DEPTH: usize = 32;
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Tuning knobs of the loop itself.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub buffer_size: usize,
    pub poll_delay: Duration,
    pub write_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            poll_delay: Duration::ZERO,
            write_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            poll_delay: config.poll_delay(),
            write_timeout: config.write_timeout(),
        }
    }
}

enum Event {
    Connected {
        client: TcpStream,
        client_addr: SocketAddr,
        upstream: Upstream,
    },
    ConnectFailed {
        client_addr: SocketAddr,
        error: ConnectError,
    },
    Data {
        id: SocketId,
        chunk: Bytes,
        slot: OwnedPermit<Bytes>,
    },
    Closed {
        id: SocketId,
    },
    Failed {
        id: SocketId,
        error: io::Error,
    },
}

enum Wake {
    Shutdown,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Event(Event),
}

pub struct Relay {
    listener: TcpListener,
    connector: Arc<dyn UpstreamConnector>,
    rule: RewriteRule,
    settings: RelaySettings,
    registry: ChannelRegistry,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    accept_backoff: Duration,
    accept_resume: Option<Instant>,
}

/// Bind the client-facing socket with `SO_REUSEADDR` and the given backlog.
/// IPv4 results are preferred when the host resolves to several addresses.
pub async fn bind_listener(host: &str, port: u16, backlog: u32) -> Result<TcpListener, RelayError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let addr = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| RelayError::Config(format!("Could not resolve listen address {}:{}", host, port)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

impl Relay {
    pub async fn bind(config: &RelayConfig, connector: Arc<dyn UpstreamConnector>) -> Result<Self, RelayError> {
        let listener = bind_listener(&config.listen_host, config.listen_port, config.backlog).await?;
        Ok(Self::new(
            listener,
            connector,
            RewriteRule::for_user(&config.username),
            RelaySettings::from(config),
        ))
    }

    pub fn new(
        listener: TcpListener,
        connector: Arc<dyn UpstreamConnector>,
        rule: RewriteRule,
        settings: RelaySettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            listener,
            connector,
            rule,
            settings,
            registry: ChannelRegistry::new(),
            events_tx,
            events_rx,
            accept_backoff: Duration::ZERO,
            accept_resume: None,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Serve until `shutdown` resolves or an untrusted upstream certificate
    /// is seen. On shutdown the relay is handed back; dropping it closes the
    /// listener and abandons live pairs.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<Self, RelayError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Relay listening on {}, forwarding to {}", self.local_addr()?, self.connector.target());

        loop {
            let wake = tokio::select! {
                _ = &mut shutdown => Wake::Shutdown,
                accepted = accept_after(&self.listener, self.accept_resume) => Wake::Accepted(accepted),
                Some(event) = self.events_rx.recv() => Wake::Event(event),
            };

            match wake {
                Wake::Shutdown => {
                    info!("Shutdown requested, {} live pair(s) abandoned", self.registry.pair_count());
                    return Ok(self);
                }
                Wake::Accepted(accepted) => self.on_accept(accepted),
                Wake::Event(event) => self.dispatch(event)?,
            }

            // Service everything that is already ready before waiting again
            while let Ok(event) = self.events_rx.try_recv() {
                self.dispatch(event)?;
            }

            if self.settings.poll_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                sleep(self.settings.poll_delay).await;
            }
        }
    }

    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(std::future::pending()).await.map(|_| ())
    }

    fn on_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        let (client, client_addr) = match accepted {
            Ok(accepted) => {
                self.accept_backoff = Duration::ZERO;
                self.accept_resume = None;
                accepted
            }
            Err(e) => {
                // Errors like EMFILE repeat until something is released
                self.accept_backoff = next_accept_backoff(self.accept_backoff);
                self.accept_resume = Some(Instant::now() + self.accept_backoff);
                warn!(
                    "Failed to accept client connection: {}, retrying in {:?}",
                    e, self.accept_backoff
                );
                return;
            }
        };
        debug!("Accepted {}, connecting upstream", client_addr);

        let connector = self.connector.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match connector.connect().await {
                Ok(upstream) => Event::Connected {
                    client,
                    client_addr,
                    upstream,
                },
                // The client socket is dropped, and so closed, right here
                Err(error) => Event::ConnectFailed { client_addr, error },
            };
            let _ = events.send(event).await;
        });
    }

    fn dispatch(&mut self, event: Event) -> Result<(), RelayError> {
        match event {
            Event::Connected {
                client,
                client_addr,
                upstream,
            } => self.on_connected(client, client_addr, upstream),
            Event::ConnectFailed { client_addr, error } => {
                if let ConnectError::Trust { server_name, reason } = error {
                    error!("Can't establish connection with remote server. Incorrect CA certificates: {}", reason);
                    return Err(RelayError::Trust { server_name, reason });
                }
                warn!("Can't establish connection with remote server: {}", error);
                info!("Closing connection with client side {}", client_addr);
            }
            Event::Data { id, chunk, slot } => self.on_receive(id, chunk, slot),
            Event::Closed { id } => self.on_close(id),
            Event::Failed { id, error } => {
                warn!("Connection error on {}: {}", self.describe(id), error);
                self.on_close(id);
            }
        }
        Ok(())
    }

    fn on_connected(&mut self, client: TcpStream, client_addr: SocketAddr, upstream: Upstream) {
        if let Err(e) = client.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", client_addr, e);
        }

        let (client_rd, client_wr) = tokio::io::split(client);
        let (upstream_rd, upstream_wr) = tokio::io::split(upstream.stream);
        let (client_outbox, client_queue) = mpsc::channel(OUTBOX_DEPTH);
        let (upstream_outbox, upstream_queue) = mpsc::channel(OUTBOX_DEPTH);

        let (client_id, upstream_id) = self.registry.register_pair(
            Endpoint::new(Side::Client, Some(client_addr), client_outbox.clone()),
            Endpoint::new(Side::Upstream, upstream.peer_addr, upstream_outbox.clone()),
        );

        // Each reader feeds the other side's outbox
        let client_reader = self.spawn_reader(client_id, client_rd, upstream_outbox);
        let upstream_reader = self.spawn_reader(upstream_id, upstream_rd, client_outbox);
        let client_writer = self.spawn_writer(client_id, client_wr, client_queue);
        let upstream_writer = self.spawn_writer(upstream_id, upstream_wr, upstream_queue);
        self.registry.attach_tasks(client_id, client_reader, client_writer);
        self.registry.attach_tasks(upstream_id, upstream_reader, upstream_writer);

        info!("{} has connected", client_addr);
        debug!(
            "Pair {} <-> {} registered, {} live pair(s)",
            client_id,
            upstream_id,
            self.registry.pair_count()
        );
    }

    /// Read from one socket until EOF or the first error. Nothing is read
    /// until the peer's outbox has room for the chunk.
    fn spawn_reader<R>(&self, id: SocketId, mut reader: R, peer_outbox: mpsc::Sender<Bytes>) -> AbortHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events_tx.clone();
        let buffer_size = self.settings.buffer_size;

        tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_size];
            loop {
                // The peer's writer is gone, its failure is already reported
                let Ok(slot) = peer_outbox.clone().reserve_owned().await else {
                    break;
                };
                let event = match reader.read(&mut buf).await {
                    Ok(0) => Event::Closed { id },
                    Ok(n) => Event::Data {
                        id,
                        chunk: Bytes::copy_from_slice(&buf[..n]),
                        slot,
                    },
                    Err(error) => Event::Failed { id, error },
                };
                let finished = !matches!(event, Event::Data { .. });
                if events.send(event).await.is_err() || finished {
                    break;
                }
            }
        })
        .abort_handle()
    }

    /// Write `writer`'s queue to the socket. The first failed or stalled write
    /// is reported against `id`; once the queue closes the socket is shut down.
    fn spawn_writer<W>(&self, id: SocketId, mut writer: W, mut queue: mpsc::Receiver<Bytes>) -> AbortHandle
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let events = self.events_tx.clone();
        let write_timeout = self.settings.write_timeout;

        tokio::spawn(async move {
            while let Some(chunk) = queue.recv().await {
                let written = timeout(write_timeout, async {
                    writer.write_all(&chunk).await?;
                    writer.flush().await
                })
                .await;

                let error = match written {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(_) => io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("write of {} bytes stalled for {:?}", chunk.len(), write_timeout),
                    ),
                };
                let _ = events.send(Event::Failed { id, error }).await;
                return;
            }

            // Errors from sockets that are already broken are expected
            let _ = timeout(CLOSE_GRACE, writer.shutdown()).await;
        })
        .abort_handle()
    }

    fn on_receive(&mut self, id: SocketId, chunk: Bytes, slot: OwnedPermit<Bytes>) {
        let side = match (self.registry.endpoint(id), self.registry.peer(id)) {
            (Some(endpoint), Some(_)) => endpoint.side(),
            _ => {
                debug!("Dropping {} bytes read from {}: pair already closed", chunk.len(), id);
                return;
            }
        };
        self.registry.record_read(id, chunk.len());

        let outgoing = match side {
            Side::Client => match self.rule.apply(&chunk) {
                Outcome::Rewritten(rewritten) => {
                    info!(
                        "Rewriting '{}' request to '{}'",
                        self.rule.marker().trim(),
                        self.rule.replacement().trim()
                    );
                    self.registry.record_rewrite(id);
                    rewritten
                }
                Outcome::Binary | Outcome::Unchanged => chunk,
            },
            Side::Upstream => chunk,
        };

        slot.send(outgoing);
    }

    fn on_close(&mut self, id: SocketId) {
        let Some(closed) = self.registry.teardown(id) else {
            debug!("{} already closed", id);
            return;
        };

        match closed.client.peer_addr() {
            Some(addr) => info!(
                "{} has disconnected ({} bytes sent, {} bytes received, {} request(s) rewritten)",
                addr,
                closed.client.bytes_read(),
                closed.upstream.bytes_read(),
                closed.client.rewrites()
            ),
            None => info!("Client has disconnected"),
        }
        debug!("{} live pair(s) remaining", self.registry.pair_count());
    }

    fn describe(&self, id: SocketId) -> String {
        match self.registry.endpoint(id) {
            Some(endpoint) => match endpoint.peer_addr() {
                Some(addr) => format!("{} {} ({})", endpoint.side(), id, addr),
                None => format!("{} {}", endpoint.side(), id),
            },
            None => id.to_string(),
        }
    }
}

/// Accept on `listener`, waiting first if accepting is paused after an error.
async fn accept_after(listener: &TcpListener, resume: Option<Instant>) -> io::Result<(TcpStream, SocketAddr)> {
    if let Some(deadline) = resume {
        sleep_until(deadline).await;
    }
    listener.accept().await
}

fn next_accept_backoff(current: Duration) -> Duration {
    (current * 2).clamp(ACCEPT_BACKOFF_MIN, ACCEPT_BACKOFF_MAX)
}
