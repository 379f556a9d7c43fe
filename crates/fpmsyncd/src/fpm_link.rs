//! FPM transport server
//!
//! [`FpmLink`] owns the FPM listening socket and at most one peer
//! connection. It is a [`Selectable`] source: when the listener or the
//! connected socket becomes readable, [`FpmLink::on_ready`] accepts or
//! performs one bounded read and pushes every complete message through
//! framing, netlink decoding and dispatch before returning to the loop.
//!
//! ```text
//!            accept                     peer closed / fatal error
//! Listening ─────────▶ Connected ─────────────────────────────▶ Listening
//!                        │  second connection: accepted and closed
//!                        └──────────────────────────────────────┘
//! ```
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Loopback listener, single trusted peer slot
//! - SC-5: Denial of Service Protection - Bounded reads into a fixed arena
//! - SI-10: Information Input Validation - Malformed streams drop the connection

use crate::config::FpmConfig;
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{FpmError, Result};
use crate::framing::{FpmMessageType, FramingBuffer, MessageValidator, RawMessage};
use crate::netlink::NetlinkDecoder;
use crate::select::Selectable;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, instrument, trace, warn};

/// Listen backlog of the FPM server socket.
const LISTEN_BACKLOG: u32 = 2;

/// Transport counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub connections_dropped: u64,
    pub bytes_received: u64,
    pub messages_processed: u64,
    /// NETLINK messages dropped for non-fatal decode errors.
    pub decode_errors: u64,
    /// Messages of a type this daemon carries but does not interpret.
    pub messages_skipped: u64,
}

/// Framing -> decoding -> dispatch for one message at a time.
#[derive(Debug)]
struct Pipeline {
    decoder: NetlinkDecoder,
    dispatcher: Dispatcher,
    stats: LinkStats,
}

impl Pipeline {
    fn process(&mut self, raw: RawMessage<'_>) -> Result<()> {
        self.stats.messages_processed += 1;
        match raw.message_type() {
            FpmMessageType::Protobuf => {
                trace!(len = raw.len(), "Skipping protobuf FPM message");
                self.stats.messages_skipped += 1;
                Ok(())
            }
            FpmMessageType::Netlink => match self.decoder.decode(raw.payload()) {
                Ok(msg) => {
                    self.dispatcher.dispatch(&msg);
                    Ok(())
                }
                Err(e) if e.is_fatal() => Err(e.into()),
                Err(e) => {
                    self.stats.decode_errors += 1;
                    warn!(error = %e, "Dropping undecodable netlink message");
                    Ok(())
                }
            },
        }
    }
}

/// The single live peer connection.
#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: FramingBuffer,
}

impl Connection {
    /// One bounded read, then drain everything that became complete.
    fn read_and_process(&mut self, pipeline: &mut Pipeline) -> Result<()> {
        let Self { stream, buffer, .. } = self;
        let Some(n) = buffer.fill_with(|spare| stream.try_read(spare))? else {
            return Ok(());
        };
        pipeline.stats.bytes_received += n as u64;
        buffer.drain(|raw| pipeline.process(raw))?;
        Ok(())
    }
}

/// FPM server: listening socket plus at most one peer.
#[derive(Debug)]
pub struct FpmLink {
    listener: TcpListener,
    connection: Option<Connection>,
    pending_accept: Option<io::Result<(TcpStream, SocketAddr)>>,
    read_ready: bool,
    validator: MessageValidator,
    batch_size: usize,
    pipeline: Pipeline,
}

impl FpmLink {
    /// Bind the FPM listener.
    ///
    /// Must be called from within a tokio runtime. Failure here is fatal to
    /// the process.
    #[instrument(skip(dispatcher), fields(addr = %config.socket_addr()))]
    pub fn bind(config: &FpmConfig, dispatcher: Dispatcher) -> Result<Self> {
        let addr = config.socket_addr();
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.set_keepalive(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        info!(local = %listener.local_addr()?, "FPM server listening");

        Ok(Self {
            listener,
            connection: None,
            pending_accept: None,
            read_ready: false,
            validator: MessageValidator::new(config.max_message_len),
            batch_size: config.batch_size,
            pipeline: Pipeline {
                decoder: NetlinkDecoder::new(),
                dispatcher,
                stats: LinkStats::default(),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(|c| c.peer)
    }

    pub fn stats(&self) -> LinkStats {
        self.pipeline.stats
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.pipeline.dispatcher.stats()
    }

    /// Bytes of a partial message waiting for the rest of it.
    pub fn pending_bytes(&self) -> usize {
        self.connection.as_ref().map_or(0, |c| c.buffer.pending())
    }

    fn handle_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "FPM accept failed");
                return;
            }
        };

        if let Some(current) = &self.connection {
            warn!(
                peer = %peer,
                current = %current.peer,
                "Refusing FPM connection, a peer is already connected"
            );
            self.pipeline.stats.connections_refused += 1;
            drop(stream);
            return;
        }

        info!(peer = %peer, "FPM peer connected");
        self.pipeline.stats.connections_accepted += 1;
        self.connection = Some(Connection {
            stream,
            peer,
            buffer: FramingBuffer::new(self.validator, self.batch_size),
        });
    }

    fn handle_readable(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let Err(e) = connection.read_and_process(&mut self.pipeline) else {
            return;
        };

        let peer = connection.peer;
        if !e.is_connection_fatal() {
            // Pipeline errors are all connection-fatal; anything else is a bug.
            warn!(peer = %peer, error = %e, "Unexpected FPM processing error");
            return;
        }

        match e {
            FpmError::ConnectionClosed => info!(peer = %peer, "FPM peer closed connection"),
            e => warn!(peer = %peer, error = %e, "Dropping FPM connection"),
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            let discarded = connection.buffer.pending();
            if discarded > 0 {
                debug!(bytes = discarded, "Discarding partial FPM message");
            }
            self.pipeline.stats.connections_dropped += 1;
        }
        self.read_ready = false;
    }
}

impl Selectable for FpmLink {
    fn name(&self) -> &str {
        "fpm_link"
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.pending_accept.is_some() || self.read_ready {
            return Poll::Ready(Ok(()));
        }

        if let Poll::Ready(accepted) = self.listener.poll_accept(cx) {
            self.pending_accept = Some(accepted);
            return Poll::Ready(Ok(()));
        }

        if let Some(connection) = &self.connection {
            // A readiness error surfaces again from the read in on_ready.
            if connection.stream.poll_read_ready(cx).is_ready() {
                self.read_ready = true;
                return Poll::Ready(Ok(()));
            }
        }

        Poll::Pending
    }

    fn on_ready(&mut self) -> Result<()> {
        if let Some(accepted) = self.pending_accept.take() {
            self.handle_accept(accepted);
        }
        if std::mem::take(&mut self.read_ready) {
            self.handle_readable();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::HandlerRegistry;
    use crate::select::{EventLoop, SelectOutcome};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn loopback_config() -> FpmConfig {
        FpmConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..FpmConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let link = FpmLink::bind(&loopback_config(), HandlerRegistry::builder().build()).unwrap();
        let addr = link.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let first = FpmLink::bind(&loopback_config(), HandlerRegistry::builder().build()).unwrap();
        let config = FpmConfig {
            port: first.local_addr().unwrap().port(),
            ..loopback_config()
        };
        // A listening socket holds the port even with SO_REUSEADDR.
        assert!(FpmLink::bind(&config, HandlerRegistry::builder().build()).is_err());
    }

    #[tokio::test]
    async fn test_accept_then_peer_close() {
        let link = FpmLink::bind(&loopback_config(), HandlerRegistry::builder().build()).unwrap();
        let addr = link.local_addr().unwrap();
        let mut event_loop = EventLoop::new(Duration::from_millis(200));
        let link = std::rc::Rc::new(std::cell::RefCell::new(link));
        event_loop.add_source(link.clone());

        let client = std::net::TcpStream::connect(addr).unwrap();
        assert!(matches!(event_loop.run_once().await, SelectOutcome::Ready(0)));
        assert!(link.borrow().is_connected());

        drop(client);
        for _ in 0..10 {
            if !link.borrow().is_connected() {
                break;
            }
            event_loop.run_once().await;
        }
        assert!(!link.borrow().is_connected());
        assert_eq!(link.borrow().stats().connections_dropped, 1);
    }
}
