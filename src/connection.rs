// SPDX-License-Identifier: AGPL-3.0-or-later

//! This module provides a [`ConnectionManager`], which owns the single
//! active TCP link to the peer (or the listening socket while waiting for
//! one). All socket I/O happens inside one actor task, so sends are
//! serialized and frames never interleave on the wire.

use crate::protocol::{PeerMessage, PeerMessageCodec};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the connection currently stands.
///
/// Host path: Disconnected → Listening → Connected → Disconnected.
/// Client path: Disconnected → Connecting → Connected → Disconnected.
/// Messages only flow while Connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Listening { port: u16 },
    Connecting { address: String },
    Connected { peer: SocketAddr },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Listening { port } => write!(f, "listening on port {port}"),
            Self::Connecting { address } => write!(f, "connecting to {address}"),
            Self::Connected { peer } => write!(f, "connected to {peer}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("connection attempt to {address} timed out")]
    ConnectTimeout { address: String },
    #[error("connection attempt to {address} was cancelled")]
    ConnectCancelled { address: String },
    #[error("connection is {state}, disconnect first")]
    Busy { state: ConnectionState },
    #[error("not connected to a peer")]
    NotConnected,
    #[error("failed to send to peer: {0}")]
    Send(String),
}

/// What the actor reports back to its owner (the session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A decoded inbound frame.
    Message(PeerMessage),
    /// A transport failure; always followed by a `Disconnected` transition.
    Error(String),
}

enum ConnectionCommand {
    Host {
        port: u16,
        response_tx: oneshot::Sender<Result<u16, TransportError>>,
    },
    Connect {
        address: String,
        port: u16,
        response_tx: oneshot::Sender<Result<SocketAddr, TransportError>>,
    },
    Disconnect,
    Send {
        message: PeerMessage,
        response_tx: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// Handle for talking to the connection actor.
#[derive(Clone)]
pub struct ConnectionManager {
    command_tx: mpsc::Sender<ConnectionCommand>,
}

impl ConnectionManager {
    /// Spawns the actor. Events (state transitions, inbound messages,
    /// transport errors) are delivered on `event_tx`.
    #[must_use]
    pub fn new(event_tx: mpsc::Sender<ConnectionEvent>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let mut actor = ConnectionActor::new(command_rx, event_tx);
        tokio::spawn(async move { actor.run().await });
        Self { command_tx }
    }

    /// Binds a listening socket and waits for a single peer. Returns the
    /// actually bound port, so callers may pass 0.
    pub async fn host(&self, port: u16) -> Result<u16, TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Host { port, response_tx })
            .await
            .expect("Connection actor task has been killed");
        response_rx
            .await
            .expect("Connection actor dropped a host response")
    }

    pub async fn connect(&self, address: &str, port: u16) -> Result<SocketAddr, TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Connect {
                address: address.to_string(),
                port,
                response_tx,
            })
            .await
            .expect("Connection actor task has been killed");
        response_rx
            .await
            .expect("Connection actor dropped a connect response")
    }

    /// Closes everything unconditionally. A no-op when already disconnected.
    pub async fn disconnect(&self) {
        self.command_tx
            .send(ConnectionCommand::Disconnect)
            .await
            .expect("Connection actor task has been killed");
    }

    pub async fn send(&self, message: PeerMessage) -> Result<(), TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Send {
                message,
                response_tx,
            })
            .await
            .expect("Connection actor task has been killed");
        response_rx
            .await
            .expect("Connection actor dropped a send response")
    }
}

type PeerReader = FramedRead<OwnedReadHalf, LinesCodec>;
type PeerWriter = FramedWrite<OwnedWriteHalf, PeerMessageCodec>;

struct ConnectionActor {
    command_rx: mpsc::Receiver<ConnectionCommand>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    listener: Option<TcpListener>,
    reader: Option<PeerReader>,
    writer: Option<PeerWriter>,
    state: ConnectionState,
}

impl ConnectionActor {
    fn new(
        command_rx: mpsc::Receiver<ConnectionCommand>,
        event_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            command_rx,
            event_tx,
            listener: None,
            reader: None,
            writer: None,
            state: ConnectionState::Disconnected,
        }
    }

    async fn run(&mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        // All handles dropped, shut down.
                        None => break,
                    }
                }
                incoming = accept_peer(self.listener.as_ref()) => {
                    self.handle_incoming(incoming).await;
                }
                line = next_line(self.reader.as_mut()) => {
                    self.handle_line(line).await;
                }
            }
        }
        debug!("Channel towards connection actor has been closed (probably shutting down)");
    }

    async fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Host { port, response_tx } => {
                if self.state != ConnectionState::Disconnected {
                    let _ = response_tx.send(Err(TransportError::Busy {
                        state: self.state.clone(),
                    }));
                    return;
                }
                match TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(listener) => {
                        let bound_port = listener
                            .local_addr()
                            .expect("A freshly bound listener should have a local address")
                            .port();
                        info!("Hosting on port {bound_port}");
                        self.listener = Some(listener);
                        self.set_state(ConnectionState::Listening { port: bound_port })
                            .await;
                        let _ = response_tx.send(Ok(bound_port));
                    }
                    Err(source) => {
                        let _ = response_tx.send(Err(TransportError::Bind { port, source }));
                    }
                }
            }
            ConnectionCommand::Connect {
                address,
                port,
                response_tx,
            } => {
                if self.state != ConnectionState::Disconnected {
                    let _ = response_tx.send(Err(TransportError::Busy {
                        state: self.state.clone(),
                    }));
                    return;
                }
                let target = format!("{address}:{port}");
                self.set_state(ConnectionState::Connecting {
                    address: target.clone(),
                })
                .await;
                let dial = timeout(CONNECT_TIMEOUT, TcpStream::connect(target.clone()));
                tokio::pin!(dial);
                // A disconnect must not have to wait out a slow dial.
                let dialed = loop {
                    tokio::select! {
                        dialed = &mut dial => break Some(dialed),
                        command = self.command_rx.recv() => match command {
                            Some(ConnectionCommand::Disconnect) | None => break None,
                            Some(ConnectionCommand::Host { response_tx, .. }) => {
                                let _ = response_tx.send(Err(TransportError::Busy {
                                    state: self.state.clone(),
                                }));
                            }
                            Some(ConnectionCommand::Connect { response_tx, .. }) => {
                                let _ = response_tx.send(Err(TransportError::Busy {
                                    state: self.state.clone(),
                                }));
                            }
                            Some(ConnectionCommand::Send { response_tx, .. }) => {
                                let _ = response_tx.send(Err(TransportError::NotConnected));
                            }
                        },
                    }
                };
                match dialed {
                    None => {
                        self.set_state(ConnectionState::Disconnected).await;
                        let _ = response_tx.send(Err(TransportError::ConnectCancelled {
                            address: target,
                        }));
                    }
                    Some(Ok(Ok(stream))) => match stream.peer_addr() {
                        Ok(peer) => {
                            info!("Connected to peer: {peer}");
                            self.attach(stream, peer).await;
                            let _ = response_tx.send(Ok(peer));
                        }
                        Err(source) => {
                            self.set_state(ConnectionState::Disconnected).await;
                            let _ = response_tx.send(Err(TransportError::Connect {
                                address: target,
                                source,
                            }));
                        }
                    },
                    Some(Ok(Err(source))) => {
                        self.set_state(ConnectionState::Disconnected).await;
                        let _ = response_tx.send(Err(TransportError::Connect {
                            address: target,
                            source,
                        }));
                    }
                    Some(Err(_)) => {
                        self.set_state(ConnectionState::Disconnected).await;
                        let _ =
                            response_tx.send(Err(TransportError::ConnectTimeout {
                                address: target,
                            }));
                    }
                }
            }
            ConnectionCommand::Disconnect => {
                self.teardown().await;
            }
            ConnectionCommand::Send {
                message,
                response_tx,
            } => {
                let Some(writer) = self.writer.as_mut() else {
                    let _ = response_tx.send(Err(TransportError::NotConnected));
                    return;
                };
                match writer.send(message).await {
                    Ok(()) => {
                        let _ = response_tx.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = response_tx.send(Err(TransportError::Send(err.to_string())));
                        let _ = self
                            .event_tx
                            .send(ConnectionEvent::Error(format!(
                                "send failed: {err}"
                            )))
                            .await;
                        self.teardown().await;
                    }
                }
            }
        }
    }

    async fn handle_incoming(&mut self, incoming: std::io::Result<(TcpStream, SocketAddr)>) {
        match incoming {
            Ok((stream, peer)) => {
                if self.writer.is_some() {
                    // One peer at a time; reject at the transport level.
                    debug!("Rejecting connection from {peer}, already connected");
                    drop(stream);
                    return;
                }
                info!("Peer connected: {peer}");
                self.attach(stream, peer).await;
            }
            Err(err) => {
                warn!("Failed to accept an incoming connection: {err}");
            }
        }
    }

    async fn handle_line(&mut self, line: Option<Result<String, LinesCodecError>>) {
        match line {
            Some(Ok(line)) => match PeerMessage::from_line(&line) {
                Ok(message) => {
                    let _ = self.event_tx.send(ConnectionEvent::Message(message)).await;
                }
                Err(err) => {
                    warn!("Dropping malformed message from peer: {err}");
                }
            },
            // Invalid UTF-8 in a line. The codec has already consumed the
            // offending bytes, the stream stays usable.
            Some(Err(LinesCodecError::Io(err))) if err.kind() == std::io::ErrorKind::InvalidData => {
                warn!("Dropping undecodable line from peer: {err}");
            }
            Some(Err(err)) => {
                let _ = self
                    .event_tx
                    .send(ConnectionEvent::Error(format!("receive failed: {err}")))
                    .await;
                self.teardown().await;
            }
            None => {
                info!("Peer closed the connection");
                self.teardown().await;
            }
        }
    }

    async fn attach(&mut self, stream: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        // No line length limit: a full_sync line carries the entire text.
        self.reader = Some(FramedRead::new(read_half, LinesCodec::new()));
        self.writer = Some(FramedWrite::new(write_half, PeerMessageCodec));
        self.set_state(ConnectionState::Connected { peer }).await;
    }

    async fn teardown(&mut self) {
        self.reader = None;
        self.writer = None;
        self.listener = None;
        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected).await;
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        self.state = state.clone();
        let _ = self
            .event_tx
            .send(ConnectionEvent::StateChanged(state))
            .await;
    }
}

async fn accept_peer(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn next_line(
    reader: Option<&mut PeerReader>,
) -> Option<Result<String, LinesCodecError>> {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn expect_event(rx: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("event channel closed")
    }

    async fn connected_pair() -> (
        ConnectionManager,
        mpsc::Receiver<ConnectionEvent>,
        ConnectionManager,
        mpsc::Receiver<ConnectionEvent>,
        u16,
    ) {
        let (host_tx, mut host_rx) = mpsc::channel(8);
        let host = ConnectionManager::new(host_tx);
        let port = host.host(0).await.expect("hosting failed");
        assert_eq!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Listening { port })
        );

        let (client_tx, mut client_rx) = mpsc::channel(8);
        let client = ConnectionManager::new(client_tx);
        client.connect("127.0.0.1", port).await.expect("connecting failed");
        assert!(matches!(
            expect_event(&mut client_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Connecting { .. })
        ));
        assert!(matches!(
            expect_event(&mut client_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Connected { .. })
        ));
        assert!(matches!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Connected { .. })
        ));

        (host, host_rx, client, client_rx, port)
    }

    #[tokio::test]
    async fn host_reports_bound_port() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(event_tx);
        let port = manager.host(0).await.expect("hosting failed");
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(event_tx);
        let err = manager.send(PeerMessage::clear()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn host_while_listening_is_rejected() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(event_tx);
        manager.host(0).await.expect("hosting failed");
        let err = manager.host(0).await.unwrap_err();
        assert!(matches!(err, TransportError::Busy { .. }));
    }

    #[tokio::test]
    async fn disconnect_during_dial_resolves_promptly() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(event_tx);

        let dialer = manager.clone();
        let dial = tokio::spawn(async move {
            // Reserved documentation range (TEST-NET-1), nothing answers.
            dialer.connect("192.0.2.1", 9).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.disconnect().await;

        // The dial resolves well before CONNECT_TIMEOUT, either cancelled
        // by the disconnect or already failed outright.
        let result = timeout(Duration::from_secs(2), dial)
            .await
            .expect("dial did not resolve after disconnect")
            .expect("dial task panicked");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn peers_exchange_messages() {
        let (_host, mut host_rx, client, _client_rx, _port) = connected_pair().await;

        client
            .send(PeerMessage::full_sync("hello"))
            .await
            .expect("send failed");
        assert_eq!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::Message(PeerMessage::full_sync("hello"))
        );
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_but_session_continues() {
        let (host_tx, mut host_rx) = mpsc::channel(8);
        let host = ConnectionManager::new(host_tx);
        let port = host.host(0).await.expect("hosting failed");
        assert_eq!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Listening { port })
        );

        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("raw connect failed");
        assert!(matches!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Connected { .. })
        ));

        stream
            .write_all(
                b"this is not json\n{\"type\":\"emoji\",\"content\":\"?\"}\n{\"type\":\"clear\",\"content\":\"\"}\n",
            )
            .await
            .expect("raw write failed");

        assert_eq!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::Message(PeerMessage::clear())
        );
    }

    #[tokio::test]
    async fn invalid_utf8_is_dropped_but_session_continues() {
        let (host_tx, mut host_rx) = mpsc::channel(8);
        let host = ConnectionManager::new(host_tx);
        let port = host.host(0).await.expect("hosting failed");
        assert_eq!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Listening { port })
        );

        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("raw connect failed");
        assert!(matches!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Connected { .. })
        ));

        stream
            .write_all(b"\xff\xfe garbage\n{\"type\":\"clear\",\"content\":\"\"}\n")
            .await
            .expect("raw write failed");

        // The undecodable line is dropped, the next frame still arrives.
        assert_eq!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::Message(PeerMessage::clear())
        );
    }

    #[tokio::test]
    async fn second_connection_is_rejected_at_transport_level() {
        let (_host, _host_rx, _client, _client_rx, port) = connected_pair().await;

        // The listener still accepts, but drops the stream right away.
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("raw connect failed");
        let mut buffer = [0u8; 1];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buffer))
            .await
            .expect("timed out waiting for the rejection")
            .expect("read failed");
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn peer_close_yields_a_single_disconnect() {
        let (_host, mut host_rx, client, mut client_rx, _port) = connected_pair().await;

        client.disconnect().await;
        assert_eq!(
            expect_event(&mut client_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        );
        assert_eq!(
            expect_event(&mut host_rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        );

        // No further events after the single transition.
        assert!(
            timeout(Duration::from_millis(300), host_rx.recv())
                .await
                .is_err()
        );

        // Disconnect is idempotent.
        client.disconnect().await;
        assert!(
            timeout(Duration::from_millis(300), client_rx.recv())
                .await
                .is_err()
        );
    }
}
