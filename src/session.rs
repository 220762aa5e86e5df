// SPDX-License-Identifier: AGPL-3.0-or-later

//! The session actor owns the pad document and wires the transport, the
//! Syncthing orchestrator and the frontend together. Frontends talk to it
//! through the cloneable [`Session`] handle and observe it through a
//! broadcast subscription.

use crate::config::SessionConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, TransportError};
use crate::document::PadDocument;
use crate::protocol::{PeerMessage, SyncStatus};
use crate::syncthing::{PeerSyncEvent, SyncthingActor, SyncthingClient};
use std::net::SocketAddr;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// What a frontend can observe about a running session.
#[derive(Debug, Clone)]
pub enum Event {
    /// The transport changed state (listening, connected, ...).
    Connection(ConnectionState),
    /// A transport-level failure that did not come from a frontend call.
    TransportError(String),
    /// The remote pad content after applying a peer message.
    Remote(String),
    /// The folder sync status changed.
    Sync(SyncStatus),
}

enum SessionMessage {
    LocalEdit {
        content: String,
        response_tx: oneshot::Sender<Result<(), TransportError>>,
    },
    LocalClear {
        response_tx: oneshot::Sender<Result<(), TransportError>>,
    },
    GetLocal {
        response_tx: oneshot::Sender<String>,
    },
    GetRemote {
        response_tx: oneshot::Sender<String>,
    },
}

/// The running orchestrator for the current connection, if any.
struct OrchestratorLink {
    peer_tx: mpsc::Sender<PeerSyncEvent>,
    status_rx: mpsc::Receiver<SyncStatus>,
    task: JoinHandle<()>,
}

struct SessionActor {
    message_rx: mpsc::Receiver<SessionMessage>,
    connection_rx: mpsc::Receiver<ConnectionEvent>,
    connection: ConnectionManager,
    document: PadDocument,
    event_tx: broadcast::Sender<Event>,
    config: SessionConfig,
    orchestrator: Option<OrchestratorLink>,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                message = self.message_rx.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
                event = self.connection_rx.recv() => {
                    match event {
                        Some(event) => self.handle_connection_event(event).await,
                        None => break,
                    }
                }
                status = next_status(self.orchestrator.as_mut()) => {
                    self.emit(Event::Sync(status));
                }
            }
        }
        self.stop_orchestrator();
        debug!("Session actor terminating");
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::LocalEdit {
                content,
                response_tx,
            } => {
                // The local buffer always reflects the frontend, even when
                // nothing is connected yet.
                self.document.set_local(content.clone());
                let result = self.connection.send(PeerMessage::full_sync(content)).await;
                response_tx
                    .send(result)
                    .expect("Caller of send_local_edit disappeared");
            }
            SessionMessage::LocalClear { response_tx } => {
                self.document.clear_local();
                let result = self.connection.send(PeerMessage::clear()).await;
                response_tx
                    .send(result)
                    .expect("Caller of send_clear disappeared");
            }
            SessionMessage::GetLocal { response_tx } => {
                response_tx
                    .send(self.document.local().to_string())
                    .expect("Caller of local_content disappeared");
            }
            SessionMessage::GetRemote { response_tx } => {
                response_tx
                    .send(self.document.remote().to_string())
                    .expect("Caller of remote_content disappeared");
            }
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                match &state {
                    ConnectionState::Connected { .. } => {
                        self.start_orchestrator();
                        if !self.document.local().is_empty() {
                            let content = self.document.local().to_string();
                            if let Err(err) =
                                self.connection.send(PeerMessage::full_sync(content)).await
                            {
                                debug!("Could not send the initial pad content: {err}");
                            }
                        }
                    }
                    ConnectionState::Disconnected => {
                        self.stop_orchestrator();
                    }
                    _ => {}
                }
                self.emit(Event::Connection(state));
            }
            ConnectionEvent::Message(message) => self.handle_peer_message(message).await,
            ConnectionEvent::Error(error) => self.emit(Event::TransportError(error)),
        }
    }

    async fn handle_peer_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::FullSync { content } => {
                self.document.replace_remote(content);
                self.emit(Event::Remote(self.document.remote().to_string()));
            }
            PeerMessage::Text { content } => {
                self.document.append_remote(&content);
                self.emit(Event::Remote(self.document.remote().to_string()));
            }
            PeerMessage::Clear { .. } => {
                self.document.clear_remote();
                self.emit(Event::Remote(String::new()));
            }
            PeerMessage::SyncthingDeviceId { content } => {
                self.forward_to_orchestrator(PeerSyncEvent::DeviceId(content))
                    .await;
            }
            PeerMessage::SyncthingStatus { content } => {
                self.forward_to_orchestrator(PeerSyncEvent::Status(content))
                    .await;
            }
        }
    }

    async fn forward_to_orchestrator(&mut self, event: PeerSyncEvent) {
        if let Some(link) = &self.orchestrator {
            if link.peer_tx.send(event).await.is_err() {
                debug!("Syncthing orchestrator is gone, dropping a peer sync message");
            }
        } else {
            debug!("Folder sync is disabled, dropping a peer sync message");
        }
    }

    fn start_orchestrator(&mut self) {
        let Some(settings) = self.config.syncthing.clone() else {
            debug!("No Syncthing settings, folder sync stays off");
            return;
        };
        let (peer_tx, peer_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = mpsc::channel(8);
        let api = Box::new(SyncthingClient::new(&settings));
        let actor = SyncthingActor::new(
            api,
            settings,
            self.connection.clone(),
            status_tx,
            peer_rx,
        );
        let task = tokio::spawn(actor.run());
        self.orchestrator = Some(OrchestratorLink {
            peer_tx,
            status_rx,
            task,
        });
    }

    fn stop_orchestrator(&mut self) {
        if let Some(link) = self.orchestrator.take() {
            link.task.abort();
        }
    }

    fn emit(&self, event: Event) {
        // Nobody listening is fine; events are advisory.
        let _ = self.event_tx.send(event);
    }
}

async fn next_status(orchestrator: Option<&mut OrchestratorLink>) -> SyncStatus {
    match orchestrator {
        Some(link) => match link.status_rx.recv().await {
            Some(status) => status,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Cloneable handle to one pad session.
#[derive(Clone)]
pub struct Session {
    message_tx: mpsc::Sender<SessionMessage>,
    event_tx: broadcast::Sender<Event>,
    connection: ConnectionManager,
}

impl Session {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let (message_tx, message_rx) = mpsc::channel(16);
        let (connection_tx, connection_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = broadcast::channel(64);
        let connection = ConnectionManager::new(connection_tx);
        let actor = SessionActor {
            message_rx,
            connection_rx,
            connection: connection.clone(),
            document: PadDocument::default(),
            event_tx: event_tx.clone(),
            config,
            orchestrator: None,
        };
        tokio::spawn(actor.run());
        Self {
            message_tx,
            event_tx,
            connection,
        }
    }

    /// Events are broadcast; every subscriber sees every event from the
    /// moment it subscribes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Starts listening for a peer. Returns the bound port.
    pub async fn host(&self, port: u16) -> Result<u16, TransportError> {
        self.connection.host(port).await
    }

    pub async fn connect(&self, address: &str, port: u16) -> Result<SocketAddr, TransportError> {
        self.connection.connect(address, port).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Replaces the local pad content and pushes it to the peer. The local
    /// buffer is updated even when the push fails.
    pub async fn send_local_edit(&self, content: String) -> Result<(), TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(SessionMessage::LocalEdit {
                content,
                response_tx,
            })
            .await
            .expect("Session actor task has been killed");
        response_rx
            .await
            .expect("Session actor task has been killed")
    }

    /// Clears the local pad and asks the peer to clear its mirror of it.
    pub async fn send_clear(&self) -> Result<(), TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(SessionMessage::LocalClear { response_tx })
            .await
            .expect("Session actor task has been killed");
        response_rx
            .await
            .expect("Session actor task has been killed")
    }

    pub async fn local_content(&self) -> String {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(SessionMessage::GetLocal { response_tx })
            .await
            .expect("Session actor task has been killed");
        response_rx
            .await
            .expect("Session actor task has been killed")
    }

    pub async fn remote_content(&self) -> String {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(SessionMessage::GetRemote { response_tx })
            .await
            .expect("Session actor task has been killed");
        response_rx
            .await
            .expect("Session actor task has been killed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn local_edits_update_the_buffer_even_when_disconnected() {
        let session = Session::new(SessionConfig::default());

        let result = session.send_local_edit("draft".to_string()).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));

        assert_eq!(session.local_content().await, "draft");
        assert_eq!(session.remote_content().await, "");
    }
}
