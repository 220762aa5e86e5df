// SPDX-License-Identifier: AGPL-3.0-or-later

//! The wire protocol between two peers: newline-delimited UTF-8 lines,
//! each one a JSON object `{"type": <string>, "content": <string>}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Encoder;

/// A single frame of the peer protocol.
///
/// The `type` tag on the wire is the snake_case variant name. Adding a
/// variant is a protocol change; every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Replaces the receiver's remote buffer with the entire current text.
    FullSync { content: String },
    /// Appends to the receiver's remote buffer.
    Text { content: String },
    /// Empties the receiver's remote buffer.
    Clear {
        #[serde(default)]
        content: String,
    },
    /// The sender's Syncthing device identifier, exchanged once the local
    /// daemon is reachable.
    SyncthingDeviceId { content: String },
    /// The sender's folder sync status, sent whenever it changes.
    SyncthingStatus { content: SyncStatus },
}

impl PeerMessage {
    pub fn full_sync(content: impl Into<String>) -> Self {
        Self::FullSync {
            content: content.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    #[must_use]
    pub fn clear() -> Self {
        Self::Clear {
            content: String::new(),
        }
    }

    /// Parses one received line. A failure means the line is dropped by the
    /// caller; it never ends the session.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// State of the shared folder synchronization, as observed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NotInstalled,
    Stopped,
    Starting,
    Active,
    NotAvailable,
    SameMachine,
}

impl SyncStatus {
    /// The value reported to the peer. `SameMachine` only makes sense
    /// locally; on one filesystem the folder is trivially in sync.
    #[must_use]
    pub fn wire(self) -> Self {
        if self == Self::SameMachine {
            Self::Active
        } else {
            self
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let repr = match self {
            Self::NotInstalled => "not installed",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::NotAvailable => "not available",
            Self::SameMachine => "same machine",
        };
        write!(f, "{repr}")
    }
}

/// Encodes outbound frames. Inbound framing uses a plain `LinesCodec`, with
/// parsing done per line at the receive loop, so that one malformed line can
/// be dropped without tearing down the connection.
pub struct PeerMessageCodec;

impl Encoder<PeerMessage> for PeerMessageCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&item)?;
        dst.extend_from_slice(format!("{payload}\n").as_bytes());
        Ok(())
    }
}
