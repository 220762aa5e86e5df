// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conventions and settings shared by both peers.

use std::path::PathBuf;
use std::time::Duration;

/// Default port for the peer TCP link.
pub const DEFAULT_PORT: u16 = 9876;

/// The Syncthing GUI/REST endpoint on the local machine.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8384";

/// Folder id used by both peers; must be identical on both sides.
pub const FOLDER_ID: &str = "peerpad-shared";
pub const FOLDER_LABEL: &str = "PeerPad";

const DEFAULT_FOLDER_NAME: &str = "PeerPad";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the orchestrator needs to talk to the local Syncthing daemon.
///
/// The API key is issued by the daemon and read from its config by the
/// provisioning layer; the engine never parses Syncthing's config itself.
#[derive(Debug, Clone)]
pub struct SyncthingSettings {
    pub api_url: String,
    pub api_key: String,
    /// The shared directory; by convention `~/PeerPad` on both machines.
    pub folder_path: PathBuf,
    /// How often to poll the folder status once pairing is done.
    pub poll_interval: Duration,
}

impl SyncthingSettings {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: api_key.into(),
            folder_path: default_folder_path(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// `~/PeerPad`, falling back to a relative directory if the home directory
/// cannot be determined.
#[must_use]
pub fn default_folder_path() -> PathBuf {
    dirs::home_dir().map_or_else(
        || PathBuf::from(DEFAULT_FOLDER_NAME),
        |home| home.join(DEFAULT_FOLDER_NAME),
    )
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// `None` disables folder orchestration; the text pad still works.
    pub syncthing: Option<SyncthingSettings>,
}
