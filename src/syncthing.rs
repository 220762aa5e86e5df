// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrates a local Syncthing daemon so that the two peers' shared
//! folders converge without manual configuration. The only inputs are the
//! peer TCP channel (for exchanging device identifiers and status) and the
//! local daemon's REST API.

use crate::config::{SyncthingSettings, FOLDER_ID, FOLDER_LABEL};
use crate::connection::ConnectionManager;
use crate::protocol::{PeerMessage, SyncStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, info, warn};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const START_TIMEOUT: Duration = Duration::from_secs(30);
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REST_TIMEOUT: Duration = Duration::from_secs(10);
const REST_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// The local Syncthing installation, as far as the orchestrator cares.
///
/// A seam in the style of the transport trait in the sync actor: the
/// orchestration logic runs against any implementation, which keeps it
/// testable without a daemon on the machine.
#[async_trait]
pub trait SyncthingApi: Send + Sync {
    /// Whether the syncthing binary is present on this machine.
    async fn installed(&self) -> bool;
    /// Launches the daemon in the background.
    async fn start_daemon(&self) -> Result<()>;
    async fn ping(&self) -> Result<()>;
    async fn device_id(&self) -> Result<String>;
    /// Registers the peer device and shares the pad folder with it.
    /// Idempotent: devices and folders that are already configured are
    /// left alone.
    async fn share_folder(&self, folder_path: &Path, local_id: &str, peer_id: &str) -> Result<()>;
    /// The daemon-reported state of the pad folder ("idle", "syncing", ...).
    async fn folder_state(&self) -> Result<String>;
}

#[derive(Deserialize)]
struct SystemStatus {
    #[serde(rename = "myID")]
    my_id: String,
}

#[derive(Deserialize)]
struct DbStatus {
    state: String,
}

/// Talks to the daemon's REST API on localhost, authenticated with the
/// API key the daemon issued.
pub struct SyncthingClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl SyncthingClient {
    #[must_use]
    pub fn new(settings: &SyncthingSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .expect("Building a reqwest client with static options should work");
        Self {
            http,
            api_url: settings.api_url.clone(),
            api_key: settings.api_key.clone(),
        }
    }

    fn get(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{endpoint}", self.api_url))
            .header("X-API-Key", &self.api_key)
    }

    fn post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{endpoint}", self.api_url))
            .header("X-API-Key", &self.api_key)
    }

    fn put(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.http
            .put(format!("{}{endpoint}", self.api_url))
            .header("X-API-Key", &self.api_key)
    }

    async fn config(&self) -> Result<Value> {
        let config = self
            .get("/rest/config")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(config)
    }

    async fn add_device(&self, config: &Value, device_id: &str) -> Result<()> {
        let known = config["devices"].as_array().is_some_and(|devices| {
            devices.iter().any(|device| device["deviceID"] == device_id)
        });
        if known {
            debug!("Peer device {device_id} is already registered");
            return Ok(());
        }
        self.post("/rest/config/devices")
            .json(&json!({
                "deviceID": device_id,
                "name": "PeerPad peer",
                "addresses": ["dynamic"],
                "compression": "metadata",
                "introducer": false,
                "paused": false,
                "autoAcceptFolders": false,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SyncthingApi for SyncthingClient {
    async fn installed(&self) -> bool {
        let check = Command::new("syncthing")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        matches!(timeout(VERSION_CHECK_TIMEOUT, check).await, Ok(Ok(status)) if status.success())
    }

    async fn start_daemon(&self) -> Result<()> {
        // The child is intentionally left running; Syncthing outlives us.
        Command::new("syncthing")
            .args(["serve", "--no-browser", "--no-default-folder"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to launch syncthing")?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.get("/rest/system/ping")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn device_id(&self) -> Result<String> {
        let status: SystemStatus = self
            .get("/rest/system/status")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status.my_id)
    }

    async fn share_folder(&self, folder_path: &Path, local_id: &str, peer_id: &str) -> Result<()> {
        let config = self.config().await?;
        self.add_device(&config, peer_id).await?;

        let folder = config["folders"]
            .as_array()
            .and_then(|folders| folders.iter().find(|folder| folder["id"] == FOLDER_ID))
            .cloned();

        if let Some(mut folder) = folder {
            let devices = folder["devices"]
                .as_array_mut()
                .context("Folder config has no device list")?;
            if devices.iter().any(|device| device["deviceID"] == peer_id) {
                debug!("Folder {FOLDER_ID} is already shared with {peer_id}");
                return Ok(());
            }
            devices.push(json!({
                "deviceID": peer_id,
                "introducedBy": "",
                "encryptionPassword": "",
            }));
            self.put(&format!("/rest/config/folders/{FOLDER_ID}"))
                .json(&folder)
                .send()
                .await?
                .error_for_status()?;
        } else {
            self.post("/rest/config/folders")
                .json(&json!({
                    "id": FOLDER_ID,
                    "label": FOLDER_LABEL,
                    "path": folder_path,
                    "type": "sendreceive",
                    "devices": [
                        {"deviceID": local_id, "introducedBy": "", "encryptionPassword": ""},
                        {"deviceID": peer_id, "introducedBy": "", "encryptionPassword": ""},
                    ],
                    "rescanIntervalS": 60,
                    "fsWatcherEnabled": true,
                    "fsWatcherDelayS": 1,
                    "ignorePerms": false,
                    "autoNormalize": true,
                }))
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }

    async fn folder_state(&self) -> Result<String> {
        let status: DbStatus = self
            .get(&format!("/rest/db/status?folder={FOLDER_ID}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status.state)
    }
}

/// Messages from the peer that concern folder sync, forwarded by the
/// session's dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSyncEvent {
    DeviceId(String),
    Status(SyncStatus),
}

/// Drives the daemon bring-up, the device-id handshake and the folder
/// status polling for one connection. Spawned when the session reaches
/// Connected, aborted when it leaves Connected.
pub struct SyncthingActor {
    api: Box<dyn SyncthingApi>,
    settings: SyncthingSettings,
    connection: ConnectionManager,
    status_tx: mpsc::Sender<SyncStatus>,
    peer_rx: mpsc::Receiver<PeerSyncEvent>,
    local_device_id: Option<String>,
    remote_device_id: Option<String>,
    status: Option<SyncStatus>,
    paired: bool,
    peer_available: bool,
}

impl SyncthingActor {
    #[must_use]
    pub fn new(
        api: Box<dyn SyncthingApi>,
        settings: SyncthingSettings,
        connection: ConnectionManager,
        status_tx: mpsc::Sender<SyncStatus>,
        peer_rx: mpsc::Receiver<PeerSyncEvent>,
    ) -> Self {
        Self {
            api,
            settings,
            connection,
            status_tx,
            peer_rx,
            local_device_id: None,
            remote_device_id: None,
            status: None,
            paired: false,
            peer_available: true,
        }
    }

    pub async fn run(mut self) {
        self.bring_up().await;

        let mut poll = interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                event = self.peer_rx.recv() => {
                    match event {
                        Some(PeerSyncEvent::DeviceId(peer_id)) => {
                            self.handle_peer_device_id(peer_id).await;
                        }
                        Some(PeerSyncEvent::Status(status)) => {
                            self.handle_peer_status(status).await;
                        }
                        None => break,
                    }
                }
                _ = poll.tick() => {
                    self.poll_folder().await;
                }
            }
        }
        debug!("Peer channel closed, stopping Syncthing orchestration");
    }

    /// Detect, start if necessary, fetch the local device id and
    /// announce it to the peer.
    async fn bring_up(&mut self) {
        if !self.api.installed().await {
            info!("Syncthing is not installed, folder sync unavailable");
            self.set_status(SyncStatus::NotInstalled).await;
            return;
        }

        if self.api.ping().await.is_err() {
            self.set_status(SyncStatus::Stopped).await;
            info!("Starting the Syncthing daemon");
            if let Err(err) = self.api.start_daemon().await {
                warn!("Failed to start syncthing: {err:#}");
                self.set_status(SyncStatus::NotAvailable).await;
                return;
            }
            self.set_status(SyncStatus::Starting).await;
            if !self.wait_until_reachable().await {
                warn!("Syncthing did not become reachable within {START_TIMEOUT:?}");
                self.set_status(SyncStatus::NotAvailable).await;
                return;
            }
        }

        let device_id = {
            let api = self.api.as_ref();
            with_retries("fetch the local device id", || api.device_id()).await
        };
        let device_id = match device_id {
            Ok(device_id) => device_id,
            Err(err) => {
                warn!("Could not fetch the local device id: {err:#}");
                self.set_status(SyncStatus::NotAvailable).await;
                return;
            }
        };
        info!("Local Syncthing device id: {device_id}");

        if let Err(err) = tokio::fs::create_dir_all(&self.settings.folder_path).await {
            warn!(
                "Could not create the shared folder {}: {err}",
                self.settings.folder_path.display()
            );
        }

        self.local_device_id = Some(device_id.clone());
        if let Err(err) = self
            .connection
            .send(PeerMessage::SyncthingDeviceId { content: device_id })
            .await
        {
            debug!("Could not announce the device id to the peer: {err}");
        }
    }

    async fn wait_until_reachable(&self) -> bool {
        let deadline = Instant::now() + START_TIMEOUT;
        while Instant::now() < deadline {
            if self.api.ping().await.is_ok() {
                return true;
            }
            sleep(START_POLL_INTERVAL).await;
        }
        false
    }

    /// Pair with the peer's daemon, unless both ids are the same
    /// machine.
    async fn handle_peer_device_id(&mut self, peer_id: String) {
        self.peer_available = true;
        if self.paired && self.remote_device_id.as_deref() == Some(peer_id.as_str()) {
            debug!("Already paired with peer device {peer_id}");
            return;
        }
        info!("Peer Syncthing device id: {peer_id}");
        self.remote_device_id = Some(peer_id.clone());

        let Some(local_id) = self.local_device_id.clone() else {
            debug!("Local daemon is not available, cannot pair with the peer device");
            return;
        };

        if local_id == peer_id {
            // Both endpoints run on one host; the folder is the same
            // directory and needs no network sync.
            info!("Peer runs on this machine, skipping folder pairing");
            self.set_status(SyncStatus::SameMachine).await;
            return;
        }

        let shared = {
            let api = self.api.as_ref();
            let folder_path = self.settings.folder_path.clone();
            with_retries("share the pad folder", || {
                api.share_folder(&folder_path, &local_id, &peer_id)
            })
            .await
        };
        match shared {
            Ok(()) => {
                info!("Shared folder configured with the peer device");
                self.paired = true;
                self.poll_folder().await;
            }
            Err(err) => {
                warn!("Could not configure the shared folder: {err:#}");
                self.set_status(SyncStatus::NotAvailable).await;
            }
        }
    }

    /// Folder sync needs both sides: while the peer reports itself
    /// unavailable, the local status stays `NotAvailable` no matter how
    /// healthy the local daemon looks.
    async fn handle_peer_status(&mut self, status: SyncStatus) {
        debug!("Peer reported sync status: {status}");
        if matches!(status, SyncStatus::NotInstalled | SyncStatus::NotAvailable) {
            self.peer_available = false;
            self.set_status(SyncStatus::NotAvailable).await;
        } else {
            let recovered = !self.peer_available;
            self.peer_available = true;
            if recovered {
                self.poll_folder().await;
            }
        }
    }

    /// Map the daemon-reported folder state onto our status.
    async fn poll_folder(&mut self) {
        if !self.paired || !self.peer_available {
            return;
        }
        let state = {
            let api = self.api.as_ref();
            with_retries("read the folder status", || api.folder_state()).await
        };
        let status = match state {
            Ok(state) => map_folder_state(&state),
            Err(err) => {
                debug!("Folder status poll failed: {err:#}");
                SyncStatus::NotAvailable
            }
        };
        self.set_status(status).await;
    }

    /// Publishes on the status bus and reports to the peer, only on change.
    async fn set_status(&mut self, status: SyncStatus) {
        if self.status == Some(status) {
            return;
        }
        self.status = Some(status);
        let _ = self.status_tx.send(status).await;
        if let Err(err) = self
            .connection
            .send(PeerMessage::SyncthingStatus {
                content: status.wire(),
            })
            .await
        {
            debug!("Could not report the sync status to the peer: {err}");
        }
    }
}

fn map_folder_state(state: &str) -> SyncStatus {
    match state {
        "idle" | "scanning" | "syncing" | "sync-preparing" | "scan-waiting" | "sync-waiting"
        | "cleaning" | "clean-waiting" => SyncStatus::Active,
        _ => SyncStatus::NotAvailable,
    }
}

/// Transient REST failures (daemon warming up, localhost momentarily
/// unreachable) are retried with doubling delays; they only postpone
/// reaching Active, they are never fatal.
async fn with_retries<T, Fut>(what: &str, mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = RETRY_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < REST_ATTEMPTS => {
                debug!("Attempt {attempt} to {what} failed: {err:#}, retrying in {delay:?}");
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use temp_dir::TempDir;

    #[derive(Clone)]
    struct FakeSyncthing {
        installed: bool,
        running: bool,
        device_id: String,
        folder_state: String,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeSyncthing {
        fn running_with_id(device_id: &str) -> Self {
            Self {
                installed: true,
                running: true,
                device_id: device_id.to_string(),
                folder_state: "idle".to_string(),
                calls: Arc::default(),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncthingApi for FakeSyncthing {
        async fn installed(&self) -> bool {
            self.installed
        }

        async fn start_daemon(&self) -> Result<()> {
            self.calls.lock().unwrap().push("start".to_string());
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            if self.running {
                Ok(())
            } else {
                bail!("connection refused")
            }
        }

        async fn device_id(&self) -> Result<String> {
            Ok(self.device_id.clone())
        }

        async fn share_folder(
            &self,
            _folder_path: &Path,
            local_id: &str,
            peer_id: &str,
        ) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("share {local_id} {peer_id}"));
            Ok(())
        }

        async fn folder_state(&self) -> Result<String> {
            Ok(self.folder_state.clone())
        }
    }

    fn spawn_actor(
        fake: FakeSyncthing,
    ) -> (
        mpsc::Sender<PeerSyncEvent>,
        mpsc::Receiver<SyncStatus>,
        mpsc::Receiver<crate::connection::ConnectionEvent>,
        TempDir,
    ) {
        let (peer_tx, peer_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = mpsc::channel(8);
        // A connection with no active link; sends fail with NotConnected,
        // which the orchestrator tolerates.
        let (event_tx, event_rx) = mpsc::channel(8);
        let connection = ConnectionManager::new(event_tx);
        let folder = TempDir::new().expect("Failed to create temporary folder");
        let mut settings = SyncthingSettings::new("test-key");
        settings.folder_path = folder.path().join("PeerPad");
        settings.poll_interval = Duration::from_millis(25);
        let actor = SyncthingActor::new(Box::new(fake), settings, connection, status_tx, peer_rx);
        tokio::spawn(actor.run());
        (peer_tx, status_rx, event_rx, folder)
    }

    async fn expect_status(status_rx: &mut mpsc::Receiver<SyncStatus>) -> SyncStatus {
        timeout(Duration::from_secs(5), status_rx.recv())
            .await
            .expect("timed out waiting for a sync status")
            .expect("status channel closed")
    }

    #[tokio::test]
    async fn missing_binary_reports_not_installed() {
        let fake = FakeSyncthing {
            installed: false,
            ..FakeSyncthing::running_with_id("LOCAL")
        };
        let (_peer_tx, mut status_rx, _event_rx, _folder) = spawn_actor(fake);
        assert_eq!(expect_status(&mut status_rx).await, SyncStatus::NotInstalled);
    }

    #[tokio::test]
    async fn same_device_id_skips_pairing() {
        let fake = FakeSyncthing::running_with_id("SAME-DEVICE");
        let (peer_tx, mut status_rx, _event_rx, _folder) = spawn_actor(fake.clone());

        peer_tx
            .send(PeerSyncEvent::DeviceId("SAME-DEVICE".to_string()))
            .await
            .unwrap();

        assert_eq!(expect_status(&mut status_rx).await, SyncStatus::SameMachine);
        assert!(fake.calls().iter().all(|call| !call.starts_with("share")));
    }

    #[tokio::test]
    async fn distinct_device_ids_pair_and_go_active() {
        let fake = FakeSyncthing::running_with_id("LOCAL");
        let (peer_tx, mut status_rx, _event_rx, _folder) = spawn_actor(fake.clone());

        peer_tx
            .send(PeerSyncEvent::DeviceId("REMOTE".to_string()))
            .await
            .unwrap();

        assert_eq!(expect_status(&mut status_rx).await, SyncStatus::Active);
        assert_eq!(fake.calls(), vec!["share LOCAL REMOTE".to_string()]);
    }

    #[tokio::test]
    async fn peer_without_daemon_downgrades_local_status() {
        let fake = FakeSyncthing::running_with_id("LOCAL");
        let (peer_tx, mut status_rx, _event_rx, _folder) = spawn_actor(fake);

        peer_tx
            .send(PeerSyncEvent::Status(SyncStatus::NotInstalled))
            .await
            .unwrap();

        assert_eq!(expect_status(&mut status_rx).await, SyncStatus::NotAvailable);
    }

    #[tokio::test]
    async fn peer_unavailability_sticks_until_the_peer_recovers() {
        let fake = FakeSyncthing::running_with_id("LOCAL");
        let (peer_tx, mut status_rx, _event_rx, _folder) = spawn_actor(fake);

        peer_tx
            .send(PeerSyncEvent::DeviceId("REMOTE".to_string()))
            .await
            .unwrap();
        assert_eq!(expect_status(&mut status_rx).await, SyncStatus::Active);

        peer_tx
            .send(PeerSyncEvent::Status(SyncStatus::NotAvailable))
            .await
            .unwrap();
        assert_eq!(expect_status(&mut status_rx).await, SyncStatus::NotAvailable);

        // The folder polls keep running, but a healthy local folder must
        // not override the downgraded status while the peer is down.
        assert!(
            timeout(Duration::from_millis(300), status_rx.recv())
                .await
                .is_err()
        );

        peer_tx
            .send(PeerSyncEvent::Status(SyncStatus::Active))
            .await
            .unwrap();
        assert_eq!(expect_status(&mut status_rx).await, SyncStatus::Active);
    }

    #[tokio::test]
    async fn device_id_handshake_is_symmetric() {
        let first = FakeSyncthing::running_with_id("AAA");
        let second = FakeSyncthing::running_with_id("BBB");
        let (first_tx, mut first_status, _first_rx, _first_folder) = spawn_actor(first.clone());
        let (second_tx, mut second_status, _second_rx, _second_folder) =
            spawn_actor(second.clone());

        first_tx
            .send(PeerSyncEvent::DeviceId("BBB".to_string()))
            .await
            .unwrap();
        second_tx
            .send(PeerSyncEvent::DeviceId("AAA".to_string()))
            .await
            .unwrap();

        assert_eq!(expect_status(&mut first_status).await, SyncStatus::Active);
        assert_eq!(expect_status(&mut second_status).await, SyncStatus::Active);

        // Each side registered exactly the other's local identifier.
        assert_eq!(first.calls(), vec!["share AAA BBB".to_string()]);
        assert_eq!(second.calls(), vec!["share BBB AAA".to_string()]);
    }

    #[tokio::test]
    async fn repeated_device_id_pairs_once() {
        let fake = FakeSyncthing::running_with_id("LOCAL");
        let (peer_tx, mut status_rx, _event_rx, _folder) = spawn_actor(fake.clone());

        peer_tx
            .send(PeerSyncEvent::DeviceId("REMOTE".to_string()))
            .await
            .unwrap();
        assert_eq!(expect_status(&mut status_rx).await, SyncStatus::Active);

        peer_tx
            .send(PeerSyncEvent::DeviceId("REMOTE".to_string()))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(fake.calls(), vec!["share LOCAL REMOTE".to_string()]);
    }

    #[test]
    fn folder_state_mapping() {
        assert_eq!(map_folder_state("idle"), SyncStatus::Active);
        assert_eq!(map_folder_state("syncing"), SyncStatus::Active);
        assert_eq!(map_folder_state("error"), SyncStatus::NotAvailable);
        assert_eq!(map_folder_state("outofsync"), SyncStatus::NotAvailable);
    }
}
