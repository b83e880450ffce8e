use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::core::model::{Gid, JobSnapshot, JobSource, SnapshotFile};
use crate::rpc::{EngineClient, EngineNotification};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Page size for tellWaiting/tellStopped; nobody mirrors more than this
/// at once.
const TELL_PAGE: u64 = 1000;

#[derive(thiserror::Error, Debug)]
pub enum Aria2Error {
    #[error("engine rpc fault {code}: {message}")]
    Fault { code: i64, message: String },

    #[error("http status error: {0}")]
    Status(reqwest::StatusCode),

    #[error("rpc response carried neither result nor error")]
    EmptyResponse,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcFault>,
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    gid: String,
    status: String,
    #[serde(default)]
    total_length: Option<String>,
    #[serde(default)]
    completed_length: Option<String>,
    #[serde(default)]
    upload_length: Option<String>,
    #[serde(default)]
    dir: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    followed_by: Option<Vec<String>>,
    #[serde(default)]
    files: Option<Vec<FilePayload>>,
    #[serde(default)]
    bittorrent: Option<BitTorrentPayload>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilePayload {
    path: String,
    #[serde(default)]
    selected: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BitTorrentPayload {
    #[serde(default)]
    info: Option<BtInfoPayload>,
}

#[derive(Debug, Clone, Deserialize)]
struct BtInfoPayload {
    #[serde(default)]
    name: Option<String>,
}

fn parse_len(value: &Option<String>) -> u64 {
    value.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0)
}

impl From<StatusPayload> for JobSnapshot {
    fn from(payload: StatusPayload) -> Self {
        let is_torrent = payload.bittorrent.is_some();
        let info_name =
            payload.bittorrent.as_ref().and_then(|bt| bt.info.as_ref()).and_then(|i| i.name.clone());
        let files: Vec<SnapshotFile> = payload
            .files
            .unwrap_or_default()
            .into_iter()
            .map(|file| SnapshotFile {
                path: PathBuf::from(file.path),
                selected: file.selected.as_deref() == Some("true"),
            })
            .collect();
        let name = info_name
            .clone()
            .or_else(|| {
                files.first().and_then(|file| {
                    file.path.file_name().map(|n| n.to_string_lossy().into_owned())
                })
            })
            .unwrap_or_else(|| payload.gid.clone());

        JobSnapshot {
            name,
            dir: PathBuf::from(payload.dir.unwrap_or_default()),
            total_length: parse_len(&payload.total_length),
            completed_length: parse_len(&payload.completed_length),
            upload_length: parse_len(&payload.upload_length),
            is_torrent,
            // A magnet resolving its metadata has a bittorrent section
            // with no resolved info yet.
            is_metadata: is_torrent && info_name.is_none(),
            is_removed: payload.status == "removed",
            is_complete: payload.status == "complete",
            followed_by: payload.followed_by.unwrap_or_default(),
            error_message: payload.error_message.filter(|m| !m.is_empty()),
            files,
            gid: payload.gid,
        }
    }
}

/// Per-gid memory for the notification synthesizer.
#[derive(Debug, Default, Clone)]
struct TrackState {
    status: String,
    bt_done: bool,
    is_torrent: bool,
}

/// JSON-RPC facade over a running aria2 daemon. Notifications are
/// synthesized from a periodic status poll and re-broadcast, so consumers
/// see the same five-kind stream the daemon's push channel would carry.
pub struct Aria2Client {
    http: reqwest::Client,
    endpoint: Url,
    secret: Option<String>,
    event_tx: broadcast::Sender<EngineNotification>,
    seen: Mutex<HashMap<Gid, TrackState>>,
}

impl Aria2Client {
    pub fn new(endpoint: Url, secret: Option<String>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .expect("reqwest client");
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self { http, endpoint, secret, event_tx, seen: Mutex::new(HashMap::new()) })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> anyhow::Result<T> {
        let mut full = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            full.push(json!(format!("token:{secret}")));
        }
        full.extend(params);

        let body = json!({
            "jsonrpc": "2.0",
            "id": "gidherd",
            "method": method,
            "params": full,
        });

        let resp = self.http.post(self.endpoint.clone()).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(Aria2Error::Status(resp.status()).into());
        }
        let envelope: RpcEnvelope<T> = resp.json().await?;
        if let Some(fault) = envelope.error {
            return Err(Aria2Error::Fault { code: fault.code, message: fault.message }.into());
        }
        envelope.result.ok_or_else(|| Aria2Error::EmptyResponse.into())
    }

    /// Keep polling the daemon and translate status transitions into
    /// notifications until the client is dropped.
    pub fn spawn_notifier(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = client.poll_once().await {
                    warn!("engine status poll failed: {err:#}");
                }
                sleep(POLL_INTERVAL).await;
            }
        })
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let mut sweep: Vec<StatusPayload> = self.call("aria2.tellActive", vec![]).await?;
        let waiting: Vec<StatusPayload> =
            self.call("aria2.tellWaiting", vec![json!(0), json!(TELL_PAGE)]).await?;
        let stopped: Vec<StatusPayload> =
            self.call("aria2.tellStopped", vec![json!(0), json!(TELL_PAGE)]).await?;
        sweep.extend(waiting);
        sweep.extend(stopped);

        let mut seen = self.seen.lock().await;
        for payload in sweep {
            let gid = payload.gid.clone();
            let is_torrent = payload.bittorrent.is_some();
            let total = parse_len(&payload.total_length);
            let completed = parse_len(&payload.completed_length);
            let prev = seen.entry(gid.clone()).or_default();
            let was = prev.status.clone();
            prev.is_torrent = is_torrent;

            if payload.status == "active" && was != "active" {
                self.emit(EngineNotification::Started { gid: gid.clone() });
            }
            if is_torrent
                && payload.status == "active"
                && total > 0
                && completed >= total
                && !prev.bt_done
            {
                prev.bt_done = true;
                self.emit(EngineNotification::BtComplete { gid: gid.clone() });
            }
            if payload.status != was {
                match payload.status.as_str() {
                    "complete" => {
                        if is_torrent && !prev.bt_done {
                            prev.bt_done = true;
                            self.emit(EngineNotification::BtComplete { gid: gid.clone() });
                        }
                        self.emit(EngineNotification::Complete { gid: gid.clone() });
                    }
                    "error" => self.emit(EngineNotification::Error { gid: gid.clone() }),
                    "removed" => self.emit(EngineNotification::Stopped { gid: gid.clone() }),
                    _ => {}
                }
            }
            prev.status = payload.status;
        }
        Ok(())
    }

    fn emit(&self, notification: EngineNotification) {
        debug!("engine notification: {notification:?}");
        let _ = self.event_tx.send(notification);
    }
}

#[async_trait]
impl EngineClient for Aria2Client {
    async fn add(
        &self,
        source: &JobSource,
        options: HashMap<String, String>,
    ) -> anyhow::Result<JobSnapshot> {
        let opts = json!(options);
        let gid: String = match source {
            JobSource::Uri(uri) => {
                self.call("aria2.addUri", vec![json!([uri]), opts]).await?
            }
            JobSource::TorrentFile(path) => {
                let raw = tokio::fs::read(path).await?;
                let encoded = BASE64.encode(raw);
                self.call("aria2.addTorrent", vec![json!(encoded), json!([]), opts]).await?
            }
        };
        self.get_status(&gid).await
    }

    async fn get_status(&self, gid: &str) -> anyhow::Result<JobSnapshot> {
        let payload: StatusPayload = self.call("aria2.tellStatus", vec![json!(gid)]).await?;
        Ok(payload.into())
    }

    async fn remove(&self, gid: &str, force: bool, delete_files: bool) -> anyhow::Result<()> {
        // Grab the file list before the daemon forgets the download.
        let files = if delete_files {
            self.get_status(gid).await.map(|snapshot| snapshot.files).unwrap_or_default()
        } else {
            Vec::new()
        };

        let method = if force { "aria2.forceRemove" } else { "aria2.remove" };
        let _: String = self.call(method, vec![json!(gid)]).await?;

        for file in files {
            let control = file.path.with_extension(
                file.path
                    .extension()
                    .map(|ext| format!("{}.aria2", ext.to_string_lossy()))
                    .unwrap_or_else(|| "aria2".to_string()),
            );
            let _ = tokio::fs::remove_file(&file.path).await;
            let _ = tokio::fs::remove_file(&control).await;
        }
        Ok(())
    }

    async fn set_options(
        &self,
        gid: &str,
        options: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        let _: String = self.call("aria2.changeOption", vec![json!(gid), json!(options)]).await?;
        Ok(())
    }

    async fn force_pause(&self, gid: &str) -> anyhow::Result<()> {
        let _: String = self.call("aria2.forcePause", vec![json!(gid)]).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineNotification> {
        self.event_tx.subscribe()
    }
}
