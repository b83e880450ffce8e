use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::core::config::Settings;
use crate::core::events::CoordinatorEvent;
use crate::core::fsops;
use crate::core::human::fmt_duration;
use crate::core::listener::{selection_controls, DiskProbe, Listener, StatusSink, StorageSearch};
use crate::core::model::{Gid, JobSnapshot, JobSource, TrackedJob};
use crate::core::policy::PolicyGate;
use crate::core::registry::JobRegistry;
use crate::rpc::{EngineClient, EngineNotification};

/// How long the dispatcher waits on the notification stream before
/// logging that the engine has gone quiet.
const NOTIFICATION_LIVENESS: Duration = Duration::from_secs(60);
/// Engine state right after a start notification is unreliable.
const METADATA_SETTLE: Duration = Duration::from_secs(1);
const METADATA_POLL: Duration = Duration::from_millis(500);
/// Torrent state right after content completion is unreliable too.
const BT_COMPLETE_SETTLE: Duration = Duration::from_secs(1);
/// A stop can be a transient stall; only report death after this grace.
const STOP_GRACE: Duration = Duration::from_secs(6);

/// Near-zero upload cap. Never the literal 0: the engine reads that as
/// "unlimited".
const INITIAL_UPLOAD_LIMIT: &str = "1K";

const METADATA_WAIT_MSG: &str =
    "Downloading metadata, wait and then you can select files. Use a torrent file to avoid this wait.";
const SELECTION_PROMPT_MSG: &str =
    "Your download is paused. Choose files, then press Done selecting to start downloading.";
const DEAD_TORRENT_MSG: &str = "Dead torrent!";

/// A new transfer to hand to the engine.
pub struct SubmitRequest {
    pub source: JobSource,
    pub dir: PathBuf,
    pub listener: Arc<dyn Listener>,
    pub filename: Option<String>,
    pub auth_header: Option<String>,
    pub seed_ratio: Option<f64>,
    pub seed_time: Option<u64>,
}

/// Drives every tracked job through its lifecycle by reacting to engine
/// notifications. Cheap to clone; one clone runs per spawned handler.
#[derive(Clone)]
pub struct Coordinator {
    engine: Arc<dyn EngineClient>,
    registry: JobRegistry,
    settings: Arc<Settings>,
    sink: Arc<dyn StatusSink>,
    gate: Arc<PolicyGate>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        registry: JobRegistry,
        settings: Arc<Settings>,
        sink: Arc<dyn StatusSink>,
        search: Arc<dyn StorageSearch>,
        disk: Arc<dyn DiskProbe>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let gate = Arc::new(PolicyGate::new(
            engine.clone(),
            registry.clone(),
            settings.clone(),
            search,
            disk,
        ));
        Self { engine, registry, settings, sink, gate, event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Consume the engine's notification stream, spawning one task per
    /// notification so a slow handler never delays the next delivery.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        let mut notifications = coordinator.engine.subscribe();
        tokio::spawn(async move {
            loop {
                let notification = match timeout(NOTIFICATION_LIVENESS, notifications.recv()).await
                {
                    Ok(Ok(notification)) => notification,
                    Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                        warn!("notification stream lagged, {missed} dropped");
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => break,
                    Err(_) => {
                        debug!(
                            "no engine notifications for {}s",
                            NOTIFICATION_LIVENESS.as_secs()
                        );
                        continue;
                    }
                };
                let handler = coordinator.clone();
                tokio::spawn(async move { handler.dispatch(notification).await });
            }
        })
    }

    /// Handlers contain their own failures; nothing propagates back here.
    pub(crate) async fn dispatch(&self, notification: EngineNotification) {
        match notification {
            EngineNotification::Started { gid } => self.on_started(gid).await,
            EngineNotification::Complete { gid } => self.on_complete(gid).await,
            EngineNotification::BtComplete { gid } => self.on_bt_complete(gid).await,
            EngineNotification::Stopped { gid } => self.on_stopped(gid).await,
            EngineNotification::Error { gid } => self.on_error(gid).await,
        }
    }

    async fn on_started(&self, gid: Gid) {
        let snapshot = match self.engine.get_status(&gid).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("status fetch for started gid {gid} failed: {err:#}");
                return;
            }
        };

        if snapshot.is_metadata {
            info!("download started: gid {gid} metadata");
            let _ = self.event_tx.send(CoordinatorEvent::MetadataResolving { gid: gid.clone() });
            sleep(METADATA_SETTLE).await;
            if let Some(job) = self.registry.find_by_gid(&gid).await {
                if job.listener.select() {
                    let notice = self
                        .sink
                        .send_message(job.listener.message(), METADATA_WAIT_MSG, None)
                        .await
                        .ok();
                    let mut live = snapshot;
                    loop {
                        sleep(METADATA_POLL).await;
                        if live.is_removed || !live.followed_by.is_empty() {
                            break;
                        }
                        match self.engine.get_status(&gid).await {
                            Ok(next) => live = next,
                            // Gone from the engine entirely; stop waiting.
                            Err(_) => break,
                        }
                    }
                    if let Some(handle) = notice {
                        let _ = self.sink.delete_message(job.listener.message(), &handle).await;
                    }
                }
            }
            return;
        }

        info!("download started: {} gid {gid}", snapshot.name);
        if let Some(reason) = self.gate.admit(&gid).await {
            let _ = self.event_tx.send(CoordinatorEvent::PolicyRejected { gid, reason });
        }
    }

    async fn on_complete(&self, gid: Gid) {
        let snapshot = match self.engine.get_status(&gid).await {
            Ok(snapshot) => snapshot,
            Err(_) => return,
        };

        if let Some(new_gid) = snapshot.followed_by.first().cloned() {
            info!("gid {gid} followed by {new_gid}");
            if let Some(job) = self.registry.find_by_gid(&new_gid).await {
                if let (Some(base_url), true) =
                    (self.settings.base_url.as_deref(), job.listener.select())
                {
                    best_effort("force-pause", &new_gid, self.engine.force_pause(&new_gid)).await;
                    let controls = selection_controls(base_url, &new_gid);
                    let _ = self
                        .sink
                        .send_message(job.listener.message(), SELECTION_PROMPT_MSG, Some(controls))
                        .await;
                    let _ = self
                        .event_tx
                        .send(CoordinatorEvent::SelectionPending { gid: new_gid });
                }
            }
        } else if snapshot.is_torrent {
            if let Some(job) = self.registry.find_by_gid(&gid).await {
                if job.seeding {
                    info!("cancelling seed: {} gid {gid}", snapshot.name);
                    job.listener.on_upload_error(&seed_summary(&snapshot, job.started_at)).await;
                    best_effort("remove", &gid, self.engine.remove(&gid, true, true)).await;
                    let _ = self.event_tx.send(CoordinatorEvent::JobRemoved { gid });
                }
            }
        } else {
            info!("download complete: {} gid {gid}", snapshot.name);
            if let Some(job) = self.registry.find_by_gid(&gid).await {
                job.listener.on_download_complete().await;
                best_effort("remove", &gid, self.engine.remove(&gid, true, true)).await;
                let _ = self
                    .event_tx
                    .send(CoordinatorEvent::JobCompleted { gid, name: snapshot.name });
            }
        }
    }

    async fn on_bt_complete(&self, gid: Gid) {
        let seed_start = Instant::now();
        sleep(BT_COMPLETE_SETTLE).await;
        let snapshot = match self.engine.get_status(&gid).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("status fetch for finished torrent gid {gid} failed: {err:#}");
                return;
            }
        };
        info!("torrent content complete: {} gid {gid}", snapshot.name);
        let Some(job) = self.registry.find_by_gid(&gid).await else {
            return;
        };

        if job.listener.select() {
            for file in &snapshot.files {
                if file.selected {
                    continue;
                }
                if tokio::fs::try_exists(&file.path).await.unwrap_or(false) {
                    let _ = tokio::fs::remove_file(&file.path).await;
                }
            }
            fsops::clean_unwanted(&snapshot.dir).await;
        }

        if job.listener.seed() {
            if let Err(err) = self.engine.set_options(&gid, seed_throttle()).await {
                error!(
                    "{err:#}: cannot throttle seeding for gid {gid}; a global seed-time of 0 \
                     without a per-download seed-time disables it"
                );
            }
        } else {
            best_effort("force-pause", &gid, self.engine.force_pause(&gid)).await;
        }

        job.listener.on_download_complete().await;

        let live = match self.engine.get_status(&gid).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("post-completion refresh for gid {gid} failed: {err:#}");
                return;
            }
        };

        if job.listener.seed() {
            if live.is_complete {
                // Nothing left to seed; same endgame as a seed cancel.
                if self.registry.find_by_gid(&gid).await.is_some() {
                    info!("cancelling seed: {} gid {gid}", live.name);
                    job.listener.on_upload_error(&seed_summary(&live, job.started_at)).await;
                    best_effort("remove", &gid, self.engine.remove(&gid, true, true)).await;
                    let _ = self.event_tx.send(CoordinatorEvent::JobRemoved { gid });
                }
            } else {
                let uid = job.uid();
                {
                    let mut jobs = self.registry.lock().await;
                    if !jobs.contains_key(&uid) {
                        drop(jobs);
                        best_effort("remove", &gid, self.engine.remove(&gid, true, true)).await;
                        return;
                    }
                    jobs.insert(
                        uid,
                        TrackedJob::seeding(gid.clone(), job.listener.clone(), seed_start),
                    );
                }
                info!("seeding started: {} gid {gid}", live.name);
                self.sink.refresh_all().await;
                let _ = self
                    .event_tx
                    .send(CoordinatorEvent::SeedingStarted { gid, name: live.name });
            }
        } else {
            best_effort("remove", &gid, self.engine.remove(&gid, true, true)).await;
            let _ = self.event_tx.send(CoordinatorEvent::JobRemoved { gid });
        }
    }

    async fn on_stopped(&self, gid: Gid) {
        sleep(STOP_GRACE).await;
        if let Some(job) = self.registry.find_by_gid(&gid).await {
            job.listener.on_download_error(DEAD_TORRENT_MSG, None).await;
            let _ = self.event_tx.send(CoordinatorEvent::JobError {
                gid,
                message: DEAD_TORRENT_MSG.to_string(),
            });
        }
    }

    async fn on_error(&self, gid: Gid) {
        info!("download error notification: gid {gid}");
        let message = match self.engine.get_status(&gid).await {
            Ok(snapshot) => {
                let message = snapshot
                    .error_message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string());
                info!("engine error for gid {gid}: {message}");
                message
            }
            Err(_) => "Unknown error".to_string(),
        };
        if let Some(job) = self.registry.find_by_gid(&gid).await {
            job.listener.on_download_error(&message, None).await;
        }
        let _ = self.event_tx.send(CoordinatorEvent::JobError { gid, message });
    }

    /// Build the engine arguments, submit, and register the job. A
    /// rejection by the engine is reported to the requesting chat and
    /// yields `Ok(None)`.
    pub async fn add_job(&self, request: SubmitRequest) -> anyhow::Result<Option<Gid>> {
        let mut options: HashMap<String, String> = HashMap::new();
        options.insert("dir".to_string(), request.dir.display().to_string());
        options.insert("max-upload-limit".to_string(), INITIAL_UPLOAD_LIMIT.to_string());

        let mut defaults = self.settings.engine_options.clone();
        for key in &self.settings.global_overrides {
            defaults.remove(key);
        }
        options.extend(defaults);

        if let Some(name) = &request.filename {
            options.insert("out".to_string(), sanitize_filename::sanitize(name));
        }
        if let Some(auth) = &request.auth_header {
            options.insert("header".to_string(), auth.clone());
        }
        if let Some(ratio) = request.seed_ratio {
            options.insert("seed-ratio".to_string(), ratio.to_string());
        }
        if let Some(seed_time) = request.seed_time {
            options.insert("seed-time".to_string(), seed_time.to_string());
        }
        if self.settings.torrent_timeout_secs > 0 {
            options.insert(
                "bt-stop-timeout".to_string(),
                self.settings.torrent_timeout_secs.to_string(),
            );
        }

        let added = self.engine.add(&request.source, options).await?;

        // The engine owns its own copy now; drop the local artifact.
        if let JobSource::TorrentFile(path) = &request.source {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                let _ = tokio::fs::remove_file(path).await;
            }
        }

        if let Some(raw) = added.error_message.as_deref().filter(|m| !m.is_empty()) {
            // Angle brackets would read as markup in the front end.
            let text = raw.replace('<', " ").replace('>', " ");
            info!("engine rejected download: {text}");
            let _ = self.sink.send_message(request.listener.message(), &text, None).await;
            return Ok(None);
        }

        {
            let mut jobs = self.registry.lock().await;
            jobs.insert(
                request.listener.uid(),
                TrackedJob::new(added.gid.clone(), request.listener.clone()),
            );
            info!("download registered: gid {}", added.gid);
        }
        request.listener.on_download_start().await;
        if !request.listener.select() {
            self.sink.send_status(request.listener.message()).await;
        }
        let _ = self.event_tx.send(CoordinatorEvent::JobAdded {
            gid: added.gid.clone(),
            uid: request.listener.uid(),
            name: added.name,
        });
        Ok(Some(added.gid))
    }
}

fn seed_throttle() -> HashMap<String, String> {
    HashMap::from([("max-upload-limit".to_string(), INITIAL_UPLOAD_LIMIT.to_string())])
}

fn seed_summary(snapshot: &JobSnapshot, since: Instant) -> String {
    format!(
        "Seeding stopped with ratio {:.3} and time {}",
        snapshot.ratio(),
        fmt_duration(since.elapsed())
    )
}

/// Non-critical engine calls never abort a handler; log and move on.
async fn best_effort<T>(
    what: &str,
    gid: &str,
    call: impl Future<Output = anyhow::Result<T>>,
) {
    if let Err(err) = call.await {
        warn!("{what} for gid {gid} failed: {err:#}");
    }
}
