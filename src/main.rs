mod core;
mod i18n;
mod rpc;

use async_trait::async_trait;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::coordinator::{Coordinator, SubmitRequest};
use crate::core::events::CoordinatorEvent;
use crate::core::human::fmt_bytes;
use crate::core::listener::{
    Controls, Listener, MessageHandle, MessageRef, MountProbe, StatusSink, StorageSearch,
};
use crate::core::model::{JobSource, Uid};
use crate::core::registry::JobRegistry;
use crate::i18n::{get_messages, Locale, Messages};
use crate::rpc::aria2::Aria2Client;
use crate::rpc::EngineClient;

fn build_cli() -> Command {
    let add = Command::new("add")
        .about("Hand a download to the engine and coordinate its lifecycle")
        .arg(
            Arg::new("source")
                .help("http(s) link, magnet link, or local .torrent file")
                .required(true)
                .num_args(1),
        )
        .arg(Arg::new("out").long("out").help("Output filename override").num_args(1))
        .arg(
            Arg::new("auth_header")
                .long("auth-header")
                .help("Authorization header forwarded to the engine")
                .num_args(1),
        )
        .arg(Arg::new("seed_ratio").long("seed-ratio").help("Stop seeding at this ratio").num_args(1))
        .arg(
            Arg::new("seed_time")
                .long("seed-time")
                .help("Stop seeding after this many minutes")
                .num_args(1),
        )
        .arg(
            Arg::new("select")
                .long("select")
                .help("Pause torrents for manual file selection")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Keep seeding after the content finishes")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("leech")
                .long("leech")
                .help("Deliver to chat instead of remote storage")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("zip")
                .long("zip")
                .help("Zip the payload before delivery")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("extract")
                .long("extract")
                .help("Unpack the payload before delivery")
                .action(ArgAction::SetTrue),
        );

    Command::new("gidherd")
        .about("Lifecycle coordinator for an aria2-style download engine")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("rpc_url")
                .long("rpc-url")
                .default_value("http://127.0.0.1:6800/jsonrpc")
                .global(true),
        )
        .arg(Arg::new("rpc_secret").long("rpc-secret").num_args(1).global(true))
        .arg(Arg::new("dir").long("dir").default_value("./downloads").global(true))
        .arg(
            Arg::new("stop_duplicate")
                .long("stop-duplicate")
                .help("Cancel jobs whose payload already exists in storage")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("direct_limit")
                .long("direct-limit")
                .help("Max direct download size in GiB (0 = off)")
                .default_value("0")
                .global(true),
        )
        .arg(
            Arg::new("torrent_limit")
                .long("torrent-limit")
                .help("Max torrent size in GiB (0 = off)")
                .default_value("0")
                .global(true),
        )
        .arg(
            Arg::new("leech_limit")
                .long("leech-limit")
                .help("Max leech job size in GiB (0 = off)")
                .default_value("0")
                .global(true),
        )
        .arg(
            Arg::new("storage_threshold")
                .long("storage-threshold")
                .help("GiB of free space that must remain (0 = off)")
                .default_value("0")
                .global(true),
        )
        .arg(
            Arg::new("torrent_timeout")
                .long("torrent-timeout")
                .help("Engine bt-stop-timeout in seconds (0 = off)")
                .default_value("0")
                .global(true),
        )
        .arg(
            Arg::new("base_url")
                .long("base-url")
                .help("Web root for the torrent file-selection page")
                .num_args(1)
                .global(true),
        )
        .arg(
            Arg::new("engine_option")
                .long("engine-option")
                .help("Default per-job engine option, key=value (repeatable)")
                .action(ArgAction::Append)
                .global(true),
        )
        .arg(
            Arg::new("global_override")
                .long("global-override")
                .help("Option key the operator already sets engine-globally (repeatable)")
                .action(ArgAction::Append)
                .global(true),
        )
        .arg(Arg::new("locale").long("locale").default_value("en").global(true))
        .subcommand(add)
}

fn settings_from(matches: &ArgMatches) -> anyhow::Result<Settings> {
    let parse_gib = |key: &str| -> anyhow::Result<u64> {
        Ok(matches.get_one::<String>(key).map(|s| s.parse()).transpose()?.unwrap_or(0))
    };
    let mut engine_options = HashMap::new();
    if let Some(values) = matches.get_many::<String>("engine_option") {
        for raw in values {
            let (key, value) = raw
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("--engine-option wants key=value, got {raw:?}"))?;
            engine_options.insert(key.to_string(), value.to_string());
        }
    }
    let global_overrides = matches
        .get_many::<String>("global_override")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    Ok(Settings {
        download_dir: matches.get_one::<String>("dir").unwrap().into(),
        stop_duplicate: matches.get_flag("stop_duplicate"),
        direct_limit_gib: parse_gib("direct_limit")?,
        torrent_limit_gib: parse_gib("torrent_limit")?,
        leech_limit_gib: parse_gib("leech_limit")?,
        storage_threshold_gib: parse_gib("storage_threshold")?,
        torrent_timeout_secs: parse_gib("torrent_timeout")?,
        base_url: matches.get_one::<String>("base_url").cloned(),
        engine_options,
        global_overrides,
    })
}

/// Listener for a job submitted from this process: reports through the
/// log, drops its registry entry on terminal callbacks, and wakes the
/// main task when the lifecycle is over.
struct CliListener {
    uid: Uid,
    registry: JobRegistry,
    done: Arc<Notify>,
    leech: bool,
    zip: bool,
    extract: bool,
    select: bool,
    seed: bool,
}

#[async_trait]
impl Listener for CliListener {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn message(&self) -> MessageRef {
        MessageRef(0)
    }

    fn is_leech(&self) -> bool {
        self.leech
    }

    fn is_zip(&self) -> bool {
        self.zip
    }

    fn extract(&self) -> bool {
        self.extract
    }

    fn select(&self) -> bool {
        self.select
    }

    fn seed(&self) -> bool {
        self.seed
    }

    async fn on_download_start(&self) {
        info!("transfer started");
    }

    async fn on_download_complete(&self) {
        info!("transfer finished; delivery would start here");
        if !self.seed {
            self.registry.remove(self.uid).await;
            self.done.notify_one();
        }
    }

    async fn on_download_error(&self, message: &str, _controls: Option<Controls>) {
        error!("transfer failed: {message}");
        self.registry.remove(self.uid).await;
        self.done.notify_one();
    }

    async fn on_upload_error(&self, message: &str) {
        error!("seed ended: {message}");
        self.registry.remove(self.uid).await;
        self.done.notify_one();
    }
}

/// Console rendering of the front-end message contract.
struct ConsoleSink {
    registry: JobRegistry,
    messages: &'static Messages,
}

#[async_trait]
impl StatusSink for ConsoleSink {
    async fn send_message(
        &self,
        _target: MessageRef,
        text: &str,
        controls: Option<Controls>,
    ) -> anyhow::Result<MessageHandle> {
        info!("{text}");
        if let Some(controls) = controls {
            for control in controls {
                info!("  [{}] {}", control.label, control.data);
            }
        }
        Ok(MessageHandle(0))
    }

    async fn delete_message(
        &self,
        _target: MessageRef,
        _handle: &MessageHandle,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_status(&self, _target: MessageRef) {
        let count = self.registry.jobs().await.len();
        info!("{}: {count}", self.messages.status_header);
    }

    async fn refresh_all(&self) {
        for job in self.registry.jobs().await {
            let phase = if job.seeding {
                self.messages.seeding_label
            } else {
                self.messages.transferring_label
            };
            info!("  gid {} {phase}", job.gid);
        }
    }
}

/// Duplicate lookup against the local download root: good enough for a
/// single box, and the trait seam keeps real remote backends pluggable.
struct DirSearch {
    root: PathBuf,
}

#[async_trait]
impl StorageSearch for DirSearch {
    async fn search(&self, name: &str, _quick: bool) -> anyhow::Result<Option<(String, Controls)>> {
        let candidate = self.root.join(name);
        if tokio::fs::try_exists(&candidate).await? {
            Ok(Some((format!("1. {}", candidate.display()), Vec::new())))
        } else {
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = build_cli().get_matches();
    let Some(("add", sub)) = matches.subcommand() else {
        return Ok(());
    };

    let locale = Locale::from_str(sub.get_one::<String>("locale").unwrap());
    let messages = get_messages(locale);
    let settings = Arc::new(settings_from(sub)?);
    tokio::fs::create_dir_all(&settings.download_dir).await?;

    let endpoint: Url = sub.get_one::<String>("rpc_url").unwrap().parse()?;
    let secret = sub.get_one::<String>("rpc_secret").cloned();
    let engine = Aria2Client::new(endpoint, secret);
    let notifier = engine.spawn_notifier();

    let registry = JobRegistry::new();
    let sink = Arc::new(ConsoleSink { registry: registry.clone(), messages });
    let search = Arc::new(DirSearch { root: settings.download_dir.clone() });
    let coordinator = Coordinator::new(
        engine.clone(),
        registry.clone(),
        settings.clone(),
        sink,
        search,
        Arc::new(MountProbe),
    );
    let dispatcher = coordinator.start();

    let raw_source = sub.get_one::<String>("source").unwrap().clone();
    let source = if tokio::fs::try_exists(&raw_source).await.unwrap_or(false) {
        JobSource::TorrentFile(PathBuf::from(&raw_source))
    } else {
        JobSource::Uri(raw_source)
    };

    let done = Arc::new(Notify::new());
    let listener = Arc::new(CliListener {
        uid: Uuid::new_v4(),
        registry: registry.clone(),
        done: done.clone(),
        leech: sub.get_flag("leech"),
        zip: sub.get_flag("zip"),
        extract: sub.get_flag("extract"),
        select: sub.get_flag("select"),
        seed: sub.get_flag("seed"),
    });

    let request = SubmitRequest {
        source,
        dir: settings.download_dir.clone(),
        listener,
        filename: sub.get_one::<String>("out").cloned(),
        auth_header: sub.get_one::<String>("auth_header").cloned(),
        seed_ratio: sub.get_one::<String>("seed_ratio").map(|s| s.parse()).transpose()?,
        seed_time: sub.get_one::<String>("seed_time").map(|s| s.parse()).transpose()?,
    };

    let Some(gid) = coordinator.add_job(request).await? else {
        notifier.abort();
        dispatcher.abort();
        anyhow::bail!("engine refused the download");
    };
    println!("Job started: {gid}");

    let ui_task = spawn_ui(&coordinator, engine.clone(), messages);

    done.notified().await;
    println!("{}", messages.all_done);

    ui_task.abort();
    notifier.abort();
    dispatcher.abort();
    Ok(())
}

/// Render coordinator events as per-gid spinners: one MultiProgress,
/// updated from the event stream plus a slow status poll.
fn spawn_ui(
    coordinator: &Coordinator,
    engine: Arc<dyn EngineClient>,
    messages: &'static Messages,
) -> tokio::task::JoinHandle<()> {
    let mut events = coordinator.subscribe();
    let registry = coordinator.registry().clone();
    tokio::spawn(async move {
        let mp = MultiProgress::new();
        let style = ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}")
            .unwrap()
            .tick_chars("|/-\\ ");
        let mut bars: HashMap<String, ProgressBar> = HashMap::new();

        let mut poll = tokio::time::interval(std::time::Duration::from_secs(2));
        loop {
            tokio::select! {
                event = events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(_) => break,
                    };
                    match event {
                        CoordinatorEvent::JobAdded { gid, name, .. } => {
                            let pb = mp.add(ProgressBar::new_spinner());
                            pb.set_style(style.clone());
                            pb.set_prefix(format!("[{name}]"));
                            pb.enable_steady_tick(std::time::Duration::from_millis(120));
                            pb.set_message(messages.job_added.to_string());
                            bars.insert(gid, pb);
                        }
                        CoordinatorEvent::MetadataResolving { gid } => {
                            if let Some(pb) = bars.get(&gid) {
                                pb.set_message(messages.metadata_resolving.to_string());
                            }
                        }
                        CoordinatorEvent::PolicyRejected { gid, reason } => {
                            if let Some(pb) = bars.get(&gid) {
                                pb.finish_with_message(format!(
                                    "{} ({reason})",
                                    messages.policy_rejected
                                ));
                            }
                        }
                        CoordinatorEvent::SelectionPending { gid } => {
                            let _ = mp.println(format!(
                                "[{gid}] {}",
                                messages.selection_pending
                            ));
                        }
                        CoordinatorEvent::JobCompleted { gid, .. } => {
                            if let Some(pb) = bars.get(&gid) {
                                pb.finish_with_message(messages.job_completed.to_string());
                            }
                        }
                        CoordinatorEvent::SeedingStarted { gid, .. } => {
                            if let Some(pb) = bars.get(&gid) {
                                pb.set_message(messages.seeding_started.to_string());
                            }
                        }
                        CoordinatorEvent::JobError { gid, message } => {
                            let _ = mp.println(format!(
                                "[{}] gid {gid}: {message}",
                                messages.error_prefix
                            ));
                        }
                        CoordinatorEvent::JobRemoved { gid } => {
                            if let Some(pb) = bars.get(&gid) {
                                pb.finish_with_message(messages.job_removed.to_string());
                            }
                        }
                    }
                }
                _ = poll.tick() => {
                    for job in registry.jobs().await {
                        let Some(pb) = bars.get(&job.gid) else { continue };
                        if let Ok(snapshot) = engine.get_status(&job.gid).await {
                            pb.set_message(format!(
                                "{} / {}",
                                fmt_bytes(snapshot.completed_length),
                                fmt_bytes(snapshot.total_length),
                            ));
                        }
                    }
                }
            }
        }
    })
}
