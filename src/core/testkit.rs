//! Shared fakes for exercising the coordinator without a live engine.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::listener::{
    Controls, DiskProbe, Listener, MessageHandle, MessageRef, StatusSink, StorageSearch,
};
use crate::core::model::{Gid, JobSnapshot, JobSource, Uid};
use crate::core::registry::JobRegistry;
use crate::rpc::{EngineClient, EngineNotification};

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn snapshot(gid: &str) -> JobSnapshot {
    JobSnapshot { gid: gid.to_string(), name: format!("job-{gid}"), ..Default::default() }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Add { options: HashMap<String, String> },
    Remove { gid: Gid, force: bool, delete_files: bool },
    SetOptions { gid: Gid, options: HashMap<String, String> },
    ForcePause { gid: Gid },
}

/// Scriptable engine: `stage` queues per-gid snapshots that `get_status`
/// consumes in order, with the last one sticking so handlers can re-read
/// indefinitely.
pub struct MockEngine {
    snapshots: Mutex<HashMap<Gid, VecDeque<JobSnapshot>>>,
    add_result: Mutex<Option<JobSnapshot>>,
    calls: Mutex<Vec<EngineCall>>,
    tx: broadcast::Sender<EngineNotification>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            snapshots: Mutex::new(HashMap::new()),
            add_result: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            tx,
        })
    }

    pub fn stage(&self, snap: JobSnapshot) {
        let mut map = self.snapshots.lock().unwrap();
        map.entry(snap.gid.clone()).or_default().push_back(snap);
    }

    pub fn set_add_result(&self, snap: JobSnapshot) {
        *self.add_result.lock().unwrap() = Some(snap);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remove_count(&self, gid: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, EngineCall::Remove { gid: g, .. } if g == gid))
            .count()
    }

    pub fn paused(&self, gid: &str) -> bool {
        self.calls()
            .iter()
            .any(|call| matches!(call, EngineCall::ForcePause { gid: g } if g == gid))
    }

    pub fn notify(&self, notification: EngineNotification) {
        let _ = self.tx.send(notification);
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    async fn add(
        &self,
        _source: &JobSource,
        options: HashMap<String, String>,
    ) -> anyhow::Result<JobSnapshot> {
        self.calls.lock().unwrap().push(EngineCall::Add { options });
        self.add_result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("engine refused submission"))
    }

    async fn get_status(&self, gid: &str) -> anyhow::Result<JobSnapshot> {
        let mut map = self.snapshots.lock().unwrap();
        let queue = map.get_mut(gid).ok_or_else(|| anyhow::anyhow!("unknown gid {gid}"))?;
        match queue.len() {
            0 => Err(anyhow::anyhow!("unknown gid {gid}")),
            1 => Ok(queue.front().cloned().unwrap()),
            _ => Ok(queue.pop_front().unwrap()),
        }
    }

    async fn remove(&self, gid: &str, force: bool, delete_files: bool) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(EngineCall::Remove {
            gid: gid.to_string(),
            force,
            delete_files,
        });
        Ok(())
    }

    async fn set_options(
        &self,
        gid: &str,
        options: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::SetOptions { gid: gid.to_string(), options });
        Ok(())
    }

    async fn force_pause(&self, gid: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(EngineCall::ForcePause { gid: gid.to_string() });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineNotification> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Start,
    Complete,
    Error(String),
    UploadError(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerFlags {
    pub leech: bool,
    pub zip: bool,
    pub extract: bool,
    pub select: bool,
    pub seed: bool,
}

/// Records every callback. When attached to a registry it removes its own
/// uid on terminal callbacks, the way real listeners clean up after
/// themselves (a seeding job survives its completion callback).
pub struct RecordingListener {
    uid: Uid,
    flags: ListenerFlags,
    registry: Mutex<Option<JobRegistry>>,
    deregister_on_complete: AtomicBool,
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn with(flags: ListenerFlags) -> Arc<Self> {
        Arc::new(Self {
            uid: Uuid::new_v4(),
            flags,
            registry: Mutex::new(None),
            deregister_on_complete: AtomicBool::new(!flags.seed),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn plain() -> Arc<Self> {
        Self::with(ListenerFlags::default())
    }

    pub fn track_in(&self, registry: &JobRegistry) {
        *self.registry.lock().unwrap() = Some(registry.clone());
    }

    /// Simulate a listener that drops its registry entry inside the
    /// completion callback even though seeding was requested.
    pub fn deregister_on_complete(&self) {
        self.deregister_on_complete.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ListenerEvent::Error(text) | ListenerEvent::UploadError(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    async fn deregister(&self) {
        let registry = self.registry.lock().unwrap().clone();
        if let Some(registry) = registry {
            registry.remove(self.uid).await;
        }
    }
}

#[async_trait]
impl Listener for RecordingListener {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn message(&self) -> MessageRef {
        MessageRef(7)
    }

    fn is_leech(&self) -> bool {
        self.flags.leech
    }

    fn is_zip(&self) -> bool {
        self.flags.zip
    }

    fn extract(&self) -> bool {
        self.flags.extract
    }

    fn select(&self) -> bool {
        self.flags.select
    }

    fn seed(&self) -> bool {
        self.flags.seed
    }

    async fn on_download_start(&self) {
        self.events.lock().unwrap().push(ListenerEvent::Start);
    }

    async fn on_download_complete(&self) {
        self.events.lock().unwrap().push(ListenerEvent::Complete);
        if self.deregister_on_complete.load(Ordering::SeqCst) {
            self.deregister().await;
        }
    }

    async fn on_download_error(&self, message: &str, _controls: Option<Controls>) {
        self.events.lock().unwrap().push(ListenerEvent::Error(message.to_string()));
        self.deregister().await;
    }

    async fn on_upload_error(&self, message: &str) {
        self.events.lock().unwrap().push(ListenerEvent::UploadError(message.to_string()));
        self.deregister().await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Message { target: MessageRef, text: String, controls: Option<Controls> },
    Deleted { handle: MessageHandle },
    Status { target: MessageRef },
    RefreshAll,
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    next_handle: AtomicU64,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn message_texts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Message { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn refresh_count(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, SinkEvent::RefreshAll)).count()
    }

    pub fn status_count(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, SinkEvent::Status { .. })).count()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn send_message(
        &self,
        target: MessageRef,
        text: &str,
        controls: Option<Controls>,
    ) -> anyhow::Result<MessageHandle> {
        let handle = MessageHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.events.lock().unwrap().push(SinkEvent::Message {
            target,
            text: text.to_string(),
            controls,
        });
        Ok(handle)
    }

    async fn delete_message(
        &self,
        _target: MessageRef,
        handle: &MessageHandle,
    ) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(SinkEvent::Deleted { handle: handle.clone() });
        Ok(())
    }

    async fn send_status(&self, target: MessageRef) {
        self.events.lock().unwrap().push(SinkEvent::Status { target });
    }

    async fn refresh_all(&self) {
        self.events.lock().unwrap().push(SinkEvent::RefreshAll);
    }
}

/// Canned duplicate-search results, optionally failing, always recording
/// the queried names.
pub struct FixedSearch {
    result: Option<(String, Controls)>,
    fail: bool,
    queries: Mutex<Vec<String>>,
}

impl FixedSearch {
    pub fn miss() -> Arc<Self> {
        Arc::new(Self { result: None, fail: false, queries: Mutex::new(Vec::new()) })
    }

    pub fn hit(summary: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Some((summary.to_string(), Vec::new())),
            fail: false,
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { result: None, fail: true, queries: Mutex::new(Vec::new()) })
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageSearch for FixedSearch {
    async fn search(&self, name: &str, _quick: bool) -> anyhow::Result<Option<(String, Controls)>> {
        self.queries.lock().unwrap().push(name.to_string());
        if self.fail {
            anyhow::bail!("storage search backend unavailable");
        }
        Ok(self.result.clone())
    }
}

pub struct FixedDisk {
    pub free: u64,
}

impl FixedDisk {
    pub fn with_free(free: u64) -> Arc<Self> {
        Arc::new(Self { free })
    }

    pub fn roomy() -> Arc<Self> {
        Self::with_free(u64::MAX)
    }
}

impl DiskProbe for FixedDisk {
    fn free_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.free)
    }
}

pub struct BrokenDisk;

impl DiskProbe for BrokenDisk {
    fn free_space(&self, _path: &Path) -> std::io::Result<u64> {
        Err(std::io::Error::other("statvfs failed"))
    }
}
