use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::listener::Listener;

/// Engine-assigned download identifier. Stable for the lifetime of the
/// engine-side job, except for the one metadata -> content replacement
/// reported through `followed_by`.
pub type Gid = String;

/// Registry key: identifies the originating request, not the engine job.
pub type Uid = Uuid;

/// One tracked transfer, owned by the registry.
#[derive(Clone)]
pub struct TrackedJob {
    pub gid: Gid,
    pub listener: Arc<dyn Listener>,
    pub seeding: bool,
    pub started_at: Instant,
}

impl TrackedJob {
    pub fn new(gid: Gid, listener: Arc<dyn Listener>) -> Self {
        Self { gid, listener, seeding: false, started_at: Instant::now() }
    }

    /// Replacement record for a torrent entering its seeding phase.
    /// `started_at` restarts so seeding duration is measured from here.
    pub fn seeding(gid: Gid, listener: Arc<dyn Listener>, started_at: Instant) -> Self {
        Self { gid, listener, seeding: true, started_at }
    }

    pub fn uid(&self) -> Uid {
        self.listener.uid()
    }
}

/// What the caller hands to the engine.
#[derive(Debug, Clone)]
pub enum JobSource {
    Uri(String),
    TorrentFile(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub selected: bool,
}

/// Point-in-time engine state for one gid. Handlers must re-fetch rather
/// than trust a snapshot captured at dispatch time.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
    pub gid: Gid,
    pub name: String,
    pub dir: PathBuf,
    pub total_length: u64,
    pub completed_length: u64,
    pub upload_length: u64,
    pub is_torrent: bool,
    pub is_metadata: bool,
    pub is_removed: bool,
    pub is_complete: bool,
    pub followed_by: Vec<Gid>,
    pub error_message: Option<String>,
    pub files: Vec<SnapshotFile>,
}

impl JobSnapshot {
    /// Share ratio so far. Only meaningful once some content exists.
    pub fn ratio(&self) -> f64 {
        if self.completed_length == 0 {
            return 0.0;
        }
        self.upload_length as f64 / self.completed_length as f64
    }
}
