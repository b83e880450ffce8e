pub mod aria2;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::core::model::{Gid, JobSnapshot, JobSource};

/// Push notification kinds the engine emits per gid. Delivery may be
/// duplicated, reordered, or stale; consumers must re-read live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotification {
    Started { gid: Gid },
    Complete { gid: Gid },
    /// Torrent content finished downloading; the job may keep running to
    /// seed.
    BtComplete { gid: Gid },
    Error { gid: Gid },
    Stopped { gid: Gid },
}

/// Blocking-RPC facade over the external download engine. Calls may be
/// issued concurrently; the engine synchronizes internally.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Submit a new job and return its initial snapshot.
    async fn add(
        &self,
        source: &JobSource,
        options: HashMap<String, String>,
    ) -> anyhow::Result<JobSnapshot>;

    async fn get_status(&self, gid: &str) -> anyhow::Result<JobSnapshot>;

    /// Drop the job from the engine; `delete_files` also clears its
    /// on-disk payload and control files.
    async fn remove(&self, gid: &str, force: bool, delete_files: bool) -> anyhow::Result<()>;

    async fn set_options(
        &self,
        gid: &str,
        options: HashMap<String, String>,
    ) -> anyhow::Result<()>;

    async fn force_pause(&self, gid: &str) -> anyhow::Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<EngineNotification>;
}
