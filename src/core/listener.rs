use async_trait::async_trait;
use std::path::Path;

use crate::core::model::Uid;

/// Opaque reference to the front-end conversation a job was requested
/// from; the sink knows how to route it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef(pub u64);

/// Handle to a message the sink produced, usable for later deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle(pub u64);

/// Inline action attached to a front-end message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub label: String,
    pub data: String,
}

pub type Controls = Vec<Control>;

/// Pause-and-pick controls for a torrent waiting on manual file selection.
pub fn selection_controls(base_url: &str, gid: &str) -> Controls {
    vec![
        Control {
            label: "Select files".to_string(),
            data: format!("{}/app/files?gid={}", base_url.trim_end_matches('/'), gid),
        },
        Control {
            label: "Done selecting".to_string(),
            data: format!("btsel done {}", gid),
        },
    ]
}

/// The originating request's side of a job: delivery preferences plus the
/// callbacks the coordinator fires as the job advances. Implemented per
/// use case (CLI runs, recording fakes in tests) rather than as one
/// struct of optional fields.
#[async_trait]
pub trait Listener: Send + Sync {
    fn uid(&self) -> Uid;
    fn message(&self) -> MessageRef;

    /// Deliver to the chat front end instead of remote storage.
    fn is_leech(&self) -> bool;
    /// Wrap the finished payload in a zip archive before delivery.
    fn is_zip(&self) -> bool;
    /// Unpack the finished payload before delivery.
    fn extract(&self) -> bool;
    /// Manual torrent file selection was requested.
    fn select(&self) -> bool;
    /// Keep seeding after the torrent content finishes.
    fn seed(&self) -> bool;

    async fn on_download_start(&self);
    async fn on_download_complete(&self);
    async fn on_download_error(&self, message: &str, controls: Option<Controls>);
    async fn on_upload_error(&self, message: &str);
}

/// Front-end message surface consumed by the coordinator. Everything here
/// is cosmetic; failures are logged and never abort a handler.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn send_message(
        &self,
        target: MessageRef,
        text: &str,
        controls: Option<Controls>,
    ) -> anyhow::Result<MessageHandle>;

    async fn delete_message(&self, target: MessageRef, handle: &MessageHandle)
        -> anyhow::Result<()>;

    /// Post the initial status display for a freshly registered job.
    async fn send_status(&self, target: MessageRef);

    /// Re-render every live status display.
    async fn refresh_all(&self);
}

/// Remote-storage duplicate lookup. `None` means no match; a `Some`
/// carries a human-readable result summary plus follow-up controls.
#[async_trait]
pub trait StorageSearch: Send + Sync {
    async fn search(&self, name: &str, quick: bool) -> anyhow::Result<Option<(String, Controls)>>;
}

/// Free-space probe for the storage-threshold check, injectable so tests
/// can simulate a nearly full disk.
pub trait DiskProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> std::io::Result<u64>;
}

/// Production probe backed by the platform's statvfs equivalent.
pub struct MountProbe;

impl DiskProbe for MountProbe {
    fn free_space(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }
}
