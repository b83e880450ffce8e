use std::collections::HashMap;
use std::path::PathBuf;

const GIB: u64 = 1024 * 1024 * 1024;

/// Operator configuration, assembled once in `main` and shared read-only.
/// All limits are in GiB; zero means the limit is disabled.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub download_dir: PathBuf,
    pub stop_duplicate: bool,
    pub direct_limit_gib: u64,
    pub torrent_limit_gib: u64,
    pub leech_limit_gib: u64,
    pub storage_threshold_gib: u64,
    /// Seconds before the engine gives up on a stalled torrent; zero disables.
    pub torrent_timeout_secs: u64,
    /// Web root for the file-selection page; its presence gates the
    /// selection-prompt flow.
    pub base_url: Option<String>,
    /// Default per-job engine options.
    pub engine_options: HashMap<String, String>,
    /// Option keys the operator also applies engine-globally; removed from
    /// the per-job set so they are not applied twice.
    pub global_overrides: Vec<String>,
}

impl Settings {
    pub fn any_limit(&self) -> bool {
        self.direct_limit_gib > 0
            || self.torrent_limit_gib > 0
            || self.leech_limit_gib > 0
            || self.storage_threshold_gib > 0
    }

    pub fn direct_limit(&self) -> u64 {
        self.direct_limit_gib * GIB
    }

    pub fn torrent_limit(&self) -> u64 {
        self.torrent_limit_gib * GIB
    }

    pub fn leech_limit(&self) -> u64 {
        self.leech_limit_gib * GIB
    }

    pub fn storage_threshold(&self) -> u64 {
        self.storage_threshold_gib * GIB
    }
}
