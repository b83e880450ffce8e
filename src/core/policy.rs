use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};

use crate::core::config::Settings;
use crate::core::fsops;
use crate::core::human::fmt_bytes;
use crate::core::listener::{DiskProbe, StorageSearch};
use crate::core::model::{Gid, JobSnapshot};
use crate::core::registry::JobRegistry;
use crate::rpc::EngineClient;

/// Let freshly started engine state catch up before reading it.
const GATE_SETTLE: Duration = Duration::from_secs(1);
/// Direct downloads lag a little longer before live state is trustworthy.
const DIRECT_SETTLE: Duration = Duration::from_secs(3);
/// How long to wait for the engine to report a non-zero size.
const SIZE_RESOLVE_WINDOW: Duration = Duration::from_secs(15);
const SIZE_RESOLVE_POLL: Duration = Duration::from_millis(500);

/// One-shot admission decision run right after a job starts: a
/// duplicate-in-storage check, then size/space quotas in a fixed order.
/// Violations cancel the job in the engine and report through the
/// listener; internal failures are logged and the job proceeds.
pub struct PolicyGate {
    engine: Arc<dyn EngineClient>,
    registry: JobRegistry,
    settings: Arc<Settings>,
    search: Arc<dyn StorageSearch>,
    disk: Arc<dyn DiskProbe>,
}

impl PolicyGate {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        registry: JobRegistry,
        settings: Arc<Settings>,
        search: Arc<dyn StorageSearch>,
        disk: Arc<dyn DiskProbe>,
    ) -> Self {
        Self { engine, registry, settings, search, disk }
    }

    /// Never fails the caller: any error inside the checks is contained
    /// here and the job is allowed to continue.
    pub async fn admit(&self, gid: &Gid) -> Option<String> {
        match self.evaluate(gid).await {
            Ok(rejection) => rejection,
            Err(err) => {
                error!("admission checks for gid {gid} failed open: {err:#}");
                None
            }
        }
    }

    async fn evaluate(&self, gid: &Gid) -> anyhow::Result<Option<String>> {
        if self.settings.stop_duplicate {
            if let Some(reason) = self.reject_duplicate(gid).await? {
                return Ok(Some(reason));
            }
        }
        if self.settings.any_limit() {
            if let Some(reason) = self.enforce_limits(gid).await? {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    async fn reject_duplicate(&self, gid: &Gid) -> anyhow::Result<Option<String>> {
        sleep(GATE_SETTLE).await;
        let Some(job) = self.registry.find_by_gid(gid).await else {
            return Ok(None);
        };
        if job.listener.is_leech() || job.listener.select() {
            return Ok(None);
        }
        let mut snapshot = self.engine.get_status(gid).await?;
        if !snapshot.is_torrent {
            sleep(DIRECT_SETTLE).await;
            snapshot = self.engine.get_status(gid).await?;
        }
        info!("checking whether {} already exists in storage", snapshot.name);

        let candidate = if job.listener.is_zip() {
            format!("{}.zip", snapshot.name)
        } else if job.listener.extract() {
            match fsops::get_base_name(&snapshot.name) {
                Ok(base) => base,
                // No usable comparison name; skip the check for this job.
                Err(_) => return Ok(None),
            }
        } else {
            snapshot.name.clone()
        };

        if let Some((summary, controls)) = self.search.search(&candidate, true).await? {
            let text = format!(
                "File/folder already available in storage.\nHere are the search results:\n{summary}"
            );
            job.listener.on_download_error(&text, Some(controls)).await;
            if let Err(err) = self.engine.remove(gid, true, true).await {
                warn!("removing duplicate gid {gid} failed: {err:#}");
            }
            return Ok(Some(text));
        }
        Ok(None)
    }

    async fn enforce_limits(&self, gid: &Gid) -> anyhow::Result<Option<String>> {
        sleep(GATE_SETTLE).await;
        let Some(job) = self.registry.find_by_gid(gid).await else {
            return Ok(None);
        };
        let snapshot = self.resolve_size(gid).await?;
        let size = snapshot.total_length;
        if size == 0 {
            // Size never resolved inside the window; every size limit
            // trivially passes, which is a quota bypass worth seeing.
            warn!("gid {gid} still reports size 0 after the resolve window; limits run against 0");
        }

        let mut violation: Option<String> = None;
        if self.settings.storage_threshold_gib > 0 {
            let threshold = self.settings.storage_threshold();
            let archival = job.listener.is_zip() || job.listener.extract();
            let free = self.disk.free_space(&self.settings.download_dir)?;
            if !fsops::storage_ok(free, size, threshold, archival) {
                violation =
                    Some(format!("You must leave {} free storage", fmt_bytes(threshold)));
            }
        }
        if violation.is_none() && self.settings.direct_limit_gib > 0 && !snapshot.is_torrent {
            let limit = self.settings.direct_limit();
            if size > limit {
                violation = Some(format!("Direct limit is {}", fmt_bytes(limit)));
            }
        }
        if violation.is_none() && self.settings.torrent_limit_gib > 0 && snapshot.is_torrent {
            let limit = self.settings.torrent_limit();
            if size > limit {
                violation = Some(format!("Torrent limit is {}", fmt_bytes(limit)));
            }
        }
        if violation.is_none() && self.settings.leech_limit_gib > 0 && job.listener.is_leech() {
            let limit = self.settings.leech_limit();
            if size > limit {
                violation = Some(format!("Leech limit is {}", fmt_bytes(limit)));
            }
        }

        let Some(reason) = violation else {
            return Ok(None);
        };
        let text = format!("{reason}.\nYour file/folder size is {}", fmt_bytes(size));
        job.listener.on_download_error(&text, None).await;
        // After a redirect the replacement id is the one the engine knows.
        if let Err(err) = self.engine.remove(&snapshot.gid, true, true).await {
            warn!("removing oversized gid {} failed: {err:#}", snapshot.gid);
        }
        Ok(Some(reason))
    }

    /// Wait out the engine's size resolution, following the metadata ->
    /// content redirection if one appears. Gives up after the window and
    /// returns whatever was last observed.
    async fn resolve_size(&self, gid: &Gid) -> anyhow::Result<JobSnapshot> {
        let mut snapshot = self.engine.get_status(gid).await?;
        if snapshot.total_length > 0 {
            return Ok(snapshot);
        }
        let deadline = Instant::now() + SIZE_RESOLVE_WINDOW;
        loop {
            snapshot = self.engine.get_status(gid).await?;
            if let Some(next) = snapshot.followed_by.first().cloned() {
                snapshot = self.engine.get_status(&next).await?;
            }
            if snapshot.total_length > 0 || Instant::now() >= deadline {
                return Ok(snapshot);
            }
            sleep(SIZE_RESOLVE_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::TrackedJob;
    use crate::core::listener::DiskProbe;
    use crate::core::testkit::*;
    use std::sync::Arc;

    struct Rig {
        engine: Arc<MockEngine>,
        registry: JobRegistry,
        search: Arc<FixedSearch>,
        gate: PolicyGate,
    }

    fn gate_rig(settings: Settings, search: Arc<FixedSearch>, disk: Arc<dyn DiskProbe>) -> Rig {
        let engine = MockEngine::new();
        let registry = JobRegistry::new();
        let gate = PolicyGate::new(
            engine.clone(),
            registry.clone(),
            Arc::new(settings),
            search.clone(),
            disk,
        );
        Rig { engine, registry, search, gate }
    }

    async fn track(rig: &Rig, gid: &str, listener: &Arc<RecordingListener>) {
        listener.track_in(&rig.registry);
        rig.registry.insert(TrackedJob::new(gid.to_string(), listener.clone())).await;
    }

    #[tokio::test(start_paused = true)]
    async fn storage_threshold_rejects_with_free_space_message() {
        let settings = Settings { storage_threshold_gib: 5, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::with_free(4 * GIB));
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { total_length: GIB, ..snapshot("g1") });

        let rejected = rig.gate.admit(&"g1".to_string()).await;

        assert!(rejected.is_some());
        let errors = listener.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("5.00GiB free storage"), "got {:?}", errors[0]);
        assert!(errors[0].contains("1.00GiB"));
        assert_eq!(
            rig.engine.calls(),
            vec![EngineCall::Remove { gid: "g1".into(), force: true, delete_files: true }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn direct_limit_reports_limit_and_actual_size() {
        let settings = Settings { direct_limit_gib: 2, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::roomy());
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { total_length: 3 * GIB, ..snapshot("g1") });

        rig.gate.admit(&"g1".to_string()).await;

        let errors = listener.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Direct limit is 2.00GiB"), "got {:?}", errors[0]);
        assert!(errors[0].contains("3.00GiB"));
        assert_eq!(rig.engine.remove_count("g1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_threshold_outranks_direct_limit() {
        let settings =
            Settings { storage_threshold_gib: 5, direct_limit_gib: 2, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::with_free(4 * GIB));
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { total_length: 3 * GIB, ..snapshot("g1") });

        rig.gate.admit(&"g1".to_string()).await;

        let errors = listener.errors();
        assert!(errors[0].contains("free storage"), "storage check runs first: {:?}", errors[0]);
        assert!(!errors[0].contains("Direct limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn direct_limit_ignores_torrents_and_torrent_limit_catches_them() {
        let settings = Settings { direct_limit_gib: 2, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::roomy());
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine
            .stage(JobSnapshot { total_length: 3 * GIB, is_torrent: true, ..snapshot("g1") });
        rig.gate.admit(&"g1".to_string()).await;
        assert!(listener.errors().is_empty());
        assert_eq!(rig.engine.remove_count("g1"), 0);

        let settings = Settings { torrent_limit_gib: 2, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::roomy());
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine
            .stage(JobSnapshot { total_length: 3 * GIB, is_torrent: true, ..snapshot("g1") });
        rig.gate.admit(&"g1".to_string()).await;
        assert!(listener.errors()[0].contains("Torrent limit is 2.00GiB"));
    }

    #[tokio::test(start_paused = true)]
    async fn leech_limit_applies_only_to_leech_jobs() {
        let settings = Settings { leech_limit_gib: 2, ..Default::default() };
        let rig = gate_rig(settings.clone(), FixedSearch::miss(), FixedDisk::roomy());
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { total_length: 3 * GIB, ..snapshot("g1") });
        rig.gate.admit(&"g1".to_string()).await;
        assert!(listener.errors().is_empty());

        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::roomy());
        let listener = RecordingListener::with(ListenerFlags { leech: true, ..Default::default() });
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { total_length: 3 * GIB, ..snapshot("g1") });
        rig.gate.admit(&"g1".to_string()).await;
        assert!(listener.errors()[0].contains("Leech limit is 2.00GiB"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_hit_cancels_job_with_results() {
        let settings = Settings { stop_duplicate: true, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::hit("1. job-g1 (4.2GiB)"), FixedDisk::roomy());
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { is_torrent: true, ..snapshot("g1") });

        let rejected = rig.gate.admit(&"g1".to_string()).await;

        assert!(rejected.is_some());
        let errors = listener.errors();
        assert!(errors[0].contains("already available in storage"));
        assert!(errors[0].contains("1. job-g1 (4.2GiB)"));
        assert_eq!(rig.engine.remove_count("g1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_check_skips_leech_and_manual_selection() {
        for flags in [
            ListenerFlags { leech: true, ..Default::default() },
            ListenerFlags { select: true, ..Default::default() },
        ] {
            let settings = Settings { stop_duplicate: true, ..Default::default() };
            let rig = gate_rig(settings, FixedSearch::hit("match"), FixedDisk::roomy());
            let listener = RecordingListener::with(flags);
            track(&rig, "g1", &listener).await;
            rig.engine.stage(JobSnapshot { is_torrent: true, ..snapshot("g1") });

            rig.gate.admit(&"g1".to_string()).await;

            assert!(listener.errors().is_empty());
            assert!(rig.search.queries().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_check_compares_against_zip_name() {
        let settings = Settings { stop_duplicate: true, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::roomy());
        let listener = RecordingListener::with(ListenerFlags { zip: true, ..Default::default() });
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { is_torrent: true, ..snapshot("g1") });

        rig.gate.admit(&"g1".to_string()).await;

        assert_eq!(rig.search.queries(), vec!["job-g1.zip".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_check_uses_archive_base_name_or_skips() {
        // Recognized archive: compare against the unpacked name.
        let settings = Settings { stop_duplicate: true, ..Default::default() };
        let rig = gate_rig(settings.clone(), FixedSearch::miss(), FixedDisk::roomy());
        let listener =
            RecordingListener::with(ListenerFlags { extract: true, ..Default::default() });
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot {
            is_torrent: true,
            name: "show.tar.gz".to_string(),
            ..snapshot("g1")
        });
        rig.gate.admit(&"g1".to_string()).await;
        assert_eq!(rig.search.queries(), vec!["show".to_string()]);

        // Unrecognized: no comparison name, so the check is skipped.
        let rig = gate_rig(settings, FixedSearch::hit("match"), FixedDisk::roomy());
        let listener =
            RecordingListener::with(ListenerFlags { extract: true, ..Default::default() });
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { is_torrent: true, ..snapshot("g1") });
        rig.gate.admit(&"g1".to_string()).await;
        assert!(listener.errors().is_empty());
        assert!(rig.search.queries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn direct_jobs_reread_live_state_before_searching() {
        let settings = Settings { stop_duplicate: true, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::roomy());
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { name: "placeholder".to_string(), ..snapshot("g1") });
        rig.engine.stage(JobSnapshot { name: "resolved.bin".to_string(), ..snapshot("g1") });

        rig.gate.admit(&"g1".to_string()).await;

        assert_eq!(rig.search.queries(), vec!["resolved.bin".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn search_failure_fails_open() {
        let settings =
            Settings { stop_duplicate: true, direct_limit_gib: 2, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::failing(), FixedDisk::roomy());
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { total_length: 3 * GIB, ..snapshot("g1") });

        let rejected = rig.gate.admit(&"g1".to_string()).await;

        assert!(rejected.is_none());
        assert!(listener.errors().is_empty());
        assert_eq!(rig.engine.remove_count("g1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disk_probe_failure_fails_open() {
        let settings = Settings { storage_threshold_gib: 5, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), Arc::new(BrokenDisk));
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { total_length: GIB, ..snapshot("g1") });

        let rejected = rig.gate.admit(&"g1".to_string()).await;

        assert!(rejected.is_none());
        assert!(listener.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quota_uses_redirected_snapshot_for_size() {
        let settings = Settings { torrent_limit_gib: 2, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::roomy());
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(JobSnapshot { followed_by: vec!["g2".into()], ..snapshot("g1") });
        rig.engine
            .stage(JobSnapshot { is_torrent: true, total_length: 3 * GIB, ..snapshot("g2") });

        rig.gate.admit(&"g1".to_string()).await;

        let errors = listener.errors();
        assert!(errors[0].contains("Torrent limit is 2.00GiB"), "got {errors:?}");
        assert!(errors[0].contains("3.00GiB"));
        // The cancellation targets the replacement id, not the stale one.
        assert_eq!(rig.engine.remove_count("g2"), 1);
        assert_eq!(rig.engine.remove_count("g1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_size_passes_after_bounded_wait() {
        let settings = Settings { direct_limit_gib: 2, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::miss(), FixedDisk::roomy());
        let listener = RecordingListener::plain();
        track(&rig, "g1", &listener).await;
        rig.engine.stage(snapshot("g1"));

        rig.gate.admit(&"g1".to_string()).await;

        assert!(listener.errors().is_empty());
        assert_eq!(rig.engine.remove_count("g1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_gid_passes_untouched() {
        let settings =
            Settings { stop_duplicate: true, direct_limit_gib: 2, ..Default::default() };
        let rig = gate_rig(settings, FixedSearch::hit("match"), FixedDisk::roomy());
        rig.engine.stage(JobSnapshot { total_length: 3 * GIB, ..snapshot("g1") });

        let rejected = rig.gate.admit(&"g1".to_string()).await;

        assert!(rejected.is_none());
        assert!(rig.search.queries().is_empty());
        assert_eq!(rig.engine.remove_count("g1"), 0);
    }
}
