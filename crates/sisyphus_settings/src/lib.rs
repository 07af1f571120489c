//! Process-wide configuration (`spec.md §6` "Settings surface").
//!
//! One [`Settings`] value is built once in `main` and threaded by reference
//! into the manager/engine/worker constructors — never read back out of
//! global or lazy-static state, matching the teacher's explicit
//! `SystemConfig`/`SentinelConfig` pattern.

use std::path::PathBuf;
use std::sync::Arc;

use sisyphus_engine::{Engine, EngineSelector, LocalCapacity, LocalEngine};

/// Compatibility switches for [`sisyphus_hash`], kept separate from the
/// hasher itself so enabling one doesn't require recompiling recipe code —
/// recipes read these through `Settings`, not through hasher globals.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashCompatFlags {
    /// Treat absent optional fields the same as fields explicitly set to
    /// their type's default, for migrating recipes written before a field
    /// was added (`spec.md §9`, "hash-changed-for-live-job").
    pub treat_absent_as_default: bool,
}

/// Everything a process needs to behave consistently with every other
/// process sharing the same work directory (`spec.md §6`).
#[derive(Clone)]
pub struct Settings {
    /// `WAIT_PERIOD_BETWEEN_CHECKS`: manager tick interval.
    pub wait_period_between_checks_secs: u64,
    /// `WAIT_PERIOD_JOB_FS_SYNC`: how long a missing marker is trusted
    /// absent before the manager treats the filesystem as caught up
    /// (`spec.md §5`, NFS attribute-cache delay).
    pub wait_period_job_fs_sync_secs: u64,
    /// `JOB_AUTO_CLEANUP`: auto-remove orphan job directories once their
    /// grace period elapses.
    pub job_auto_cleanup: bool,
    /// How long an orphan job directory's `finished.run` must age before
    /// housekeeping removes it (`spec.md §4.H`) — distinct from
    /// `wait_period_job_fs_sync_secs`, which governs trusting an absent
    /// marker as caught-up NFS state, not orphan removal.
    pub orphan_grace_period_secs: u64,
    /// `SHOW_JOB_TARGETS`: observability toggle for target-membership
    /// output.
    pub show_job_targets: bool,
    pub hash_compat: HashCompatFlags,
    pub work_dir: PathBuf,
    engine: Arc<EngineSelector>,
}

impl Settings {
    /// Defaults plus an arbitrary, already-assembled engine selector
    /// (cluster backends, test doubles, or any mix of named engines)
    /// rooted at `work_dir`.
    pub fn with_engine_selector(work_dir: impl Into<PathBuf>, engine: Arc<EngineSelector>) -> Self {
        Self {
            wait_period_between_checks_secs: sisyphus_protocol::defaults::DEFAULT_WAIT_PERIOD_BETWEEN_CHECKS_SECS,
            wait_period_job_fs_sync_secs: sisyphus_protocol::defaults::DEFAULT_WAIT_PERIOD_JOB_FS_SYNC_SECS,
            job_auto_cleanup: true,
            orphan_grace_period_secs: sisyphus_protocol::defaults::DEFAULT_ORPHAN_GRACE_PERIOD_SECS,
            show_job_targets: false,
            hash_compat: HashCompatFlags::default(),
            work_dir: work_dir.into(),
            engine,
        }
    }

    /// Defaults plus a Local-only engine selector rooted at `work_dir`,
    /// pointing at `worker_binary` for subprocess dispatch.
    pub fn with_local_engine(work_dir: impl Into<PathBuf>, worker_binary: impl Into<PathBuf>, capacity: LocalCapacity) -> Self {
        let worker_binary = worker_binary.into();
        let local: Arc<dyn Engine> = Arc::new(LocalEngine::new(capacity, worker_binary));
        let engine = Arc::new(EngineSelector::new("local", "local").with_engine("local", local));
        Self::with_engine_selector(work_dir, engine)
    }

    /// The configured engine selector, the `engine()` entry of `spec.md
    /// §6`'s Settings surface table.
    pub fn engine(&self) -> &EngineSelector {
        &self.engine
    }

    pub fn with_wait_period_between_checks_secs(mut self, secs: u64) -> Self {
        self.wait_period_between_checks_secs = secs;
        self
    }

    pub fn with_wait_period_job_fs_sync_secs(mut self, secs: u64) -> Self {
        self.wait_period_job_fs_sync_secs = secs;
        self
    }

    pub fn with_job_auto_cleanup(mut self, enabled: bool) -> Self {
        self.job_auto_cleanup = enabled;
        self
    }

    pub fn with_orphan_grace_period_secs(mut self, secs: u64) -> Self {
        self.orphan_grace_period_secs = secs;
        self
    }

    pub fn with_show_job_targets(mut self, enabled: bool) -> Self {
        self.show_job_targets = enabled;
        self
    }

    /// Overrides from environment variables (`spec.md §6`: "settings path,
    /// hash compatibility toggles, network-FS sync delay override,
    /// force-no-color for terminal output").
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(secs) = std::env::var("SISYPHUS_WAIT_PERIOD_JOB_FS_SYNC") {
            if let Ok(secs) = secs.parse() {
                self.wait_period_job_fs_sync_secs = secs;
            }
        }
        if std::env::var("SISYPHUS_HASH_COMPAT_TREAT_ABSENT_AS_DEFAULT").is_ok() {
            self.hash_compat.treat_absent_as_default = true;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_local_engine_defaults_match_spec_constants() {
        let settings = Settings::with_local_engine(
            "/tmp/sisyphus-work",
            "/usr/local/bin/sisyphus",
            LocalCapacity {
                cpu: 4,
                mem_gb: 16.0,
                gpu: 0,
            },
        );
        assert_eq!(settings.wait_period_between_checks_secs, 30);
        assert!(settings.job_auto_cleanup);
        assert_eq!(settings.orphan_grace_period_secs, 3600);
    }
}
