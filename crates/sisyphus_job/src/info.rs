//! The `info` marker: resource-usage history, retry count, and last-seen
//! timestamp for a job (`spec.md §3`).

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sisyphus_protocol::markers;

/// One heartbeat or retry-escalation event, appended to `info` by the
/// worker (heartbeats) or the manager (retry decisions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub at: DateTime<Utc>,
    pub rss_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEvent {
    pub at: DateTime<Utc>,
    pub cause: String,
    pub escalated_mem_gb: Option<f64>,
    pub escalated_time_hours: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobInfo {
    pub retry_count: u32,
    pub last_seen: Option<DateTime<Utc>>,
    pub resource_history: Vec<ResourceSample>,
    pub retry_history: Vec<RetryEvent>,
}

impl JobInfo {
    pub fn load(job_dir: &Path) -> io::Result<Self> {
        let path = markers::path_in(job_dir, markers::INFO);
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Atomic write via temp-file + rename, matching the Path/Variable
    /// write discipline (`spec.md §3`) so a reader never sees a torn file.
    pub fn save(&self, job_dir: &Path) -> io::Result<()> {
        let path = markers::path_in(job_dir, markers::INFO);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp-write");
        fs::write(&tmp, serde_json::to_vec(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn record_heartbeat(&mut self, rss_mb: Option<f64>, cpu_percent: Option<f64>, now: DateTime<Utc>) {
        self.last_seen = Some(now);
        self.resource_history.push(ResourceSample {
            at: now,
            rss_mb,
            cpu_percent,
        });
    }

    pub fn record_retry(
        &mut self,
        cause: impl Into<String>,
        escalated_mem_gb: Option<f64>,
        escalated_time_hours: Option<f64>,
        now: DateTime<Utc>,
    ) {
        self.retry_count += 1;
        self.retry_history.push(RetryEvent {
            at: now,
            cause: cause.into(),
            escalated_mem_gb,
            escalated_time_hours,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_info_loads_as_default() {
        let dir = tempdir().unwrap();
        let info = JobInfo::load(dir.path()).unwrap();
        assert_eq!(info.retry_count, 0);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let mut info = JobInfo::default();
        info.record_retry("OOM", Some(8.0), None, Utc::now());
        info.save(dir.path()).unwrap();

        let loaded = JobInfo::load(dir.path()).unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.retry_history[0].escalated_mem_gb, Some(8.0));
    }
}
