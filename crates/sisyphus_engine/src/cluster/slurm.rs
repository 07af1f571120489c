//! Slurm backend: `sbatch`/`squeue`/`scancel`.

use std::collections::HashMap;
use std::path::Path;

use sisyphus_job::ResourceRequirements;
use tokio::process::Command;

use super::{build_command, ClusterBackend};
use crate::engine::{EngineError, EngineTaskState, TaskRef};

pub struct SlurmBackend {
    pub gateway_host: Option<String>,
    pub partition: Option<String>,
}

impl SlurmBackend {
    pub fn new() -> Self {
        Self {
            gateway_host: None,
            partition: None,
        }
    }

    pub fn with_gateway(mut self, host: impl Into<String>) -> Self {
        self.gateway_host = Some(host.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }
}

impl Default for SlurmBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterBackend for SlurmBackend {
    fn submit_command(&self, task: &TaskRef, resources: &ResourceRequirements, worker_binary: &Path) -> Command {
        let mut args = vec![
            "--parsable".to_string(),
            format!("--cpus-per-task={}", resources.cpu),
            format!("--mem={}G", resources.mem_gb.ceil() as u64),
            format!("--time={}:00:00", resources.time_hours.ceil() as u64),
        ];
        if resources.gpu > 0 {
            args.push(format!("--gpus={}", resources.gpu));
        }
        if let Some(partition) = &self.partition {
            args.push(format!("--partition={partition}"));
        }
        if let Some(extra) = resources.engine_args.get("qsub_args") {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args.push("--wrap".to_string());
        args.push(format!(
            "{} worker {} {} {}",
            worker_binary.display(),
            task.job_dir.display(),
            task.task,
            task.shard
        ));
        build_command(self.gateway_host.as_deref(), "sbatch", &args)
    }

    fn parse_submit_output(&self, stdout: &str) -> Result<String, EngineError> {
        // `--parsable` prints `<job_id>` or `<job_id>;<cluster>`.
        stdout
            .lines()
            .next()
            .and_then(|line| line.split(';').next())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| EngineError::SubmissionFailed("sbatch produced no job id".into()))
    }

    fn query_command(&self) -> Command {
        build_command(
            self.gateway_host.as_deref(),
            "squeue",
            &["--noheader".to_string(), "--format=%i %T".to_string()],
        )
    }

    fn parse_query_output(&self, stdout: &str) -> HashMap<String, EngineTaskState> {
        let mut out = HashMap::new();
        for line in stdout.lines() {
            let mut cols = line.split_whitespace();
            let (Some(job_id), Some(state)) = (cols.next(), cols.next()) else {
                continue;
            };
            let mapped = match state {
                "RUNNING" | "COMPLETING" => EngineTaskState::Running,
                "PENDING" | "CONFIGURING" => EngineTaskState::Queued,
                _ => EngineTaskState::Unknown,
            };
            out.insert(job_id.to_string(), mapped);
        }
        out
    }

    fn kill_command(&self, external_id: &str) -> Command {
        build_command(self.gateway_host.as_deref(), "scancel", &[external_id.to_string()])
    }

    fn name(&self) -> &'static str {
        "slurm"
    }
}
