//! Sun Grid Engine backend: `qsub`/`qstat`/`qdel`.

use std::collections::HashMap;
use std::path::Path;

use sisyphus_job::ResourceRequirements;
use tokio::process::Command;

use super::{build_command, ClusterBackend};
use crate::engine::{EngineError, EngineTaskState, TaskRef};

pub struct SgeBackend {
    pub gateway_host: Option<String>,
    pub queue: Option<String>,
}

impl SgeBackend {
    pub fn new() -> Self {
        Self {
            gateway_host: None,
            queue: None,
        }
    }

    pub fn with_gateway(mut self, host: impl Into<String>) -> Self {
        self.gateway_host = Some(host.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

impl Default for SgeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterBackend for SgeBackend {
    fn submit_command(&self, task: &TaskRef, resources: &ResourceRequirements, worker_binary: &Path) -> Command {
        let mut args = vec![
            "-terse".to_string(),
            "-cwd".to_string(),
            "-pe".to_string(),
            "smp".to_string(),
            resources.cpu.to_string(),
            "-l".to_string(),
            format!("h_vmem={}G,h_rt={}:00:00", resources.mem_gb.ceil() as u64, resources.time_hours.ceil() as u64),
        ];
        if resources.gpu > 0 {
            args.push("-l".to_string());
            args.push(format!("gpu={}", resources.gpu));
        }
        if let Some(queue) = &self.queue {
            args.push("-q".to_string());
            args.push(queue.clone());
        }
        if let Some(extra) = resources.engine_args.get("qsub_args") {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args.push(worker_binary.display().to_string());
        args.push("worker".to_string());
        args.push(task.job_dir.display().to_string());
        args.push(task.task.clone());
        args.push(task.shard.to_string());
        build_command(self.gateway_host.as_deref(), "qsub", &args)
    }

    fn parse_submit_output(&self, stdout: &str) -> Result<String, EngineError> {
        // `-terse` makes qsub print just the numeric job id.
        stdout
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| EngineError::SubmissionFailed("qsub produced no job id".into()))
    }

    fn query_command(&self) -> Command {
        build_command(self.gateway_host.as_deref(), "qstat", &["-u".to_string(), "*".to_string()])
    }

    fn parse_query_output(&self, stdout: &str) -> HashMap<String, EngineTaskState> {
        let mut out = HashMap::new();
        for line in stdout.lines().skip(2) {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let (Some(job_id), Some(state)) = (cols.first(), cols.get(4)) else {
                continue;
            };
            let mapped = if state.contains('r') {
                EngineTaskState::Running
            } else if state.contains('q') || state.contains('w') {
                EngineTaskState::Queued
            } else {
                EngineTaskState::Unknown
            };
            out.insert(job_id.to_string(), mapped);
        }
        out
    }

    fn kill_command(&self, external_id: &str) -> Command {
        build_command(self.gateway_host.as_deref(), "qdel", &[external_id.to_string()])
    }

    fn name(&self) -> &'static str {
        "sge"
    }
}
