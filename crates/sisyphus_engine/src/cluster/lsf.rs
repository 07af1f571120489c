//! LSF backend: `bsub`/`bjobs`/`bkill`.

use std::collections::HashMap;
use std::path::Path;

use sisyphus_job::ResourceRequirements;
use tokio::process::Command;

use super::{build_command, ClusterBackend};
use crate::engine::{EngineError, EngineTaskState, TaskRef};

pub struct LsfBackend {
    pub gateway_host: Option<String>,
    pub queue: Option<String>,
}

impl LsfBackend {
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

impl Default for LsfBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterBackend for LsfBackend {
    fn submit_command(&self, task: &TaskRef, resources: &ResourceRequirements, worker_binary: &Path) -> Command {
        let mut args = vec![
            "-n".to_string(),
            resources.cpu.to_string(),
            "-R".to_string(),
            format!("rusage[mem={}]", (resources.mem_gb * 1024.0).ceil() as u64),
            "-W".to_string(),
            format!("{}:00", (resources.time_hours * 60.0).ceil() as u64),
        ];
        if resources.gpu > 0 {
            args.push("-gpu".to_string());
            args.push(format!("num={}", resources.gpu));
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
        build_command(self.gateway_host.as_deref(), "bsub", &args)
    }

    fn parse_submit_output(&self, stdout: &str) -> Result<String, EngineError> {
        // bsub prints `Job <123> is submitted to queue <...>.`
        stdout
            .lines()
            .next()
            .and_then(|line| line.split('<').nth(1))
            .and_then(|rest| rest.split('>').next())
            .map(str::to_string)
            .ok_or_else(|| EngineError::SubmissionFailed("bsub produced no job id".into()))
    }

    fn query_command(&self) -> Command {
        build_command(self.gateway_host.as_deref(), "bjobs", &["-noheader".to_string()])
    }

    fn parse_query_output(&self, stdout: &str) -> HashMap<String, EngineTaskState> {
        let mut out = HashMap::new();
        for line in stdout.lines() {
            let mut cols = line.split_whitespace();
            let (Some(job_id), Some(state)) = (cols.next(), cols.nth(1)) else {
                continue;
            };
            let mapped = match state {
                "RUN" => EngineTaskState::Running,
                "PEND" | "PSUSP" => EngineTaskState::Queued,
                _ => EngineTaskState::Unknown,
            };
            out.insert(job_id.to_string(), mapped);
        }
        out
    }

    fn kill_command(&self, external_id: &str) -> Command {
        build_command(self.gateway_host.as_deref(), "bkill", &[external_id.to_string()])
    }

    fn name(&self) -> &'static str {
        "lsf"
    }
}
