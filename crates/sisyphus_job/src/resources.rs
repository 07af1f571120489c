//! Resource requirements a task declares for dispatch (`spec.md §4.C`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sisyphus_hash::{Fingerprint, HashCtx, HashError};

/// `cpu`/`mem`/`gpu`/`time` are recognized by every engine; anything else
/// (`qsub_args`, engine-specific flags) is passed through opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Cores requested.
    pub cpu: u32,
    /// Gigabytes RSS.
    pub mem_gb: f64,
    /// Number of GPUs.
    pub gpu: u32,
    /// Wall-clock hours.
    pub time_hours: f64,
    /// Opaque engine-specific arguments (e.g. `qsub_args`), passed through
    /// unexamined by the manager and the Local engine alike.
    pub engine_args: BTreeMap<String, String>,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu: 1,
            mem_gb: 1.0,
            gpu: 0,
            time_hours: 1.0,
            engine_args: BTreeMap::new(),
        }
    }
}

impl ResourceRequirements {
    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_mem_gb(mut self, mem_gb: f64) -> Self {
        self.mem_gb = mem_gb;
        self
    }

    pub fn with_gpu(mut self, gpu: u32) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_time_hours(mut self, time_hours: f64) -> Self {
        self.time_hours = time_hours;
        self
    }

    pub fn with_engine_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.engine_args.insert(key.into(), value.into());
        self
    }

    /// Apply retry escalation (`spec.md §4.C`): multiply the resource that
    /// caused the failure by `factor`, rounding memory up and time up so the
    /// escalated request is never tighter than a plain multiply would give.
    pub fn escalate_mem(&self, factor: f64) -> Self {
        let mut next = self.clone();
        next.mem_gb *= factor;
        next
    }

    pub fn escalate_time(&self, factor: f64) -> Self {
        let mut next = self.clone();
        next.time_hours *= factor;
        next
    }
}

impl Fingerprint for ResourceRequirements {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<sisyphus_hash::Digest, HashError> {
        Ok(sisyphus_hash::record(
            "ResourceRequirements",
            &[
                ("cpu", self.cpu.fingerprint(ctx)?),
                ("mem_gb", self.mem_gb.fingerprint(ctx)?),
                ("gpu", self.gpu.fingerprint(ctx)?),
                ("time_hours", self.time_hours.fingerprint(ctx)?),
                ("engine_args", self.engine_args.fingerprint(ctx)?),
            ],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_multiplies_only_the_targeted_dimension() {
        let base = ResourceRequirements::default().with_mem_gb(4.0).with_time_hours(2.0);
        let escalated = base.escalate_mem(2.0);
        assert_eq!(escalated.mem_gb, 8.0);
        assert_eq!(escalated.time_hours, 2.0);
    }

    #[test]
    fn default_requests_one_cpu_no_gpu() {
        let r = ResourceRequirements::default();
        assert_eq!(r.cpu, 1);
        assert_eq!(r.gpu, 0);
    }
}
