//! Task declarations within a job (`spec.md §4.C`).

use serde::{Deserialize, Serialize};

use crate::resources::ResourceRequirements;

/// A named unit of work a job runs. Shards parameterize the same function
/// with an index; the engine dispatches them independently, and the job is
/// finished once every shard of every task is finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub function_name: String,
    /// Called instead of `function_name` when resuming after an
    /// `Interrupted` retry, if the task is `continuable`. Absent means the
    /// task always restarts from scratch.
    pub resume_function_name: Option<String>,
    pub resources: ResourceRequirements,
    pub shard_count: u32,
    /// A mini-task runs fast and cheap; engines may route it to a
    /// dedicated low-latency pool instead of the general queue
    /// (`spec.md §4.E`).
    pub mini_task: bool,
    /// Whether a retry after `Interrupted` may call
    /// `resume_function_name` instead of restarting, and whether the
    /// worker should preserve any partial progress markers it wrote.
    pub continuable: bool,
}

impl Task {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            resume_function_name: None,
            resources: ResourceRequirements::default(),
            shard_count: 1,
            mini_task: false,
            continuable: false,
        }
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    pub fn with_mini_task(mut self, mini_task: bool) -> Self {
        self.mini_task = mini_task;
        self
    }

    pub fn resumable(mut self, resume_function_name: impl Into<String>) -> Self {
        self.resume_function_name = Some(resume_function_name.into());
        self.continuable = true;
        self
    }

    /// The function to run for a (possibly escalated) retry attempt: the
    /// resume function if this task is continuable and a resume function
    /// was given, else the original entry point.
    pub fn entry_point(&self, is_retry: bool) -> &str {
        if is_retry && self.continuable {
            self.resume_function_name
                .as_deref()
                .unwrap_or(&self.function_name)
        } else {
            &self.function_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_continuable_task_always_uses_entry_function() {
        let t = Task::new("run");
        assert_eq!(t.entry_point(true), "run");
        assert_eq!(t.entry_point(false), "run");
    }

    #[test]
    fn continuable_task_uses_resume_function_on_retry_only() {
        let t = Task::new("run").resumable("resume");
        assert_eq!(t.entry_point(false), "run");
        assert_eq!(t.entry_point(true), "resume");
    }

    #[test]
    fn shard_count_is_never_zero() {
        let t = Task::new("run").with_shard_count(0);
        assert_eq!(t.shard_count, 1);
    }
}
