//! Maps a job's `class_name` to the concrete `Job<A>` type that deserializes
//! `job.save`.
//!
//! The original dispatches the saved job by reflection: load the pickle,
//! it already knows its own class. Rust has no runtime equivalent, so a
//! recipe binary registers each of its `JobArgs` impls here by name at
//! startup, and the worker looks the name up before it can deserialize
//! anything (`spec.md §4.G` step 3).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sisyphus_graph::JobNode;
use sisyphus_job::{Job, JobArgs, JobError};

type Loader = Box<dyn Fn(&Path) -> Result<Arc<dyn JobNode>, JobError> + Send + Sync>;

#[derive(Default)]
pub struct TaskRegistry {
    loaders: HashMap<String, Loader>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the loader for `class_name`, so `job.save` files written by
    /// `Job<A>` can be reloaded by name alone.
    pub fn register<A>(&mut self, class_name: impl Into<String>)
    where
        A: JobArgs + Send + Sync + 'static,
    {
        self.loaders.insert(
            class_name.into(),
            Box::new(|job_dir| Job::<A>::load(job_dir).map(|job| Arc::new(job) as Arc<dyn JobNode>)),
        );
    }

    /// Load `job_dir`'s `job.save`, dispatching on `class_name` to the
    /// matching registered loader.
    pub fn load(&self, class_name: &str, job_dir: &Path) -> Result<Arc<dyn JobNode>, RegistryError> {
        let loader = self
            .loaders
            .get(class_name)
            .ok_or_else(|| RegistryError::UnknownClass(class_name.to_string()))?;
        Ok(loader(job_dir)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no JobArgs impl registered for class '{0}'")]
    UnknownClass(String),
    #[error(transparent)]
    Job(#[from] JobError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use sisyphus_hash::{Digest, HashCtx, HashError};
    use sisyphus_job::Task;
    use tempfile::tempdir;

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Args {
        n: u64,
    }

    impl JobArgs for Args {
        fn kept_fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
            sisyphus_hash::Fingerprint::fingerprint(&self.n, ctx)
        }
    }

    #[test]
    fn registered_class_round_trips_through_job_save() {
        let dir = tempdir().unwrap();
        let job = Job::new("recipes", "Count", Args { n: 7 }, vec![Task::new("run")]).unwrap();
        job.save(dir.path()).unwrap();

        let mut registry = TaskRegistry::new();
        registry.register::<Args>("Count");

        let node = registry.load("Count", dir.path()).unwrap();
        assert_eq!(node.id(), job.id());
    }

    #[test]
    fn unregistered_class_is_an_error() {
        let registry = TaskRegistry::new();
        let err = registry.load("Nope", Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownClass(_)));
    }
}
