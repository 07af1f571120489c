use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A job's content-addressed identity: `<module_path>/<ClassName>.<base64url(hash)>`
/// (`spec.md §3`).
///
/// `hash` is the SHA-256 of a canonical serialization of
/// `(ClassName, kept_input_arguments)` — see `sisyphus_hash::sha256_base64url`
/// and `sisyphus_job::Job::compute_id` for how it is produced. This type
/// only owns the *shape* of the identifier and its mapping to a work
/// directory path; it does not compute hashes itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SisyphusId {
    module_path: String,
    class_name: String,
    digest_b64: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SisyphusIdError {
    #[error("sisyphus-id '{0}' is missing a '/' separating module path from class/hash")]
    MissingModuleSeparator(String),
    #[error("sisyphus-id '{0}' is missing a '.' separating class name from hash")]
    MissingHashSeparator(String),
    #[error("sisyphus-id '{0}' has an empty module path, class name, or hash")]
    EmptyComponent(String),
}

impl SisyphusId {
    pub fn new(
        module_path: impl Into<String>,
        class_name: impl Into<String>,
        digest_b64: impl Into<String>,
    ) -> Self {
        Self {
            module_path: module_path.into(),
            class_name: class_name.into(),
            digest_b64: digest_b64.into(),
        }
    }

    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn digest_b64(&self) -> &str {
        &self.digest_b64
    }

    /// The directory name component: `<ClassName>.<hash>`, without the
    /// module path prefix.
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.class_name, self.digest_b64)
    }

    /// The job's work directory, rooted at `work_dir`.
    pub fn work_dir(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.module_path).join(self.dir_name())
    }

    pub fn parse(raw: &str) -> Result<Self, SisyphusIdError> {
        let (module_path, rest) = raw
            .rsplit_once('/')
            .ok_or_else(|| SisyphusIdError::MissingModuleSeparator(raw.to_string()))?;
        let (class_name, digest_b64) = rest
            .split_once('.')
            .ok_or_else(|| SisyphusIdError::MissingHashSeparator(raw.to_string()))?;
        if module_path.is_empty() || class_name.is_empty() || digest_b64.is_empty() {
            return Err(SisyphusIdError::EmptyComponent(raw.to_string()));
        }
        Ok(Self {
            module_path: module_path.to_string(),
            class_name: class_name.to_string(),
            digest_b64: digest_b64.to_string(),
        })
    }
}

impl fmt::Display for SisyphusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.module_path, self.class_name, self.digest_b64)
    }
}

impl std::str::FromStr for SisyphusId {
    type Err = SisyphusIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SisyphusId {
    type Error = SisyphusIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SisyphusId> for String {
    fn from(value: SisyphusId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let id = SisyphusId::new("recipes.asr", "CountVocab", "abc123_-XY");
        let parsed = SisyphusId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn work_dir_nests_under_module_path() {
        let id = SisyphusId::new("recipes.asr", "CountVocab", "abc123");
        let dir = id.work_dir(Path::new("/work"));
        assert_eq!(dir, Path::new("/work/recipes.asr/CountVocab.abc123"));
    }

    #[test]
    fn rejects_missing_separators() {
        assert!(SisyphusId::parse("CountVocab.abc").is_err());
        assert!(SisyphusId::parse("recipes.asr/CountVocababc").is_err());
    }
}
