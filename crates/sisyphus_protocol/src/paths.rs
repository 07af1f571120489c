use std::path::PathBuf;
use std::sync::Once;

static CREATE_DIR_WARNED: Once = Once::new();

/// Resolve the Sisyphus home directory.
///
/// Priority:
/// 1) `SISYPHUS_HOME`
/// 2) `HOME`/`USERPROFILE`
/// 3) `./.sisyphus`
pub fn sisyphus_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("SISYPHUS_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".sisyphus");
    }
    PathBuf::from(".").join(".sisyphus")
}

fn ensure_home_dir(home: &PathBuf) {
    if let Err(err) = std::fs::create_dir_all(home) {
        CREATE_DIR_WARNED.call_once(|| {
            eprintln!(
                "Warning: failed to create Sisyphus home directory {}: {}. Set SISYPHUS_HOME or pass --work-dir.",
                home.display(),
                err
            );
        });
    }
}

/// Default work directory: `~/.sisyphus/work`.
pub fn default_work_dir() -> PathBuf {
    let home = sisyphus_home();
    ensure_home_dir(&home);
    home.join("work")
}

/// Default logs directory: `~/.sisyphus/logs`.
pub fn default_logs_dir() -> PathBuf {
    let home = sisyphus_home();
    ensure_home_dir(&home);
    home.join("logs")
}

/// Default manager lockfile path: `~/.sisyphus/manager.lock`.
///
/// Advisory only (`spec.md §5`: "enforcement is advisory"); concurrent
/// managers on the same work directory are this lockfile's responsibility
/// to discourage, not to prevent.
pub fn default_lockfile_path() -> PathBuf {
    let home = sisyphus_home();
    ensure_home_dir(&home);
    home.join("manager.lock")
}
