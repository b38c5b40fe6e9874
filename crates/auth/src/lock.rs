use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

type LockKey = (PathBuf, String);

/// Process-wide write locks, one per (store root, profile name).
static PROFILE_LOCKS: Lazy<std::sync::Mutex<HashMap<LockKey, Arc<Mutex<()>>>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

pub fn profile_lock(root: &Path, profile_name: &str) -> Arc<Mutex<()>> {
    let mut locks = PROFILE_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry((root.to_path_buf(), profile_name.to_string()))
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}
