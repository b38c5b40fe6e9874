use nlmkit_core::paths::validate_profile_name;
use nlmkit_core::{CookieJar, Error, Paths, Profile, ProfileMetadata, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CURRENT_FILE: &str = "CURRENT";
const COOKIES_FILE: &str = "cookies.json";
const METADATA_FILE: &str = "metadata.json";
const GENERATION_PREFIX: &str = "gen-";
const KEEP_GENERATIONS: usize = 2;
const READ_ATTEMPTS: usize = 5;

/// Durable per-profile credential storage.
///
/// Each write stages a complete generation directory and then swaps the
/// `CURRENT` pointer with a rename, so readers observe either the previous or
/// the new profile.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    paths: Paths,
}

impl CredentialStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn root(&self) -> &Path {
        &self.paths.base
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn read(&self, profile_name: &str) -> Result<Profile> {
        validate_profile_name(profile_name)?;
        let dir = self.paths.profile_dir(profile_name);

        // A concurrent write may prune the generation between reading CURRENT
        // and opening its files; re-resolve the pointer when that happens.
        for attempt in 1..=READ_ATTEMPTS {
            let generation = match read_current(&dir)? {
                Some(g) => g,
                None => {
                    let legacy = self.read_legacy(profile_name, &dir);
                    // A first write removes the flat files only after CURRENT is in
                    // place, so a read that raced the migration sees it here.
                    if !dir.join(CURRENT_FILE).exists() {
                        return legacy;
                    }
                    debug!(profile = %profile_name, attempt, "Profile migrated during read, retrying");
                    continue;
                }
            };
            match read_generation(profile_name, &dir.join(&generation)) {
                Ok(profile) => return Ok(profile),
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(
                        profile = %profile_name,
                        generation = %generation,
                        attempt,
                        "Generation vanished during read, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Storage(format!(
            "profile '{}' kept changing while being read",
            profile_name
        )))
    }

    fn read_legacy(&self, profile_name: &str, dir: &Path) -> Result<Profile> {
        let cookies_path = dir.join(COOKIES_FILE);
        if !cookies_path.exists() {
            return Err(Error::ProfileNotFound {
                profile_name: profile_name.to_string(),
            });
        }
        let cookies = read_cookies(&cookies_path)?;
        let metadata_path = dir.join(METADATA_FILE);
        let meta = if metadata_path.exists() {
            read_metadata(&metadata_path)?
        } else {
            ProfileMetadata::default()
        };
        debug!(profile = %profile_name, "Read profile from legacy flat layout");
        Ok(Profile::from_parts(profile_name, cookies, meta))
    }

    pub fn write(&self, profile_name: &str, profile: &Profile) -> Result<()> {
        validate_profile_name(profile_name)?;
        let dir = self.paths.profile_dir(profile_name);
        std::fs::create_dir_all(&dir)?;

        let generation = new_generation_name();
        let gen_dir = dir.join(&generation);
        std::fs::create_dir(&gen_dir)?;

        let staged = (|| -> Result<()> {
            let cookies = serde_json::to_vec_pretty(&profile.cookies)?;
            write_synced(&gen_dir.join(COOKIES_FILE), &cookies)?;
            let meta = serde_json::to_vec_pretty(&profile.metadata())?;
            write_synced(&gen_dir.join(METADATA_FILE), &meta)?;
            Ok(())
        })();
        if let Err(e) = staged {
            let _ = std::fs::remove_dir_all(&gen_dir);
            return Err(e);
        }

        replace_file(&dir.join(CURRENT_FILE), generation.as_bytes())?;
        info!(
            profile = %profile_name,
            generation = %generation,
            cookies = profile.cookies.len(),
            "Profile written"
        );

        remove_legacy_files(&dir);
        self.prune(&dir);
        Ok(())
    }

    /// Keeps the newest generations plus whatever `CURRENT` names.
    fn prune(&self, dir: &Path) {
        let current = match read_current(dir) {
            Ok(c) => c,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping prune, CURRENT unreadable");
                return;
            }
        };
        let mut generations = list_generations(dir);
        if generations.len() <= KEEP_GENERATIONS {
            return;
        }
        generations.sort();
        let to_remove = generations.len() - KEEP_GENERATIONS;
        for name in generations.iter().take(to_remove) {
            if current.as_deref() == Some(name.as_str()) {
                continue;
            }
            let path = dir.join(name);
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove old generation");
            } else {
                debug!(path = %path.display(), "Removed old generation");
            }
        }
    }

    pub fn exists(&self, profile_name: &str) -> bool {
        if validate_profile_name(profile_name).is_err() {
            return false;
        }
        let dir = self.paths.profile_dir(profile_name);
        dir.join(CURRENT_FILE).is_file() || dir.join(COOKIES_FILE).is_file()
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let profiles_dir = self.paths.profiles_dir();
        if !profiles_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(&profiles_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .filter(|name| self.exists(name))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn default_profile(&self) -> Result<Option<String>> {
        let path = self.paths.default_profile_file();
        if !path.exists() {
            return Ok(None);
        }
        let name = std::fs::read_to_string(&path)?.trim().to_string();
        if name.is_empty() {
            return Ok(None);
        }
        if !self.exists(&name) {
            warn!(profile = %name, "Default profile points at a missing profile");
            return Ok(None);
        }
        Ok(Some(name))
    }

    pub fn set_default(&self, profile_name: &str) -> Result<()> {
        validate_profile_name(profile_name)?;
        if !self.exists(profile_name) {
            return Err(Error::ProfileNotFound {
                profile_name: profile_name.to_string(),
            });
        }
        std::fs::create_dir_all(&self.paths.base)?;
        replace_file(&self.paths.default_profile_file(), profile_name.as_bytes())?;
        info!(profile = %profile_name, "Default profile switched");
        Ok(())
    }
}

fn new_generation_name() -> String {
    format!(
        "{}{:020}-{}",
        GENERATION_PREFIX,
        chrono::Utc::now().timestamp_micros().max(0),
        uuid::Uuid::new_v4().simple()
    )
}

fn read_current(dir: &Path) -> Result<Option<String>> {
    let path = dir.join(CURRENT_FILE);
    match std::fs::read_to_string(&path) {
        Ok(s) => {
            let name = s.trim().to_string();
            if !name.starts_with(GENERATION_PREFIX) || name.contains('/') || name.contains('\\') {
                return Err(Error::Storage(format!(
                    "{} holds an invalid generation name",
                    path.display()
                )));
            }
            Ok(Some(name))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_generation(profile_name: &str, gen_dir: &Path) -> Result<Profile> {
    let cookies = read_cookies(&gen_dir.join(COOKIES_FILE))?;
    let meta = read_metadata(&gen_dir.join(METADATA_FILE))?;
    Ok(Profile::from_parts(profile_name, cookies, meta))
}

fn read_cookies(path: &Path) -> Result<CookieJar> {
    let raw = std::fs::read_to_string(path)?;
    let trimmed = raw.trim();
    // Older exports may hold a bare `Cookie:` header rather than JSON.
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => CookieJar::from_json_value(&value),
        Err(_) if trimmed.contains('=') => Ok(CookieJar::from_header(trimmed)),
        Err(e) => Err(Error::Storage(format!(
            "unreadable cookie file {}: {}",
            path.display(),
            e
        ))),
    }
}

fn read_metadata(path: &Path) -> Result<ProfileMetadata> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn list_generations(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .filter(|name| name.starts_with(GENERATION_PREFIX))
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn remove_legacy_files(dir: &Path) {
    for name in [COOKIES_FILE, METADATA_FILE] {
        let path = dir.join(name);
        if path.is_file() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed legacy profile file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove legacy file"),
            }
        }
    }
}

fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

/// Write to a sibling temp file, then rename over `path`.
fn replace_file(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = temp_sibling(path);
    if let Err(e) = write_synced(&tmp_path, data) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        Error::Storage(format!("atomic rename to {} failed: {}", path.display(), e))
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(Paths::with_base(dir.path().to_path_buf()));
        (dir, store)
    }

    fn profile(name: &str, sid: &str, email: Option<&str>) -> Profile {
        let mut jar = CookieJar::new();
        jar.insert("SID", sid);
        jar.insert("HSID", "h");
        let mut p = Profile::new(name, jar);
        p.csrf_token = Some(format!("csrf-{}", sid));
        p.session_id = Some("sess".to_string());
        p.account_email = email.map(|e| e.to_string());
        p
    }

    #[test]
    fn test_read_missing_profile() {
        let (_dir, store) = store();
        match store.read("work") {
            Err(Error::ProfileNotFound { profile_name }) => assert_eq!(profile_name, "work"),
            other => panic!("expected ProfileNotFound, got {:?}", other),
        }
        assert!(!store.exists("work"));
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = store();
        let p = profile("work", "s1", Some("a@x.com"));
        store.write("work", &p).unwrap();
        let loaded = store.read("work").unwrap();
        assert_eq!(loaded.cookies, p.cookies);
        assert_eq!(loaded.csrf_token.as_deref(), Some("csrf-s1"));
        assert_eq!(loaded.account_email.as_deref(), Some("a@x.com"));
        assert!(store.exists("work"));
    }

    #[test]
    fn test_repeated_writes_keep_two_generations() {
        let (_dir, store) = store();
        for i in 0..5 {
            store
                .write("work", &profile("work", &format!("s{}", i), None))
                .unwrap();
        }
        let dir = store.paths().profile_dir("work");
        let gens = list_generations(&dir);
        assert_eq!(gens.len(), KEEP_GENERATIONS);
        let current = read_current(&dir).unwrap().unwrap();
        assert!(gens.contains(&current));
        assert_eq!(store.read("work").unwrap().cookies.get("SID"), Some("s4"));
    }

    #[test]
    fn test_staged_generation_without_swap_is_invisible() {
        let (_dir, store) = store();
        store.write("work", &profile("work", "good", None)).unwrap();
        let dir = store.paths().profile_dir("work");
        // Simulate an interrupted write: a complete-looking generation that never became CURRENT.
        let orphan = dir.join(format!("{}{:020}-orphan", GENERATION_PREFIX, i64::MAX));
        std::fs::create_dir(&orphan).unwrap();
        std::fs::write(orphan.join(COOKIES_FILE), r#"{"SID":"bad"}"#).unwrap();
        assert_eq!(store.read("work").unwrap().cookies.get("SID"), Some("good"));
    }

    #[test]
    fn test_legacy_layout_is_read_and_migrated() {
        let (_dir, store) = store();
        let dir = store.paths().profile_dir("old");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(COOKIES_FILE),
            r#"[{"name":"SID","value":"legacy","domain":".google.com"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.join(METADATA_FILE),
            r#"{"csrf_token":"tok","email":"old@x.com"}"#,
        )
        .unwrap();

        let loaded = store.read("old").unwrap();
        assert_eq!(loaded.cookies.get("SID"), Some("legacy"));
        assert_eq!(loaded.account_email.as_deref(), Some("old@x.com"));
        assert!(loaded.session_id.is_none());

        store.write("old", &loaded).unwrap();
        assert!(!dir.join(COOKIES_FILE).exists());
        assert!(dir.join(CURRENT_FILE).exists());
        assert_eq!(store.read("old").unwrap().cookies.get("SID"), Some("legacy"));
    }

    #[test]
    fn test_legacy_header_string_cookie_file() {
        let (_dir, store) = store();
        let dir = store.paths().profile_dir("hdr");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(COOKIES_FILE), "SID=a; HSID=b").unwrap();
        let loaded = store.read("hdr").unwrap();
        assert_eq!(loaded.cookies.get("HSID"), Some("b"));
        assert!(loaded.csrf_token.is_none());
    }

    #[test]
    fn test_list_is_sorted_and_skips_junk() {
        let (_dir, store) = store();
        store.write("zeta", &profile("zeta", "z", None)).unwrap();
        store.write("alpha", &profile("alpha", "a", None)).unwrap();
        std::fs::create_dir_all(store.paths().profile_dir("empty")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_default_profile_pointer() {
        let (_dir, store) = store();
        assert_eq!(store.default_profile().unwrap(), None);
        assert!(matches!(
            store.set_default("ghost"),
            Err(Error::ProfileNotFound { .. })
        ));
        store.write("work", &profile("work", "s", None)).unwrap();
        store.set_default("work").unwrap();
        assert_eq!(store.default_profile().unwrap().as_deref(), Some("work"));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let (_dir, store) = store();
        let p = profile("x", "s", None);
        assert!(matches!(store.write("../x", &p), Err(Error::Validation(_))));
        assert!(!store.exists("../x"));
    }

    #[test]
    fn test_reads_survive_legacy_migration() {
        let (_dir, store) = store();
        let dir = store.paths().profile_dir("work");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(COOKIES_FILE),
            r#"[{"name":"SID","value":"old","domain":".google.com"}]"#,
        )
        .unwrap();
        std::fs::write(dir.join(METADATA_FILE), r#"{"csrf_token":"csrf-old"}"#).unwrap();
        let store = Arc::new(store);

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let p = store.read("work").unwrap();
                        let sid = p.cookies.get("SID").unwrap().to_string();
                        assert_eq!(p.csrf_token, Some(format!("csrf-{}", sid)));
                    }
                })
            })
            .collect();
        store.write("work", &profile("work", "new", None)).unwrap();

        for r in readers {
            r.join().unwrap();
        }
        assert!(!dir.join(COOKIES_FILE).exists());
        assert_eq!(store.read("work").unwrap().cookies.get("SID"), Some("new"));
    }

    #[test]
    fn test_readers_never_see_mixed_generations() {
        let (_dir, store) = store();
        store.write("work", &profile("work", "0", None)).unwrap();
        let store = Arc::new(store);

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 1..20 {
                    store
                        .write("work", &profile("work", &i.to_string(), None))
                        .unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let p = store.read("work").unwrap();
                        let sid = p.cookies.get("SID").unwrap().to_string();
                        assert_eq!(p.csrf_token, Some(format!("csrf-{}", sid)));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
