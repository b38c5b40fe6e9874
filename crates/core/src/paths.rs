use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    /// `$NLMKIT_HOME`, falling back to `~/.nlmkit`.
    pub fn new() -> Self {
        if let Ok(home) = std::env::var("NLMKIT_HOME") {
            if !home.trim().is_empty() {
                return Self {
                    base: PathBuf::from(home),
                };
            }
        }
        let base = dirs::home_dir()
            .map(|h| h.join(".nlmkit"))
            .unwrap_or_else(|| PathBuf::from(".nlmkit"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.base.join("profiles")
    }

    pub fn profile_dir(&self, profile_name: &str) -> PathBuf {
        self.profiles_dir().join(profile_name)
    }

    pub fn default_profile_file(&self) -> PathBuf {
        self.base.join("default_profile")
    }

    /// Browser user-data directories, one per profile so login state never mixes.
    pub fn chrome_profiles_dir(&self) -> PathBuf {
        self.base.join("chrome-profiles")
    }

    pub fn chrome_profile_dir(&self, profile_name: &str) -> PathBuf {
        self.chrome_profiles_dir().join(profile_name)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.profiles_dir())?;
        std::fs::create_dir_all(self.chrome_profiles_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

/// Profile names double as directory names.
pub fn validate_profile_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::Validation(format!(
            "profile name must be 1-64 characters, got {}",
            name.len()
        )));
    }
    if name.starts_with('.') {
        return Err(Error::Validation(format!(
            "profile name '{}' must not start with '.'",
            name
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(Error::Validation(format!(
            "profile name '{}' contains invalid character '{}'",
            name, bad
        )));
    }
    Ok(())
}
