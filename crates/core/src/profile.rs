use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{Error, Result};

/// Named cookies with unique names. Order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cookies.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cookies.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Overwrites same-named entries from `other`, keeps the rest.
    pub fn merge(&mut self, other: &CookieJar) {
        for (name, value) in &other.cookies {
            self.cookies.insert(name.clone(), value.clone());
        }
    }

    /// Value for a `Cookie:` request header.
    pub fn to_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Parse a `Cookie:` header value. Segments without `=` are skipped.
    pub fn from_header(header: &str) -> Self {
        let mut jar = Self::new();
        for part in header.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((name, value)) if !name.trim().is_empty() => {
                    jar.insert(name.trim(), value.trim());
                }
                _ => warn!(segment = %part, "Skipping malformed cookie header segment"),
            }
        }
        jar
    }

    /// Accepts `{name: value}`, a list of `{name, value, ...}` objects, or a header string.
    pub fn from_json_value(value: &serde_json::Value) -> Result<Self> {
        let mut jar = Self::new();
        match value {
            serde_json::Value::Object(map) => {
                for (name, v) in map {
                    match v {
                        serde_json::Value::String(s) => jar.insert(name.clone(), s.clone()),
                        serde_json::Value::Null => {}
                        other => jar.insert(name.clone(), other.to_string()),
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    let name = item.get("name").and_then(|v| v.as_str());
                    let val = item.get("value").and_then(|v| v.as_str());
                    match (name, val) {
                        (Some(n), Some(v)) => jar.insert(n, v),
                        _ => warn!("Skipping cookie entry without name/value"),
                    }
                }
            }
            serde_json::Value::String(header) => {
                jar = Self::from_header(header);
            }
            _ => {
                return Err(Error::Storage(
                    "cookie data must be an object, a list, or a header string".to_string(),
                ))
            }
        }
        Ok(jar)
    }
}

impl FromIterator<(String, String)> for CookieJar {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            cookies: iter.into_iter().collect(),
        }
    }
}

impl Serialize for CookieJar {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.cookies.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CookieJar {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        CookieJar::from_json_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Everything needed to act as one signed-in account.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub cookies: CookieJar,
    pub csrf_token: Option<String>,
    pub session_id: Option<String>,
    pub account_email: Option<String>,
    pub build_label: Option<String>,
    pub last_validated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(name: impl Into<String>, cookies: CookieJar) -> Self {
        Self {
            name: name.into(),
            cookies,
            csrf_token: None,
            session_id: None,
            account_email: None,
            build_label: None,
            last_validated_at: Utc::now(),
        }
    }

    pub fn metadata(&self) -> ProfileMetadata {
        ProfileMetadata {
            csrf_token: self.csrf_token.clone(),
            session_id: self.session_id.clone(),
            email: self.account_email.clone(),
            build_label: self.build_label.clone(),
            last_validated: Some(self.last_validated_at),
        }
    }

    pub fn from_parts(name: impl Into<String>, cookies: CookieJar, meta: ProfileMetadata) -> Self {
        Self {
            name: name.into(),
            cookies,
            csrf_token: meta.csrf_token,
            session_id: meta.session_id,
            account_email: meta.email,
            build_label: meta.build_label,
            last_validated_at: meta.last_validated.unwrap_or_else(Utc::now),
        }
    }
}

/// On-disk shape of `metadata.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileMetadata {
    #[serde(default)]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub build_label: Option<String>,
    #[serde(default)]
    pub last_validated: Option<DateTime<Utc>>,
}
