use crate::artifact::{Artifact, ArtifactConfig, ArtifactKind, ArtifactStatus};
use crate::decode::{self, ArtifactRow, CREATE_ARTIFACT, LIST_ARTIFACTS, REVISE_SLIDE_DECK};
use chrono::Utc;
use nlmkit_core::{Error, Profile, Result};
use nlmkit_rpc::RpcTransport;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const STUDIO_CLIENT: i64 = 2;
const LISTING_FILTER: &str = "NOT artifact.status = \"ARTIFACT_STATUS_SUGGESTED\"";

/// Drives studio generation jobs and remembers what it has seen.
///
/// Polling is one-shot: callers decide the cadence.
pub struct ArtifactJobTracker {
    transport: Arc<RpcTransport>,
    artifacts: Mutex<HashMap<String, Artifact>>,
}

impl ArtifactJobTracker {
    pub fn new(transport: Arc<RpcTransport>) -> Self {
        Self {
            transport,
            artifacts: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Artifact>> {
        self.artifacts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an artifact obtained elsewhere.
    ///
    /// Re-tracking a known id folds the record into the existing one: status
    /// never regresses and the origin and creation time are kept.
    pub fn track(&self, artifact: Artifact) -> Result<()> {
        artifact.validate()?;
        let mut registry = self.registry();
        match registry.get_mut(&artifact.artifact_id) {
            Some(existing) => merge_tracked(existing, artifact),
            None => {
                registry.insert(artifact.artifact_id.clone(), artifact);
            }
        }
        Ok(())
    }

    pub fn get(&self, artifact_id: &str) -> Option<Artifact> {
        self.registry().get(artifact_id).cloned()
    }

    /// Tracked artifacts of one notebook, oldest first.
    pub fn tracked(&self, notebook_id: &str) -> Vec<Artifact> {
        let mut list: Vec<Artifact> = self
            .registry()
            .values()
            .filter(|a| a.notebook_id == notebook_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub async fn create(
        &self,
        profile: &Profile,
        kind: ArtifactKind,
        config: ArtifactConfig,
    ) -> Result<Artifact> {
        let params = creation_params(kind, &config)?;
        let response = self
            .transport
            .call_at(profile, CREATE_ARTIFACT, params, &notebook_path(&config.notebook_id))
            .await?;
        let row = decode::created_artifact(&response)?;

        let mut artifact = Artifact::requested(&row.artifact_id, &config.notebook_id, kind);
        apply_row(&mut artifact, &row);
        info!(
            artifact_id = %artifact.artifact_id,
            notebook_id = %artifact.notebook_id,
            kind = %kind,
            status = %artifact.status,
            "Artifact requested"
        );
        self.track(artifact.clone())?;
        Ok(artifact)
    }

    /// Refresh one tracked artifact from the notebook listing.
    pub async fn poll(&self, profile: &Profile, artifact_id: &str) -> Result<Artifact> {
        let notebook_id = self
            .get(artifact_id)
            .map(|a| a.notebook_id)
            .ok_or_else(|| Error::ArtifactNotFound {
                artifact_id: artifact_id.to_string(),
            })?;
        self.poll_notebook(profile, &notebook_id).await?;
        self.get(artifact_id).ok_or_else(|| Error::ArtifactNotFound {
            artifact_id: artifact_id.to_string(),
        })
    }

    /// List a notebook's artifacts, tracking any not seen before.
    pub async fn poll_notebook(&self, profile: &Profile, notebook_id: &str) -> Result<Vec<Artifact>> {
        if notebook_id.trim().is_empty() {
            return Err(Error::Validation("notebook id must not be empty".to_string()));
        }
        let params = json!([[STUDIO_CLIENT], notebook_id, LISTING_FILTER]);
        let response = self
            .transport
            .call_at(profile, LIST_ARTIFACTS, params, &notebook_path(notebook_id))
            .await?;
        let rows = decode::artifact_listing(&response)?;
        debug!(notebook_id = %notebook_id, count = rows.len(), "Artifact listing");

        let listed: HashSet<&str> = rows.iter().map(|r| r.artifact_id.as_str()).collect();
        let mut registry = self.registry();

        for artifact in registry.values_mut() {
            if artifact.notebook_id == notebook_id
                && !listed.contains(artifact.artifact_id.as_str())
                && !artifact.removed_remotely
            {
                warn!(artifact_id = %artifact.artifact_id, "Artifact no longer listed remotely");
                artifact.removed_remotely = true;
                artifact.updated_at = Utc::now();
            }
        }

        let mut seen = Vec::with_capacity(rows.len());
        for row in &rows {
            let artifact = registry.entry(row.artifact_id.clone()).or_insert_with(|| {
                Artifact::requested(
                    &row.artifact_id,
                    notebook_id,
                    row.kind.unwrap_or(ArtifactKind::Other(0)),
                )
            });
            let before = artifact.status;
            apply_row(artifact, row);
            if artifact.status != before {
                info!(
                    artifact_id = %artifact.artifact_id,
                    from = %before,
                    to = %artifact.status,
                    "Artifact status changed"
                );
            }
            seen.push(artifact.clone());
        }
        Ok(seen)
    }

    /// Fork a new slide deck from `artifact_id` with per-slide instructions
    /// (0-based slide indices). The original record is left as is.
    pub async fn revise(
        &self,
        profile: &Profile,
        artifact_id: &str,
        instructions: &[(i64, String)],
    ) -> Result<Artifact> {
        validate_instructions(instructions)?;
        let original = self.get(artifact_id).ok_or_else(|| Error::ArtifactNotFound {
            artifact_id: artifact_id.to_string(),
        })?;
        if original.kind != ArtifactKind::SlideDeck {
            return Err(Error::Validation(format!(
                "only slide decks can be revised, {} is a {}",
                artifact_id, original.kind
            )));
        }

        let edits: Vec<Value> = instructions
            .iter()
            .map(|(index, text)| json!([index, text]))
            .collect();
        let params = json!([[STUDIO_CLIENT], artifact_id, [edits]]);
        let response = self
            .transport
            .call_at(profile, REVISE_SLIDE_DECK, params, &notebook_path(&original.notebook_id))
            .await?;
        let row = decode::revised_artifact(&response, artifact_id)?;

        let mut revised =
            Artifact::requested(&row.artifact_id, &original.notebook_id, ArtifactKind::SlideDeck);
        revised.origin_artifact_id = Some(artifact_id.to_string());
        apply_row(&mut revised, &row);
        info!(
            artifact_id = %revised.artifact_id,
            origin = %artifact_id,
            slides = instructions.len(),
            "Slide deck revision requested"
        );
        self.track(revised.clone())?;
        Ok(revised)
    }
}

fn notebook_path(notebook_id: &str) -> String {
    format!("/notebook/{}", notebook_id)
}

/// Fold one observed row into a tracked record.
fn apply_row(artifact: &mut Artifact, row: &ArtifactRow) {
    artifact.status = artifact.status.advance(row.status);
    if let Some(title) = &row.title {
        artifact.title = Some(title.clone());
    }
    if let (ArtifactKind::Other(_), Some(kind)) = (artifact.kind, row.kind) {
        artifact.kind = kind;
    }
    artifact.removed_remotely = false;
    artifact.updated_at = Utc::now();
}

fn merge_tracked(existing: &mut Artifact, incoming: Artifact) {
    existing.status = existing.status.advance(incoming.status);
    if incoming.title.is_some() {
        existing.title = incoming.title;
    }
    if matches!(existing.kind, ArtifactKind::Other(_)) {
        existing.kind = incoming.kind;
    }
    if existing.origin_artifact_id.is_none() {
        existing.origin_artifact_id = incoming.origin_artifact_id;
    }
    existing.removed_remotely = incoming.removed_remotely;
    existing.updated_at = incoming.updated_at.max(existing.updated_at);
}

/// `[[2], notebook_id, content]` with the type code at `content[2]`, the
/// sources at `content[3]` and the options at the kind's slot.
fn creation_params(kind: ArtifactKind, config: &ArtifactConfig) -> Result<Value> {
    if config.notebook_id.trim().is_empty() {
        return Err(Error::Validation("notebook id must not be empty".to_string()));
    }
    if let ArtifactKind::Other(code) = kind {
        return Err(Error::Validation(format!(
            "cannot create artifacts of unknown type {}",
            code
        )));
    }
    let options = if config.options.is_null() {
        kind.default_options()
    } else {
        config.options.clone()
    };

    let slot = kind.options_slot();
    let len = slot.map_or(4, |s| s + 1);
    let mut content = vec![Value::Null; len];
    content[2] = json!(kind.type_code());
    content[3] = Value::Array(
        config
            .source_ids
            .iter()
            .map(|id| json!([[id]]))
            .collect(),
    );
    match slot {
        Some(s) => content[s] = options,
        None if !options.is_null() => {
            return Err(Error::Validation(format!("{} takes no options", kind)));
        }
        None => {}
    }
    Ok(json!([[STUDIO_CLIENT], config.notebook_id, content]))
}

fn validate_instructions(instructions: &[(i64, String)]) -> Result<()> {
    if instructions.is_empty() {
        return Err(Error::Validation(
            "at least one slide instruction is required".to_string(),
        ));
    }
    for (index, text) in instructions {
        if *index < 0 {
            return Err(Error::Validation(format!(
                "slide index must be 0 or greater, got {}",
                index
            )));
        }
        if text.trim().is_empty() {
            return Err(Error::Validation(format!(
                "instruction for slide index {} is empty",
                index
            )));
        }
    }
    Ok(())
}
