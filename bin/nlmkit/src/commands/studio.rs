use super::Context;
use anyhow::Context as _;
use nlmkit_core::{Error, Profile};
use nlmkit_studio::{
    to_transport_instructions, Artifact, ArtifactConfig, ArtifactJobTracker, ArtifactKind,
    ArtifactStatus, SlideInstruction,
};
use std::time::Duration;

fn print_artifact(artifact: &Artifact) {
    let title = artifact.title.as_deref().unwrap_or("(untitled)");
    let removed = if artifact.removed_remotely { " [removed]" } else { "" };
    println!(
        "  {:<40} {:<12} {:<12} {}{}",
        artifact.artifact_id, artifact.kind, artifact.status, title, removed
    );
    if let Some(origin) = &artifact.origin_artifact_id {
        println!("  {:<40} revised from {}", "", origin);
    }
}

/// A freshly requested artifact may not be listed yet, so only a job that
/// was seen running can be given up on as removed.
fn keep_waiting(artifact: &Artifact) -> bool {
    if artifact.status.is_terminal() {
        return false;
    }
    artifact.status == ArtifactStatus::Requested || !artifact.removed_remotely
}

/// Poll until the artifact reaches a terminal status.
async fn wait_for(
    tracker: &ArtifactJobTracker,
    profile: &Profile,
    mut artifact: Artifact,
    interval: u64,
) -> anyhow::Result<Artifact> {
    while keep_waiting(&artifact) {
        tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
        artifact = tracker.poll(profile, &artifact.artifact_id).await?;
        println!("  … {}", artifact.status);
    }
    Ok(artifact)
}

pub async fn create(
    notebook_id: &str,
    kind: &str,
    source_ids: Vec<String>,
    options: Option<&str>,
    wait: bool,
    interval: u64,
    profile: Option<String>,
) -> anyhow::Result<()> {
    let kind: ArtifactKind = kind.parse()?;
    let options = match options {
        Some(raw) => serde_json::from_str(raw).context("options must be valid JSON")?,
        None => serde_json::Value::Null,
    };
    let ctx = Context::load()?;
    let profile = ctx.load_profile(profile)?;
    let tracker = ArtifactJobTracker::new(ctx.transport());

    let mut artifact = tracker
        .create(
            &profile,
            kind,
            ArtifactConfig {
                notebook_id: notebook_id.to_string(),
                source_ids,
                options,
            },
        )
        .await?;
    println!("✓ Requested {}", kind);
    print_artifact(&artifact);

    if wait {
        artifact = wait_for(&tracker, &profile, artifact, interval).await?;
        print_artifact(&artifact);
    }
    Ok(())
}

pub async fn poll(
    notebook_id: &str,
    artifact_id: &str,
    wait: bool,
    interval: u64,
    profile: Option<String>,
) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let profile = ctx.load_profile(profile)?;
    let tracker = ArtifactJobTracker::new(ctx.transport());

    tracker.poll_notebook(&profile, notebook_id).await?;
    let mut artifact = tracker.get(artifact_id).ok_or_else(|| Error::ArtifactNotFound {
        artifact_id: artifact_id.to_string(),
    })?;
    if artifact.removed_remotely {
        return Err(Error::ArtifactNotFound {
            artifact_id: artifact_id.to_string(),
        }
        .into());
    }
    if wait {
        artifact = wait_for(&tracker, &profile, artifact, interval).await?;
    }
    print_artifact(&artifact);
    Ok(())
}

pub async fn status(notebook_id: &str, profile: Option<String>) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let profile = ctx.load_profile(profile)?;
    let tracker = ArtifactJobTracker::new(ctx.transport());

    let artifacts = tracker.poll_notebook(&profile, notebook_id).await?;
    if artifacts.is_empty() {
        println!("(No artifacts in notebook {})", notebook_id);
        return Ok(());
    }
    println!("Artifacts in {} ({}):", notebook_id, artifacts.len());
    for artifact in &artifacts {
        print_artifact(artifact);
    }
    Ok(())
}

/// `"3:Make the title bigger"` → slide 3.
fn parse_slide_instruction(raw: &str) -> anyhow::Result<SlideInstruction> {
    let (slide, instruction) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected <slide number>:<instruction>, got '{}'", raw))?;
    let slide: u32 = slide
        .trim()
        .parse()
        .with_context(|| format!("invalid slide number '{}'", slide.trim()))?;
    Ok(SlideInstruction {
        slide,
        instruction: instruction.trim().to_string(),
    })
}

pub async fn revise(
    notebook_id: &str,
    artifact_id: &str,
    slides: &[String],
    profile: Option<String>,
) -> anyhow::Result<()> {
    let instructions = slides
        .iter()
        .map(|s| parse_slide_instruction(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let instructions = to_transport_instructions(&instructions)?;

    let ctx = Context::load()?;
    let profile = ctx.load_profile(profile)?;
    let tracker = ArtifactJobTracker::new(ctx.transport());

    // Learn the deck's kind from the notebook before revising it.
    tracker.poll_notebook(&profile, notebook_id).await?;
    let revised = tracker.revise(&profile, artifact_id, &instructions).await?;
    println!("✓ Revision requested");
    print_artifact(&revised);
    Ok(())
}
