use super::Context;
use anyhow::Context as _;

pub async fn run(
    operation_id: &str,
    params: &str,
    source_path: &str,
    profile: Option<String>,
) -> anyhow::Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(params).context("params must be valid JSON")?;
    let ctx = Context::load()?;
    let profile = ctx.load_profile(profile)?;
    let transport = ctx.transport();

    let response = transport
        .call_at(&profile, operation_id, params, source_path)
        .await?;
    println!("{}", serde_json::to_string_pretty(response.payload())?);
    Ok(())
}
