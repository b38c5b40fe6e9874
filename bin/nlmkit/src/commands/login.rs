use super::Context;
use tracing::info;

pub async fn run(profile: Option<String>, force: bool, timeout: Option<u64>) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let name = ctx.profile_name(profile)?;
    let timeout = ctx.login_timeout(timeout);

    println!("Opening browser for profile '{}'.", name);
    println!("Sign in within {}s; the window closes once the session is captured.", timeout.as_secs());

    let saved = ctx.manager.login(&name, timeout, force).await?;

    if ctx.manager.default_profile()?.is_none() {
        ctx.manager.switch_default(&name)?;
        info!(profile = %name, "Set as default profile");
    }

    println!();
    println!("✓ Saved profile '{}'", saved.name);
    println!("  Account: {}", saved.account_email.as_deref().unwrap_or("(unknown)"));
    println!("  Cookies: {}", saved.cookies.len());
    Ok(())
}
