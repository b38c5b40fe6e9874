use super::Context;

pub async fn list() -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let names = ctx.manager.list_profiles()?;
    if names.is_empty() {
        println!("(No profiles yet. Run `nlmkit login` to create one.)");
        return Ok(());
    }

    let default = ctx.manager.default_profile()?;
    for name in names {
        let marker = if default.as_deref() == Some(name.as_str()) { "*" } else { " " };
        let email = ctx
            .manager
            .load_profile(&name)
            .ok()
            .and_then(|p| p.account_email)
            .unwrap_or_else(|| "(unknown account)".to_string());
        println!("{} {:<20} {}", marker, name, email);
    }
    Ok(())
}

pub async fn switch(name: &str) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    ctx.manager.switch_default(name)?;
    println!("✓ Default profile is now '{}'", name);
    Ok(())
}

pub async fn show(name: Option<String>) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let profile = ctx.load_profile(name)?;
    let cookie_names: Vec<&str> = profile.cookies.names().collect();

    println!("Profile:        {}", profile.name);
    println!("Account:        {}", profile.account_email.as_deref().unwrap_or("(unknown)"));
    println!("Last validated: {}", profile.last_validated_at.to_rfc3339());
    println!("Build label:    {}", profile.build_label.as_deref().unwrap_or("(none)"));
    println!("Session id:     {}", if profile.session_id.is_some() { "✓" } else { "✗" });
    println!("CSRF token:     {}", if profile.csrf_token.is_some() { "✓" } else { "✗" });
    println!("Cookies ({}):   {}", cookie_names.len(), cookie_names.join(", "));
    Ok(())
}
