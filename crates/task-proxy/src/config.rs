use anyhow::Context;
pub(crate) use protocol::config::ProxyConfig;
use std::path::Path;

fn validate_proxy_config(config: &ProxyConfig) -> anyhow::Result<()> {
    if let Some(task) = config.task.as_ref() {
        if task.time_budget_secs == Some(0) {
            anyhow::bail!("task.time_budget_secs must be greater than zero");
        }
        if task.max_steps == Some(0) {
            anyhow::bail!("task.max_steps must be greater than zero");
        }
        if let Some(root) = task.profile_root.as_deref() {
            if root.trim().is_empty() {
                anyhow::bail!("task.profile_root cannot be empty");
            }
        }
    }
    if let Some(browser) = config.browser.as_ref() {
        if matches!(browser.window_width, Some(0)) || matches!(browser.window_height, Some(0)) {
            anyhow::bail!("browser window size must be non-zero");
        }
    }
    if let Some(agent) = config.agent.as_ref() {
        if agent.command.trim().is_empty() {
            anyhow::bail!("agent.command cannot be empty");
        }
    }
    Ok(())
}

pub(crate) fn load_proxy_config(path: &Path) -> anyhow::Result<ProxyConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: ProxyConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    validate_proxy_config(&config)?;
    Ok(config)
}
