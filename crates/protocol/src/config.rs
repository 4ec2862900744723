use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub task: Option<TaskDefaults>,
    pub browser: Option<BrowserConfig>,
    pub agent: Option<AgentConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDefaults {
    pub time_budget_secs: Option<u64>,
    pub max_steps: Option<u32>,
    pub stop_grace_ms: Option<u64>,
    pub profile_root: Option<String>,
    pub keep_profiles: Option<bool>,
    pub record_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrowserConfig {
    pub binary: Option<String>,
    pub headless: Option<bool>,
    pub window_width: Option<u32>,
    pub window_height: Option<u32>,
    pub extra_args: Option<Vec<String>>,
    pub startup_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub system_message: Option<String>,
}
