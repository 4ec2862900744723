use crate::cli::Args;
use crate::config::{load_proxy_config, ProxyConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use system_utils::path::expand_tilde;
use task_runtime::{LaunchOptions, SupervisorSettings};

const DEFAULT_TIME_BUDGET_SECS: u64 = 300;
const DEFAULT_MAX_STEPS: u32 = 100;
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
const DEFAULT_PROFILE_ROOT: &str = "~/.browser-task/profiles";
const DEFAULT_BROWSER_BINARY: &str = "/usr/bin/chromium";
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_WINDOW: (u32, u32) = (1920, 1080);
const DEFAULT_BROWSER_ARGS: [&str; 6] = [
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-accelerated-2d-canvas",
    "--disable-gpu",
    "--disable-blink-features=AutomationControlled",
];
pub(crate) const DEFAULT_SYSTEM_MESSAGE: &str = "If stuck on the same screen, summarize and conclude the task. Do not attempt to log in to sites that require a login; conclude the task instead.";

#[derive(Debug, Clone)]
pub(crate) struct BrowserSettings {
    pub(crate) binary: PathBuf,
    pub(crate) startup_timeout: Duration,
    pub(crate) stop_grace: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct AgentSettings {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) system_message: Option<String>,
    pub(crate) stop_grace: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct ProxySettings {
    pub(crate) supervisor: SupervisorSettings,
    pub(crate) browser: BrowserSettings,
    pub(crate) agent: AgentSettings,
}

pub(crate) fn build_settings(args: &Args) -> anyhow::Result<ProxySettings> {
    let config = match args.config.as_ref() {
        Some(path) => load_proxy_config(path)?,
        None => ProxyConfig::default(),
    };
    build_settings_from_config(args, config)
}

/// Command line and environment win over the file, the file over defaults.
fn build_settings_from_config(args: &Args, config: ProxyConfig) -> anyhow::Result<ProxySettings> {
    let task = config.task.unwrap_or_default();
    let browser = config.browser.unwrap_or_default();

    let time_budget = args.time_budget.unwrap_or_else(|| {
        Duration::from_secs(task.time_budget_secs.unwrap_or(DEFAULT_TIME_BUDGET_SECS))
    });
    if time_budget.is_zero() {
        anyhow::bail!("time budget must be greater than zero");
    }
    let max_steps = args.max_steps.or(task.max_steps).unwrap_or(DEFAULT_MAX_STEPS);
    if max_steps == 0 {
        anyhow::bail!("max steps must be greater than zero");
    }
    let stop_grace = Duration::from_millis(task.stop_grace_ms.unwrap_or(DEFAULT_STOP_GRACE_MS));

    let profile_root = args
        .profile_root
        .clone()
        .or(task.profile_root)
        .unwrap_or_else(|| DEFAULT_PROFILE_ROOT.to_string());
    let record_dir = args
        .record_dir
        .clone()
        .or(task.record_dir)
        .map(|dir| expand_tilde(&dir));

    let (program, agent_args, env, system_message) = {
        let (file_command, env, system_message) = match config.agent {
            Some(agent) => (Some(agent.command), agent.env, agent.system_message),
            None => (None, BTreeMap::new(), None),
        };
        let command = args
            .agent_command
            .clone()
            .or(file_command)
            .ok_or_else(|| {
                anyhow::anyhow!("agent command is required (--agent-command or [agent].command)")
            })?;
        let mut argv = shell_words::split(&command)
            .map_err(|err| anyhow::anyhow!("invalid agent command: {err}"))?;
        if argv.is_empty() {
            anyhow::bail!("agent command cannot be empty");
        }
        let program = argv.remove(0);
        let system_message = system_message.unwrap_or_else(|| DEFAULT_SYSTEM_MESSAGE.to_string());
        let system_message = if system_message.trim().is_empty() {
            None
        } else {
            Some(system_message)
        };
        (program, argv, env, system_message)
    };

    let launch = LaunchOptions {
        headless: browser.headless.unwrap_or(true),
        window_width: browser.window_width.unwrap_or(DEFAULT_WINDOW.0),
        window_height: browser.window_height.unwrap_or(DEFAULT_WINDOW.1),
        extra_args: browser
            .extra_args
            .unwrap_or_else(|| DEFAULT_BROWSER_ARGS.iter().map(|arg| arg.to_string()).collect()),
    };
    let binary = args
        .browser_binary
        .clone()
        .or(browser.binary)
        .unwrap_or_else(|| DEFAULT_BROWSER_BINARY.to_string());

    Ok(ProxySettings {
        supervisor: SupervisorSettings {
            time_budget,
            max_steps,
            stop_grace,
            profile_root: expand_tilde(&profile_root),
            keep_profiles: task.keep_profiles.unwrap_or(false),
            record_dir,
            launch,
        },
        browser: BrowserSettings {
            binary: expand_tilde(&binary),
            startup_timeout: Duration::from_millis(
                browser
                    .startup_timeout_ms
                    .unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS),
            ),
            stop_grace,
        },
        agent: AgentSettings {
            program,
            args: agent_args,
            env,
            system_message,
            stop_grace,
        },
    })
}
