use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "browser-task-proxy",
    version,
    about = "MCP stdio server that runs browser tasks in the background"
)]
pub(crate) struct Args {
    #[arg(long, env = "BROWSER_TASK_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    /// Wall-clock budget per task, e.g. `300s` or `5m`.
    #[arg(long, env = "BROWSER_TASK_TIME_BUDGET", value_parser = humantime::parse_duration)]
    pub(crate) time_budget: Option<Duration>,
    #[arg(long, env = "BROWSER_TASK_MAX_STEPS")]
    pub(crate) max_steps: Option<u32>,
    #[arg(long, env = "BROWSER_TASK_PROFILE_ROOT")]
    pub(crate) profile_root: Option<String>,
    #[arg(long, env = "BROWSER_TASK_RECORD_DIR")]
    pub(crate) record_dir: Option<String>,
    #[arg(long, env = "BROWSER_TASK_BROWSER")]
    pub(crate) browser_binary: Option<String>,
    /// Agent program and arguments, shell-word split.
    #[arg(long, env = "BROWSER_TASK_AGENT_COMMAND")]
    pub(crate) agent_command: Option<String>,
    #[arg(long, env = "BROWSER_TASK_LOG_DIR", default_value = "logs")]
    pub(crate) log_dir: PathBuf,
    /// File name prefix for the daily-rolled JSON log.
    #[arg(long, env = "BROWSER_TASK_LOG_FILE", default_value = "browser-task.log")]
    pub(crate) log_file: String,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    /// How long to wait for running tasks to clean up on exit.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub(crate) shutdown_grace: Duration,
}
