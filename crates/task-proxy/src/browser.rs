//! Chromium launched per request, isolated by its own profile directory and
//! process group.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use system_utils::process::{
    forward_stderr, null_stdio, spawn_process_group, terminate_process_group, GroupChild,
};
use task_runtime::{Environment, EnvironmentLauncher, LaunchOptions};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

use crate::state::BrowserSettings;

const DEVTOOLS_PORT_FILE: &str = "DevToolsActivePort";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct ChromiumLauncher {
    settings: BrowserSettings,
}

impl ChromiumLauncher {
    pub(crate) fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

fn browser_args(profile_path: &Path, options: &LaunchOptions) -> Vec<String> {
    let mut args = vec![
        format!("--user-data-dir={}", profile_path.display()),
        "--remote-debugging-port=0".to_string(),
        format!("--window-size={},{}", options.window_width, options.window_height),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
    ];
    if options.headless {
        args.push("--headless=new".to_string());
    }
    args.extend(options.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

/// `DevToolsActivePort` holds the port on the first line and the browser
/// target path on the second.
fn parse_devtools_active_port(contents: &str) -> Option<String> {
    let mut lines = contents.lines();
    let port: u16 = lines.next()?.trim().parse().ok()?;
    if port == 0 {
        return None;
    }
    let path = lines.next().map(str::trim).unwrap_or("");
    if path.is_empty() {
        Some(format!("http://127.0.0.1:{port}"))
    } else {
        Some(format!("ws://127.0.0.1:{port}{path}"))
    }
}

async fn wait_for_devtools(
    profile_path: &Path,
    process: &mut GroupChild,
    startup_timeout: Duration,
) -> anyhow::Result<String> {
    let port_file = profile_path.join(DEVTOOLS_PORT_FILE);
    let deadline = Instant::now() + startup_timeout;
    loop {
        if let Ok(contents) = tokio::fs::read_to_string(&port_file).await {
            if let Some(endpoint) = parse_devtools_active_port(&contents) {
                return Ok(endpoint);
            }
        }
        if let Some(status) = process
            .child
            .try_wait()
            .context("failed to poll chromium")?
        {
            anyhow::bail!("chromium exited during startup ({status})");
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "chromium did not report a debugging port within {}",
                humantime::format_duration(startup_timeout)
            );
        }
        sleep(POLL_INTERVAL).await;
    }
}

#[async_trait]
impl EnvironmentLauncher for ChromiumLauncher {
    async fn open(
        &self,
        profile_path: &Path,
        options: &LaunchOptions,
    ) -> anyhow::Result<Box<dyn Environment>> {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(browser_args(profile_path, options));
        null_stdio(&mut cmd).stderr(Stdio::piped());
        let mut process = spawn_process_group(&mut cmd, "chromium")
            .with_context(|| format!("browser binary {}", self.settings.binary.display()))?;
        let label = profile_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(stderr) = process.child.stderr.take() {
            forward_stderr(stderr, "chromium", label.clone());
        }

        match wait_for_devtools(profile_path, &mut process, self.settings.startup_timeout).await {
            Ok(endpoint) => {
                tracing::info!(
                    profile = %label,
                    pid = ?process.pgid,
                    endpoint = %endpoint,
                    "chromium started"
                );
                Ok(Box::new(ChromiumEnvironment {
                    process: Mutex::new(Some(process)),
                    endpoint,
                    profile_path: profile_path.to_path_buf(),
                    stop_grace: self.settings.stop_grace,
                }))
            }
            Err(err) => {
                if let Err(stop_err) =
                    terminate_process_group(&mut process, self.settings.stop_grace, "chromium").await
                {
                    tracing::warn!(error = %stop_err, "failed to stop chromium after startup failure");
                }
                Err(err)
            }
        }
    }
}

pub(crate) struct ChromiumEnvironment {
    process: Mutex<Option<GroupChild>>,
    endpoint: String,
    profile_path: PathBuf,
    stop_grace: Duration,
}

#[async_trait]
impl Environment for ChromiumEnvironment {
    fn endpoint(&self) -> Option<String> {
        Some(self.endpoint.clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };
        let status = terminate_process_group(&mut process, self.stop_grace, "chromium").await?;
        tracing::debug!(
            profile = %self.profile_path.display(),
            status = %status,
            "chromium stopped"
        );
        Ok(())
    }
}
