use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use protocol::{AgentFrame, AgentLaunch};
use system_utils::process::{
    forward_stderr, signal_process_group, spawn_process_group, terminate_process_group, GroupChild,
};
use task_runtime::{AgentEngine, AgentEngineFactory, EngineRequest, EngineSinks, Environment};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::state::AgentSettings;

/// Screenshots travel inline, so frames can be large.
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub(crate) struct ProcessAgentFactory {
    settings: Arc<AgentSettings>,
}

impl ProcessAgentFactory {
    pub(crate) fn new(settings: AgentSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl AgentEngineFactory for ProcessAgentFactory {
    async fn create(&self, request: &EngineRequest) -> anyhow::Result<Box<dyn AgentEngine>> {
        Ok(Box::new(ProcessAgent {
            settings: Arc::clone(&self.settings),
            request: request.clone(),
            process: Mutex::new(None),
            pgid: StdMutex::new(None),
        }))
    }
}

/// One agent subprocess: a JSON `AgentLaunch` line in on stdin, JSON-lines
/// `AgentFrame`s out on stdout.
pub(crate) struct ProcessAgent {
    settings: Arc<AgentSettings>,
    request: EngineRequest,
    process: Mutex<Option<GroupChild>>,
    pgid: StdMutex<Option<libc::pid_t>>,
}

impl ProcessAgent {
    fn launch_line(&self, task: &str, endpoint: Option<String>) -> anyhow::Result<String> {
        let launch = AgentLaunch {
            request_id: self.request.request_id.clone(),
            task: task.to_string(),
            max_steps: self.request.max_steps,
            environment_endpoint: endpoint,
            profile_path: self.request.profile_path.display().to_string(),
            system_message: self.settings.system_message.clone(),
        };
        let mut line = serde_json::to_string(&launch)?;
        line.push('\n');
        Ok(line)
    }

    fn set_pgid(&self, pgid: Option<libc::pid_t>) {
        *self.pgid.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = pgid;
    }

    fn pgid(&self) -> Option<libc::pid_t> {
        *self.pgid.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AgentEngine for ProcessAgent {
    async fn run(
        &self,
        task: &str,
        environment: &dyn Environment,
        sinks: EngineSinks,
    ) -> anyhow::Result<()> {
        let line = self.launch_line(task, environment.endpoint())?;
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.args)
            .envs(&self.settings.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut process = spawn_process_group(&mut cmd, "agent")?;
        self.set_pgid(process.pgid);
        let stdin = process.child.stdin.take();
        let stdout = process.child.stdout.take();
        if let Some(stderr) = process.child.stderr.take() {
            forward_stderr(stderr, "agent", self.request.request_id.clone());
        }
        *self.process.lock().await = Some(process);

        let mut stdin = stdin.context("agent stdin unavailable")?;
        let stdout = stdout.context("agent stdout unavailable")?;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("failed to send launch request to agent")?;
        stdin.flush().await.context("failed to flush agent stdin")?;
        drop(stdin);

        let EngineSinks { steps, done } = sinks;
        let mut done = Some(done);
        let mut frames = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
        while let Some(line) = frames.next().await {
            let line = line.context("failed to read agent output")?;
            if line.trim().is_empty() {
                continue;
            }
            let frame: AgentFrame = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(
                        request_id = %self.request.request_id,
                        error = %err,
                        "ignoring malformed agent frame"
                    );
                    continue;
                }
            };
            match frame {
                AgentFrame::Step(step) => {
                    if steps.send(step).await.is_err() {
                        tracing::debug!(
                            request_id = %self.request.request_id,
                            "step receiver closed; stopping agent output relay"
                        );
                        return Ok(());
                    }
                }
                AgentFrame::Done(record) => match done.take() {
                    Some(done) => {
                        let _ = done.send(record);
                    }
                    None => tracing::warn!(
                        request_id = %self.request.request_id,
                        "agent sent more than one completion record"
                    ),
                },
            }
        }

        if done.is_some() {
            anyhow::bail!("agent closed its output without a completion record");
        }
        Ok(())
    }

    fn request_stop(&self) {
        let Some(pgid) = self.pgid() else {
            return;
        };
        if let Err(err) = signal_process_group(pgid, libc::SIGTERM) {
            // ESRCH: the agent already exited.
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(
                    request_id = %self.request.request_id,
                    error = %err,
                    "failed to signal agent"
                );
            }
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };
        let status = terminate_process_group(&mut process, self.settings.stop_grace, "agent").await?;
        self.set_pgid(None);
        tracing::debug!(
            request_id = %self.request.request_id,
            status = %status,
            "agent process reaped"
        );
        Ok(())
    }
}
