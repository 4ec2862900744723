//! Seams to the external collaborators: the browser environment and the
//! agent engine that drives it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use protocol::{CompletionRecord, StepEvent};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub extra_args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            window_width: 1920,
            window_height: 1080,
            extra_args: Vec::new(),
        }
    }
}

/// A running environment (browser) owned by one request.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Address the agent uses to reach the environment, if it exposes one.
    fn endpoint(&self) -> Option<String>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EnvironmentLauncher: Send + Sync {
    async fn open(
        &self,
        profile_path: &Path,
        options: &LaunchOptions,
    ) -> anyhow::Result<Box<dyn Environment>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    pub request_id: String,
    pub profile_path: PathBuf,
    pub max_steps: u32,
}

/// Where an engine reports progress. The step channel is bounded so a slow
/// session applies backpressure to the engine instead of buffering.
pub struct EngineSinks {
    pub steps: mpsc::Sender<StepEvent>,
    pub done: oneshot::Sender<CompletionRecord>,
}

impl EngineSinks {
    pub fn channel(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<StepEvent>,
        oneshot::Receiver<CompletionRecord>,
    ) {
        let (steps, steps_rx) = mpsc::channel(capacity);
        let (done, done_rx) = oneshot::channel();
        (Self { steps, done }, steps_rx, done_rx)
    }
}

/// Handle to one agent run. Created per request and held only by that
/// request's supervisor.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Runs the task to completion. Steps go to `sinks.steps` in increasing
    /// `step_number` order; a normal finish sends exactly one record to
    /// `sinks.done` before returning `Ok`.
    async fn run(
        &self,
        task: &str,
        environment: &dyn Environment,
        sinks: EngineSinks,
    ) -> anyhow::Result<()>;

    /// Cooperative stop; the engine finishes at its next opportunity.
    /// A no-op once the run is over.
    fn request_stop(&self);

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AgentEngineFactory: Send + Sync {
    async fn create(&self, request: &EngineRequest) -> anyhow::Result<Box<dyn AgentEngine>>;
}
