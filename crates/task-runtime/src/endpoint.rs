use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;
use uuid::Uuid;

use crate::context::{ActiveRequestInfo, ActiveRequests};
use crate::engine::{AgentEngineFactory, EnvironmentLauncher};
use crate::notifier::NotificationSink;
use crate::supervisor::{SupervisorSettings, TaskSupervisor};

/// Immediate reply to a task invocation; the outcome arrives as notifications.
pub const ACKNOWLEDGEMENT: &str = "Processing Request";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub request_id: String,
    pub message: &'static str,
}

/// Accepts task invocations and runs each under its own supervisor.
#[derive(Clone)]
pub struct TaskEndpoint {
    settings: Arc<SupervisorSettings>,
    launcher: Arc<dyn EnvironmentLauncher>,
    factory: Arc<dyn AgentEngineFactory>,
    active: ActiveRequests,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TaskEndpoint {
    pub fn new(
        settings: Arc<SupervisorSettings>,
        launcher: Arc<dyn EnvironmentLauncher>,
        factory: Arc<dyn AgentEngineFactory>,
    ) -> Self {
        Self {
            settings,
            launcher,
            factory,
            active: ActiveRequests::default(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Ties every supervisor to `token`: cancelling it cancels all runs.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Starts a background run and returns without waiting for it.
    ///
    /// Without a `request_id` a fresh UUID is assigned. An id that is still
    /// in flight is rejected so its notifications stay unambiguous.
    pub fn perform_task(
        &self,
        task: &str,
        request_id: Option<String>,
        sink: Arc<dyn NotificationSink>,
    ) -> anyhow::Result<Acknowledgement> {
        if self.shutdown.is_cancelled() {
            anyhow::bail!("server is shutting down");
        }
        if task.trim().is_empty() {
            anyhow::bail!("task must not be empty");
        }
        let request_id = match request_id {
            Some(id) if id.trim().is_empty() => anyhow::bail!("request_id must not be empty"),
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let lease = self.active.reserve(&request_id, task)?;
        let supervisor = TaskSupervisor::new(
            request_id.clone(),
            task,
            Arc::clone(&self.settings),
            Arc::clone(&self.launcher),
            Arc::clone(&self.factory),
            sink,
            self.shutdown.child_token(),
        )
        .with_lease(lease);
        self.tracker.spawn(async move {
            supervisor.run().await;
        });

        info!(
            event = "task.accepted",
            request_id = %request_id,
            in_flight = self.active.len(),
            "task scheduled"
        );
        Ok(Acknowledgement {
            request_id,
            message: ACKNOWLEDGEMENT,
        })
    }

    pub fn active_requests(&self) -> Vec<ActiveRequestInfo> {
        self.active.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Cancels every run and waits up to `grace` for their cleanup.
    /// Returns `false` if some supervisors were still running at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        let finished = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !finished {
            tracing::warn!(
                in_flight = self.active.len(),
                "tasks still running after shutdown grace"
            );
        }
        finished
    }
}
