use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use protocol::{CompletionRecord, StepEvent, TaskStatus};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::context::{RequestContext, RequestLease};
use crate::engine::{
    AgentEngine, AgentEngineFactory, EngineRequest, EngineSinks, Environment,
    EnvironmentLauncher, LaunchOptions,
};
use crate::notifier::{NotificationSink, ProgressNotifier};
use crate::output::write_task_record;
use crate::usage::total_usage;
use crate::watchdog::TimeBudgetWatchdog;

const STEP_CHANNEL_CAPACITY: usize = 16;
const TERMINAL_SEND_TIMEOUT: Duration = Duration::from_secs(10);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(30);
const CANCELLED_MESSAGE: &str = "task cancelled before completion";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub time_budget: Duration,
    pub max_steps: u32,
    /// How long a stopped engine may keep running before cleanup starts.
    pub stop_grace: Duration,
    pub profile_root: PathBuf,
    pub keep_profiles: bool,
    pub record_dir: Option<PathBuf>,
    pub launch: LaunchOptions,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(300),
            max_steps: 100,
            stop_grace: Duration::from_secs(5),
            profile_root: std::env::temp_dir().join("browser-task-profiles"),
            keep_profiles: false,
            record_dir: None,
            launch: LaunchOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { total_usage: u64 },
    TimedOut { total_usage: u64, summary: String },
    Cancelled { total_usage: u64 },
    Failed { total_usage: u64, error: String },
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed { .. } => TaskStatus::Completed,
            TaskOutcome::TimedOut { .. } => TaskStatus::TimedOut,
            TaskOutcome::Cancelled { .. } => TaskStatus::Cancelled,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
        }
    }

    pub fn total_usage(&self) -> u64 {
        match self {
            TaskOutcome::Completed { total_usage }
            | TaskOutcome::TimedOut { total_usage, .. }
            | TaskOutcome::Cancelled { total_usage }
            | TaskOutcome::Failed { total_usage, .. } => *total_usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum ReleaseStatus {
    NotAcquired,
    Released,
    Failed(String),
}

/// Result of each release step, in the order they run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub context: ReleaseStatus,
    pub environment: ReleaseStatus,
    pub engine: ReleaseStatus,
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub request_id: String,
    pub outcome: TaskOutcome,
    pub steps: usize,
    pub duration: Duration,
    pub cleanup: CleanupReport,
}

#[derive(Default)]
struct Resources {
    context: Option<RequestContext>,
    environment: Option<Box<dyn Environment>>,
    engine: Option<Box<dyn AgentEngine>>,
}

impl Resources {
    /// Fixed order: session context, environment, engine. Every step runs
    /// whether or not the previous one succeeded. The profile directory is
    /// removed last, once the browser and the agent no longer hold it.
    async fn release(&mut self, request_id: &str) -> CleanupReport {
        let removal = self.context.take().map(RequestContext::close);
        let environment = match self.environment.take() {
            Some(environment) => {
                release_step(request_id, "environment", environment.close()).await
            }
            None => ReleaseStatus::NotAcquired,
        };
        let engine = match self.engine.take() {
            Some(engine) => release_step(request_id, "agent engine", engine.close()).await,
            None => ReleaseStatus::NotAcquired,
        };
        let context = match removal {
            Some(removal) => release_step(request_id, "request context", removal.remove()).await,
            None => ReleaseStatus::NotAcquired,
        };
        CleanupReport {
            context,
            environment,
            engine,
        }
    }
}

async fn release_step<F>(request_id: &str, resource: &str, release: F) -> ReleaseStatus
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    match timeout(RELEASE_TIMEOUT, release).await {
        Ok(Ok(())) => {
            debug!(request_id = %request_id, resource, "released");
            ReleaseStatus::Released
        }
        Ok(Err(err)) => {
            warn!(request_id = %request_id, resource, error = %format!("{err:#}"), "release failed");
            ReleaseStatus::Failed(format!("{err:#}"))
        }
        Err(_) => {
            warn!(
                request_id = %request_id,
                resource,
                timeout_ms = RELEASE_TIMEOUT.as_millis(),
                "release timed out"
            );
            ReleaseStatus::Failed(format!("timed out after {}s", RELEASE_TIMEOUT.as_secs()))
        }
    }
}

/// Runs one request from resource acquisition to cleanup.
pub struct TaskSupervisor {
    request_id: String,
    task: String,
    settings: Arc<SupervisorSettings>,
    launcher: Arc<dyn EnvironmentLauncher>,
    factory: Arc<dyn AgentEngineFactory>,
    notifier: ProgressNotifier,
    cancel: CancellationToken,
    lease: Option<RequestLease>,
    state: TaskStatus,
    history: Vec<StepEvent>,
}

impl TaskSupervisor {
    pub fn new(
        request_id: impl Into<String>,
        task: impl Into<String>,
        settings: Arc<SupervisorSettings>,
        launcher: Arc<dyn EnvironmentLauncher>,
        factory: Arc<dyn AgentEngineFactory>,
        sink: Arc<dyn NotificationSink>,
        cancel: CancellationToken,
    ) -> Self {
        let request_id = request_id.into();
        Self {
            notifier: ProgressNotifier::new(request_id.clone(), sink),
            request_id,
            task: task.into(),
            settings,
            launcher,
            factory,
            cancel,
            lease: None,
            state: TaskStatus::Created,
            history: Vec::new(),
        }
    }

    /// Keeps `lease` (and with it the in-flight request id) until cleanup is done.
    pub fn with_lease(mut self, lease: RequestLease) -> Self {
        lease.set_status(self.state);
        self.lease = Some(lease);
        self
    }

    /// Every event logged while the task runs sits inside a `task` span
    /// carrying its request id.
    pub async fn run(self) -> TaskReport {
        let span = info_span!("task", request_id = %self.request_id);
        self.run_to_completion().instrument(span).await
    }

    async fn run_to_completion(mut self) -> TaskReport {
        let started_at = Instant::now();
        let mut resources = Resources::default();
        info!(event = "task.start", request_id = %self.request_id, "task accepted");

        let outcome = self.supervise(&mut resources).await;

        self.transition(TaskStatus::CleaningUp);
        let cleanup = resources.release(&self.request_id).await;
        self.transition(TaskStatus::CleanedUp);

        let report = TaskReport {
            request_id: self.request_id.clone(),
            outcome,
            steps: self.history.len(),
            duration: started_at.elapsed(),
            cleanup,
        };
        info!(
            event = "task.finish",
            request_id = %report.request_id,
            status = ?report.outcome.status(),
            total_usage = report.outcome.total_usage(),
            steps = report.steps,
            elapsed_ms = report.duration.as_millis(),
            "task finished"
        );
        if let Some(dir) = self.settings.record_dir.as_ref() {
            write_task_record(dir, &report).await;
        }
        report
    }

    async fn supervise(&mut self, resources: &mut Resources) -> TaskOutcome {
        let cancel = self.cancel.clone();
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.acquire(resources) => Some(result),
        };
        let outcome = match acquired {
            None => TaskOutcome::Cancelled { total_usage: 0 },
            Some(Err(err)) => {
                error!(
                    request_id = %self.request_id,
                    error = %format!("{err:#}"),
                    "failed to prepare task resources"
                );
                TaskOutcome::Failed {
                    total_usage: 0,
                    error: format!("{err:#}"),
                }
            }
            Some(Ok(())) => {
                let (Some(engine), Some(environment)) =
                    (resources.engine.as_deref(), resources.environment.as_deref())
                else {
                    return self
                        .conclude(TaskOutcome::Failed {
                            total_usage: 0,
                            error: "task resources missing after acquisition".to_string(),
                        })
                        .await;
                };
                return self.drive(engine, environment).await;
            }
        };
        self.conclude(outcome).await
    }

    async fn acquire(&self, resources: &mut Resources) -> anyhow::Result<()> {
        let context = RequestContext::acquire(
            &self.settings.profile_root,
            &self.request_id,
            self.settings.keep_profiles,
        )
        .await
        .context("failed to acquire request context")?;
        let profile_path = context.profile_path().to_path_buf();
        resources.context = Some(context);

        let environment = self
            .launcher
            .open(&profile_path, &self.settings.launch)
            .await
            .context("failed to open environment")?;
        resources.environment = Some(environment);

        let request = EngineRequest {
            request_id: self.request_id.clone(),
            profile_path,
            max_steps: self.settings.max_steps,
        };
        let engine = self
            .factory
            .create(&request)
            .await
            .context("failed to create agent engine")?;
        resources.engine = Some(engine);
        Ok(())
    }

    async fn drive(&mut self, engine: &dyn AgentEngine, environment: &dyn Environment) -> TaskOutcome {
        let task = self.task.clone();
        let cancel = self.cancel.clone();
        let (sinks, mut steps_rx, mut done_rx) = EngineSinks::channel(STEP_CHANNEL_CAPACITY);
        let watchdog = TimeBudgetWatchdog::start(self.settings.time_budget);
        self.transition(TaskStatus::Running);

        let mut run = engine.run(&task, environment, sinks);
        let mut run_finished = false;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break TaskOutcome::Cancelled {
                        total_usage: total_usage(&self.history),
                    };
                }
                Some(step) = steps_rx.recv() => {
                    if let Some(outcome) = self.on_step(step, &watchdog).await {
                        break outcome;
                    }
                }
                result = &mut run => {
                    run_finished = true;
                    let mut truncated = None;
                    while let Ok(step) = steps_rx.try_recv() {
                        if let Some(outcome) = self.on_step(step, &watchdog).await {
                            truncated = Some(outcome);
                            break;
                        }
                    }
                    break match truncated {
                        Some(outcome) => outcome,
                        None => self.on_run_finished(result, &mut done_rx, &watchdog),
                    };
                }
            }
        };

        if !run_finished {
            engine.request_stop();
        }
        let outcome = self.conclude(outcome).await;

        if !run_finished {
            let grace = self.settings.stop_grace;
            let wound_down = timeout(grace, async {
                let mut discarded = 0usize;
                loop {
                    tokio::select! {
                        Some(step) = steps_rx.recv() => {
                            discarded += 1;
                            debug!(
                                request_id = %self.request_id,
                                step_no = step.step_number,
                                "discarding step after terminal message"
                            );
                        }
                        result = &mut run => break (result, discarded),
                    }
                }
            })
            .await;
            match wound_down {
                Ok((result, discarded)) => {
                    if let Err(err) = result {
                        debug!(
                            request_id = %self.request_id,
                            error = %format!("{err:#}"),
                            "agent engine errored while stopping"
                        );
                    }
                    if done_rx.try_recv().is_ok() {
                        info!(
                            request_id = %self.request_id,
                            "suppressed completion record that arrived after the terminal message"
                        );
                    }
                    debug!(request_id = %self.request_id, discarded, "agent engine stopped");
                }
                Err(_) => warn!(
                    request_id = %self.request_id,
                    grace_ms = grace.as_millis(),
                    "agent engine did not stop within grace period"
                ),
            }
        }
        outcome
    }

    /// Step boundary: budget first, so a late step is truncated rather than counted.
    async fn on_step(&mut self, step: StepEvent, watchdog: &TimeBudgetWatchdog) -> Option<TaskOutcome> {
        let now = Instant::now();
        if watchdog.check(now) {
            info!(
                event = "task.timeout",
                request_id = %self.request_id,
                step_no = step.step_number,
                elapsed_ms = watchdog.elapsed_at(now).as_millis(),
                "time budget exceeded at step boundary"
            );
            return Some(TaskOutcome::TimedOut {
                total_usage: total_usage(&self.history),
                summary: watchdog.timeout_summary(now, self.history.len()),
            });
        }
        if let Some(last) = self.history.last() {
            if step.step_number <= last.step_number {
                warn!(
                    request_id = %self.request_id,
                    step_no = step.step_number,
                    last_step_no = last.step_number,
                    "ignoring out-of-order step"
                );
                return None;
            }
        }

        self.history.push(step);
        let usage = total_usage(&self.history);
        let Some(step) = self.history.last() else {
            return None;
        };
        debug!(
            event = "task.step",
            request_id = %self.request_id,
            step_no = step.step_number,
            total_usage = usage,
            "step observed"
        );
        if let Err(err) = self.notifier.notify_step(step, usage).await {
            warn!(
                request_id = %self.request_id,
                step_no = step.step_number,
                error = %format!("{err:#}"),
                "failed to deliver step notification"
            );
        }
        None
    }

    fn on_run_finished(
        &self,
        result: anyhow::Result<()>,
        done_rx: &mut oneshot::Receiver<CompletionRecord>,
        watchdog: &TimeBudgetWatchdog,
    ) -> TaskOutcome {
        let observed = total_usage(&self.history);
        if let Err(err) = result {
            error!(
                request_id = %self.request_id,
                error = %format!("{err:#}"),
                "agent engine failed"
            );
            return TaskOutcome::Failed {
                total_usage: observed,
                error: format!("{err:#}"),
            };
        }
        let Ok(record) = done_rx.try_recv() else {
            return TaskOutcome::Failed {
                total_usage: observed,
                error: "agent engine finished without a completion record".to_string(),
            };
        };

        let now = Instant::now();
        if watchdog.check(now) {
            info!(
                event = "task.timeout",
                request_id = %self.request_id,
                elapsed_ms = watchdog.elapsed_at(now).as_millis(),
                "time budget exceeded at completion"
            );
            return TaskOutcome::TimedOut {
                total_usage: observed,
                summary: watchdog.timeout_summary(now, self.history.len()),
            };
        }
        self.reconcile(&record, observed);
        TaskOutcome::Completed {
            total_usage: observed,
        }
    }

    /// The observed history is authoritative; disagreement is only logged.
    fn reconcile(&self, record: &CompletionRecord, observed: u64) {
        if let Some(reported) = record.total_usage {
            if reported != observed {
                warn!(
                    request_id = %self.request_id,
                    reported,
                    observed,
                    "engine-reported usage differs from observed steps"
                );
            }
        }
        if record.history.len() != self.history.len() {
            warn!(
                request_id = %self.request_id,
                reported_steps = record.history.len(),
                observed_steps = self.history.len(),
                "engine history length differs from observed steps"
            );
        }
    }

    /// Enters the outcome state and makes the single terminal attempt.
    async fn conclude(&mut self, outcome: TaskOutcome) -> TaskOutcome {
        self.transition(outcome.status());
        let (usage, summary, error) = match &outcome {
            TaskOutcome::Completed { total_usage } => (*total_usage, None, None),
            TaskOutcome::TimedOut {
                total_usage,
                summary,
            } => (*total_usage, Some(summary.clone()), None),
            TaskOutcome::Cancelled { total_usage } => {
                (*total_usage, None, Some(CANCELLED_MESSAGE.to_string()))
            }
            TaskOutcome::Failed { total_usage, error } => {
                (*total_usage, None, Some(error.clone()))
            }
        };
        let notifier = &mut self.notifier;
        let delivery = async move {
            match error {
                Some(error) => notifier.notify_failed(usage, &error).await,
                None => notifier.notify_done(usage, summary).await,
            }
        };
        match timeout(TERMINAL_SEND_TIMEOUT, delivery).await {
            Ok(Ok(())) => debug!(request_id = %self.request_id, total_usage = usage, "terminal message sent"),
            Ok(Err(err)) => warn!(
                request_id = %self.request_id,
                error = %format!("{err:#}"),
                "failed to deliver terminal message"
            ),
            Err(_) => warn!(request_id = %self.request_id, "terminal message delivery timed out"),
        }
        outcome
    }

    fn transition(&mut self, next: TaskStatus) {
        debug!(
            event = "task.state",
            request_id = %self.request_id,
            from = ?self.state,
            to = ?next,
            "task state changed"
        );
        self.state = next;
        if let Some(lease) = self.lease.as_ref() {
            lease.set_status(next);
        }
    }
}
