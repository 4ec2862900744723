use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use protocol::{CompletionRecord, NotificationMessage, StepEvent};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    AgentEngine, AgentEngineFactory, EngineRequest, EngineSinks, Environment,
    EnvironmentLauncher, LaunchOptions,
};
use crate::notifier::NotificationSink;
use crate::supervisor::SupervisorSettings;
use crate::usage::total_usage;

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    dir.push(format!("{prefix}-{nanos}-{seq}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub(crate) fn step(step_number: u64, usage: Option<u64>) -> StepEvent {
    StepEvent {
        step_number,
        visual_state: Some(format!("screenshot-{step_number}")),
        step_result: json!({ "action": "click", "step": step_number }),
        usage_for_step: usage,
    }
}

pub(crate) fn settings(profile_root: &Path, time_budget: Duration) -> Arc<SupervisorSettings> {
    Arc::new(SupervisorSettings {
        time_budget,
        max_steps: 10,
        stop_grace: Duration::from_secs(5),
        profile_root: profile_root.to_path_buf(),
        keep_profiles: false,
        record_dir: None,
        launch: LaunchOptions::default(),
    })
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    messages: Mutex<Vec<NotificationMessage>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingSink {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn messages(&self) -> Vec<NotificationMessage> {
        self.messages.lock().expect("lock").clone()
    }

    pub(crate) fn messages_for(&self, request_id: &str) -> Vec<NotificationMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.request_id == request_id)
            .collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, message: NotificationMessage) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("session closed");
        }
        self.messages.lock().expect("lock").push(message);
        Ok(())
    }
}

/// Counters shared by the fake launcher, the scripted engines and the test.
#[derive(Default)]
pub(crate) struct Counters {
    pub environments_opened: AtomicUsize,
    pub environments_closed: AtomicUsize,
    pub engines_created: AtomicUsize,
    pub engines_closed: AtomicUsize,
    pub stops_requested: AtomicUsize,
    pub fail_environment_close: AtomicBool,
    /// The environment keeps writing into its profile until it is closed.
    pub environment_writes_profile: AtomicBool,
    pub requests: Mutex<Vec<EngineRequest>>,
}

impl Counters {
    pub(crate) fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

pub(crate) struct FakeLauncher {
    counters: Arc<Counters>,
    fail_open: bool,
}

impl FakeLauncher {
    pub(crate) fn new(counters: Arc<Counters>, fail_open: bool) -> Self {
        Self { counters, fail_open }
    }
}

#[async_trait]
impl EnvironmentLauncher for FakeLauncher {
    async fn open(
        &self,
        profile_path: &Path,
        _options: &LaunchOptions,
    ) -> anyhow::Result<Box<dyn Environment>> {
        if self.fail_open {
            anyhow::bail!("browser binary missing");
        }
        assert!(profile_path.is_dir(), "profile dir must exist before launch");
        self.counters.environments_opened.fetch_add(1, Ordering::SeqCst);
        let writer = self
            .counters
            .environment_writes_profile
            .load(Ordering::SeqCst)
            .then(|| ProfileWriter::spawn(profile_path.to_path_buf()));
        Ok(Box::new(FakeEnvironment {
            counters: Arc::clone(&self.counters),
            writer: tokio::sync::Mutex::new(writer),
        }))
    }
}

/// Stands in for a browser flushing its profile to disk.
struct ProfileWriter {
    stop: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl ProfileWriter {
    fn spawn(profile_path: PathBuf) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let session_dir = profile_path.join("Default");
            loop {
                let _ = tokio::fs::create_dir_all(&session_dir).await;
                let _ = tokio::fs::write(session_dir.join("Cookies"), b"session").await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(2)) => {}
                }
            }
        });
        Self { stop, handle }
    }

    async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}

struct FakeEnvironment {
    counters: Arc<Counters>,
    writer: tokio::sync::Mutex<Option<ProfileWriter>>,
}

#[async_trait]
impl Environment for FakeEnvironment {
    fn endpoint(&self) -> Option<String> {
        Some("ws://127.0.0.1:9222/devtools/browser/fake".to_string())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.counters.environments_closed.fetch_add(1, Ordering::SeqCst);
        if let Some(writer) = self.writer.lock().await.take() {
            writer.shutdown().await;
        }
        if self.counters.fail_environment_close.load(Ordering::SeqCst) {
            anyhow::bail!("browser refused to exit");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Action {
    Step(StepEvent),
    Sleep(Duration),
    /// Sends a completion record built from the steps sent so far.
    Complete,
    /// Same as `Complete` but with a made-up usage total.
    CompleteReporting(u64),
    Fail(String),
    WaitForStop,
    /// Ignores stop requests.
    Hang,
}

pub(crate) struct ScriptedFactory {
    script: Vec<Action>,
    counters: Arc<Counters>,
}

impl ScriptedFactory {
    pub(crate) fn new(script: Vec<Action>, counters: Arc<Counters>) -> Self {
        Self { script, counters }
    }
}

#[async_trait]
impl AgentEngineFactory for ScriptedFactory {
    async fn create(&self, request: &EngineRequest) -> anyhow::Result<Box<dyn AgentEngine>> {
        self.counters.engines_created.fetch_add(1, Ordering::SeqCst);
        self.counters
            .requests
            .lock()
            .expect("lock")
            .push(request.clone());
        Ok(Box::new(ScriptedEngine {
            script: self.script.clone(),
            counters: Arc::clone(&self.counters),
            stop: CancellationToken::new(),
        }))
    }
}

struct ScriptedEngine {
    script: Vec<Action>,
    counters: Arc<Counters>,
    stop: CancellationToken,
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    async fn run(
        &self,
        _task: &str,
        _environment: &dyn Environment,
        sinks: EngineSinks,
    ) -> anyhow::Result<()> {
        let EngineSinks { steps, done } = sinks;
        let mut done = Some(done);
        let mut history = Vec::new();
        for action in self.script.iter().cloned() {
            match action {
                Action::Step(step) => {
                    if self.stop.is_cancelled() {
                        return Ok(());
                    }
                    history.push(step.clone());
                    steps
                        .send(step)
                        .await
                        .map_err(|_| anyhow::anyhow!("step receiver closed"))?;
                }
                Action::Sleep(duration) => tokio::time::sleep(duration).await,
                Action::Complete => {
                    if let Some(done) = done.take() {
                        let _ = done.send(CompletionRecord {
                            total_usage: Some(total_usage(&history)),
                            history: history.clone(),
                        });
                    }
                }
                Action::CompleteReporting(total) => {
                    if let Some(done) = done.take() {
                        let _ = done.send(CompletionRecord {
                            history: history.clone(),
                            total_usage: Some(total),
                        });
                    }
                }
                Action::Fail(message) => anyhow::bail!(message),
                Action::WaitForStop => self.stop.cancelled().await,
                Action::Hang => std::future::pending::<()>().await,
            }
        }
        Ok(())
    }

    fn request_stop(&self) {
        self.counters.stops_requested.fetch_add(1, Ordering::SeqCst);
        self.stop.cancel();
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.counters.engines_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
