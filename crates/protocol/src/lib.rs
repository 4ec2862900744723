use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod config;

/// One progress update emitted by an agent engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepEvent {
    pub step_number: u64,
    /// Opaque snapshot of the environment, usually a base64 screenshot.
    #[serde(default)]
    pub visual_state: Option<String>,
    #[serde(default)]
    pub step_result: Value,
    #[serde(default)]
    pub usage_for_step: Option<u64>,
}

/// Terminal summary of a run that finished on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRecord {
    pub history: Vec<StepEvent>,
    /// Usage as reported by the engine itself. Not trusted by the supervisor.
    #[serde(default)]
    pub total_usage: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationMessage {
    pub request_id: String,
    pub is_last: bool,
    #[serde(flatten)]
    pub body: NotificationBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NotificationBody {
    Step {
        step_no: u64,
        #[serde(default)]
        screenshot: Option<String>,
        #[serde(default)]
        result: Value,
        total_token: u64,
    },
    Done {
        total_token: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl NotificationMessage {
    pub fn step(request_id: impl Into<String>, step: &StepEvent, usage_so_far: u64) -> Self {
        Self {
            request_id: request_id.into(),
            is_last: false,
            body: NotificationBody::Step {
                step_no: step.step_number,
                screenshot: step.visual_state.clone(),
                result: step.step_result.clone(),
                total_token: usage_so_far,
            },
        }
    }

    pub fn done(
        request_id: impl Into<String>,
        total_usage: u64,
        timeout_summary: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            is_last: true,
            body: NotificationBody::Done {
                total_token: total_usage,
                timeout_summary,
                error: None,
            },
        }
    }

    pub fn failed(
        request_id: impl Into<String>,
        total_usage: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            is_last: true,
            body: NotificationBody::Done {
                total_token: total_usage,
                timeout_summary: None,
                error: Some(error.into()),
            },
        }
    }

    pub fn total_token(&self) -> u64 {
        match &self.body {
            NotificationBody::Step { total_token, .. } | NotificationBody::Done { total_token, .. } => {
                *total_token
            }
        }
    }

    pub fn step_no(&self) -> Option<u64> {
        match &self.body {
            NotificationBody::Step { step_no, .. } => Some(*step_no),
            NotificationBody::Done { .. } => None,
        }
    }

    pub fn timeout_summary(&self) -> Option<&str> {
        match &self.body {
            NotificationBody::Done {
                timeout_summary, ..
            } => timeout_summary.as_deref(),
            NotificationBody::Step { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
    CleaningUp,
    CleanedUp,
}

/// First line written to an agent process on stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentLaunch {
    pub request_id: String,
    pub task: String,
    pub max_steps: u32,
    #[serde(default)]
    pub environment_endpoint: Option<String>,
    pub profile_path: String,
    #[serde(default)]
    pub system_message: Option<String>,
}

/// One JSON line read from an agent process on stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Step(StepEvent),
    Done(CompletionRecord),
}
