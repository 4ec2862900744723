use std::sync::Arc;

use async_trait::async_trait;
use protocol::{NotificationMessage, StepEvent};

/// The caller's session channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, message: NotificationMessage) -> anyhow::Result<()>;
}

/// Turns step and completion events of one request into outbound messages.
///
/// Holds the at-most-one-terminal invariant: once a terminal message has
/// been attempted (delivered or not), every later send is refused.
pub struct ProgressNotifier {
    request_id: String,
    sink: Arc<dyn NotificationSink>,
    terminal_sent: bool,
    last_step: Option<u64>,
}

impl ProgressNotifier {
    pub fn new(request_id: impl Into<String>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            request_id: request_id.into(),
            sink,
            terminal_sent: false,
            last_step: None,
        }
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    pub async fn notify_step(&mut self, step: &StepEvent, usage_so_far: u64) -> anyhow::Result<()> {
        if self.terminal_sent {
            anyhow::bail!(
                "request {} already closed; dropping step {}",
                self.request_id,
                step.step_number
            );
        }
        if let Some(last) = self.last_step {
            if step.step_number <= last {
                anyhow::bail!(
                    "step {} for request {} is not after step {}",
                    step.step_number,
                    self.request_id,
                    last
                );
            }
        }
        self.last_step = Some(step.step_number);
        let message = NotificationMessage::step(self.request_id.clone(), step, usage_so_far);
        self.sink.send(message).await
    }

    pub async fn notify_done(
        &mut self,
        total_usage: u64,
        timeout_summary: Option<String>,
    ) -> anyhow::Result<()> {
        let message = NotificationMessage::done(self.request_id.clone(), total_usage, timeout_summary);
        self.send_terminal(message).await
    }

    pub async fn notify_failed(&mut self, total_usage: u64, error: &str) -> anyhow::Result<()> {
        let message = NotificationMessage::failed(self.request_id.clone(), total_usage, error);
        self.send_terminal(message).await
    }

    async fn send_terminal(&mut self, message: NotificationMessage) -> anyhow::Result<()> {
        if self.terminal_sent {
            anyhow::bail!("terminal message for request {} already sent", self.request_id);
        }
        self.terminal_sent = true;
        self.sink.send(message).await
    }
}
