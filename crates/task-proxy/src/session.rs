use async_trait::async_trait;
use protocol::NotificationMessage;
use rmcp::model::{LoggingLevel, LoggingMessageNotificationParam};
use rmcp::service::Peer;
use rmcp::RoleServer;
use task_runtime::NotificationSink;

const LOGGER_NAME: &str = "browser-task";

/// Delivers task notifications to the MCP client that started the task, as
/// `notifications/message` entries whose `data` is the notification JSON.
pub(crate) struct PeerNotificationSink {
    peer: Peer<RoleServer>,
}

impl PeerNotificationSink {
    pub(crate) fn new(peer: Peer<RoleServer>) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl NotificationSink for PeerNotificationSink {
    async fn send(&self, message: NotificationMessage) -> anyhow::Result<()> {
        let param = logging_param(&message)?;
        self.peer
            .notify_logging_message(param)
            .await
            .map_err(|err| anyhow::anyhow!("failed to notify client: {err}"))
    }
}

fn logging_param(message: &NotificationMessage) -> anyhow::Result<LoggingMessageNotificationParam> {
    Ok(LoggingMessageNotificationParam {
        level: LoggingLevel::Info,
        logger: Some(LOGGER_NAME.to_string()),
        data: serde_json::to_value(message)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::StepEvent;
    use serde_json::json;

    #[test]
    fn wraps_progress_as_info_log() {
        let step = StepEvent {
            step_number: 1,
            visual_state: None,
            step_result: json!({"done": false}),
            usage_for_step: Some(3),
        };
        let param = logging_param(&NotificationMessage::step("R1", &step, 3)).expect("param");
        assert!(matches!(param.level, LoggingLevel::Info));
        assert_eq!(param.logger.as_deref(), Some("browser-task"));
        assert_eq!(param.data["request_id"], "R1");
        assert_eq!(param.data["step_no"], 1);
        assert_eq!(param.data["is_last"], false);
    }

    #[test]
    fn terminal_carries_total_and_summary() {
        let message = NotificationMessage::done("R2", 0, Some("out of time".to_string()));
        let param = logging_param(&message).expect("param");
        assert_eq!(
            param.data,
            json!({
                "request_id": "R2",
                "is_last": true,
                "total_token": 0,
                "timeout_summary": "out of time"
            })
        );
    }
}
