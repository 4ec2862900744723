use protocol::TaskStatus;
use serde::Serialize;
use std::path::Path;

use crate::context::profile_dir_name;
use crate::supervisor::{CleanupReport, TaskOutcome, TaskReport};

#[derive(Serialize)]
struct TaskRecord<'a> {
    request_id: &'a str,
    status: TaskStatus,
    total_usage: u64,
    steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_summary: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    duration_ms: u128,
    cleanup: &'a CleanupReport,
}

impl<'a> TaskRecord<'a> {
    fn from_report(report: &'a TaskReport) -> Self {
        let (timeout_summary, error) = match &report.outcome {
            TaskOutcome::TimedOut { summary, .. } => (Some(summary.as_str()), None),
            TaskOutcome::Failed { error, .. } => (None, Some(error.as_str())),
            TaskOutcome::Completed { .. } | TaskOutcome::Cancelled { .. } => (None, None),
        };
        Self {
            request_id: &report.request_id,
            status: report.outcome.status(),
            total_usage: report.outcome.total_usage(),
            steps: report.steps,
            timeout_summary,
            error,
            duration_ms: report.duration.as_millis(),
            cleanup: &report.cleanup,
        }
    }
}

/// Writes `<profile dir name>.result.json` under `output_dir`. Failures are
/// logged; a missing record never changes the task outcome.
pub(crate) async fn write_task_record(output_dir: &Path, report: &TaskReport) {
    if let Err(err) = tokio::fs::create_dir_all(output_dir).await {
        tracing::warn!(error = %err, dir = %output_dir.display(), "failed to create record dir");
        return;
    }
    let record = TaskRecord::from_report(report);
    let path = output_dir.join(format!(
        "{}.result.json",
        profile_dir_name(&report.request_id)
    ));
    match serde_json::to_vec_pretty(&record) {
        Ok(payload) => {
            if let Err(err) = tokio::fs::write(&path, payload).await {
                tracing::warn!(error = %err, path = %path.display(), "failed to write task record");
            }
        }
        Err(err) => tracing::warn!(error = %err, "failed to encode task record"),
    }
}
