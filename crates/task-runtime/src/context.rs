use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use anyhow::Context;
use protocol::TaskStatus;
use serde::Serialize;

const PREFIX_LIMIT: usize = 32;
const TASK_PREVIEW_CHARS: usize = 80;

/// Directory name for a request's isolated profile.
///
/// Deterministic, distinct for distinct ids, and safe to join onto a root
/// whatever characters the caller put in the id.
pub fn profile_dir_name(request_id: &str) -> String {
    let prefix: String = request_id
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
        .take(PREFIX_LIMIT)
        .collect();
    let prefix = if prefix.is_empty() {
        "request".to_string()
    } else {
        prefix
    };
    format!("{prefix}-{:x}", md5::compute(request_id.as_bytes()))
}

struct ActiveEntry {
    status: TaskStatus,
    started_at: SystemTime,
    task_preview: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActiveRequestInfo {
    pub request_id: String,
    pub status: TaskStatus,
    pub started_at: String,
    pub task: String,
}

/// Request ids that currently have a supervisor running.
#[derive(Clone, Default)]
pub struct ActiveRequests {
    inner: Arc<Mutex<HashMap<String, ActiveEntry>>>,
}

impl ActiveRequests {
    pub fn reserve(&self, request_id: &str, task: &str) -> anyhow::Result<RequestLease> {
        let mut guard = self.lock();
        if guard.contains_key(request_id) {
            anyhow::bail!("request_id {request_id} is already in flight");
        }
        guard.insert(
            request_id.to_string(),
            ActiveEntry {
                status: TaskStatus::Created,
                started_at: SystemTime::now(),
                task_preview: task.chars().take(TASK_PREVIEW_CHARS).collect(),
            },
        );
        Ok(RequestLease {
            request_id: request_id.to_string(),
            registry: self.clone(),
        })
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ActiveRequestInfo> {
        let guard = self.lock();
        let mut entries: Vec<(&String, &ActiveEntry)> = guard.iter().collect();
        entries.sort_by(|a, b| a.1.started_at.cmp(&b.1.started_at).then(a.0.cmp(b.0)));
        entries
            .into_iter()
            .map(|(id, entry)| ActiveRequestInfo {
                request_id: id.clone(),
                status: entry.status,
                started_at: humantime::format_rfc3339_seconds(entry.started_at).to_string(),
                task: entry.task_preview.clone(),
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveEntry>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reservation of a request id; dropping it frees the id for reuse.
pub struct RequestLease {
    request_id: String,
    registry: ActiveRequests,
}

impl RequestLease {
    pub fn set_status(&self, status: TaskStatus) {
        if let Some(entry) = self.registry.lock().get_mut(&self.request_id) {
            entry.status = status;
        }
    }
}

impl Drop for RequestLease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.request_id);
    }
}

/// Isolated per-request execution environment: owns the profile directory
/// handed to the browser and the agent.
pub struct RequestContext {
    request_id: String,
    profile_path: PathBuf,
    keep_profile: bool,
    released: bool,
}

impl RequestContext {
    pub async fn acquire(
        profile_root: &Path,
        request_id: &str,
        keep_profile: bool,
    ) -> anyhow::Result<Self> {
        let profile_path = profile_root.join(profile_dir_name(request_id));
        if tokio::fs::try_exists(&profile_path).await.unwrap_or(false) {
            tracing::info!(
                request_id = %request_id,
                path = %profile_path.display(),
                "removing stale profile directory"
            );
            tokio::fs::remove_dir_all(&profile_path)
                .await
                .with_context(|| format!("failed to clear {}", profile_path.display()))?;
        }
        tokio::fs::create_dir_all(&profile_path)
            .await
            .with_context(|| format!("failed to create {}", profile_path.display()))?;
        Ok(Self {
            request_id: request_id.to_string(),
            profile_path,
            keep_profile,
            released: false,
        })
    }

    pub fn profile_path(&self) -> &Path {
        &self.profile_path
    }

    /// Detaches the context from the request. The profile directory stays on
    /// disk until the returned handle runs, which must happen after every
    /// process using the directory has exited.
    pub fn close(mut self) -> ProfileRemoval {
        self.released = true;
        ProfileRemoval {
            request_id: std::mem::take(&mut self.request_id),
            profile_path: std::mem::take(&mut self.profile_path),
            keep_profile: self.keep_profile,
            removed: false,
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if self.released || self.keep_profile {
            return;
        }
        tracing::warn!(
            request_id = %self.request_id,
            path = %self.profile_path.display(),
            "request context dropped without release"
        );
        let _ = std::fs::remove_dir_all(&self.profile_path);
    }
}

/// Pending removal of a closed request's profile directory.
pub struct ProfileRemoval {
    request_id: String,
    profile_path: PathBuf,
    keep_profile: bool,
    removed: bool,
}

impl ProfileRemoval {
    pub async fn remove(mut self) -> anyhow::Result<()> {
        if self.keep_profile {
            self.removed = true;
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.profile_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove {}", self.profile_path.display()))
            }
        }
        self.removed = true;
        Ok(())
    }
}

impl Drop for ProfileRemoval {
    fn drop(&mut self) {
        if self.removed || self.keep_profile {
            return;
        }
        tracing::warn!(
            request_id = %self.request_id,
            path = %self.profile_path.display(),
            "retrying profile removal"
        );
        let _ = std::fs::remove_dir_all(&self.profile_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    #[test]
    fn dir_names_are_deterministic_and_distinct() {
        assert_eq!(profile_dir_name("R3"), profile_dir_name("R3"));
        assert_ne!(profile_dir_name("R3"), profile_dir_name("R4"));
        assert!(profile_dir_name("R3").starts_with("R3-"));
    }

    #[test]
    fn dir_names_cannot_escape_root() {
        let name = profile_dir_name("../../etc/passwd");
        assert!(!name.contains('/'));
        assert!(!name.contains(".."));
        assert!(profile_dir_name("///").starts_with("request-"));
        assert_ne!(profile_dir_name("a/b"), profile_dir_name("ab"));
    }

    #[test]
    fn reserve_rejects_in_flight_ids_and_allows_reuse() {
        let active = ActiveRequests::default();
        let lease = active.reserve("R1", "find flights").expect("reserve");
        assert!(active.contains("R1"));
        assert!(active.reserve("R1", "again").is_err());
        lease.set_status(TaskStatus::Running);
        let snapshot = active.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, TaskStatus::Running);
        assert_eq!(snapshot[0].task, "find flights");

        drop(lease);
        assert!(active.is_empty());
        let _lease = active.reserve("R1", "again").expect("reuse after completion");
    }

    #[tokio::test]
    async fn acquire_and_remove_profile_dir() {
        let root = temp_dir("task-runtime-context");
        let context = RequestContext::acquire(&root, "R1", false)
            .await
            .expect("acquire");
        let path = context.profile_path().to_path_buf();
        assert!(path.is_dir());
        assert!(path.starts_with(&root));
        std::fs::write(path.join("Local State"), b"{}").expect("write");

        context.close().remove().await.expect("remove");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn acquire_clears_stale_profile() {
        let root = temp_dir("task-runtime-context-stale");
        let stale = root.join(profile_dir_name("R1"));
        std::fs::create_dir_all(&stale).expect("create");
        std::fs::write(stale.join("leftover"), b"x").expect("write");

        let context = RequestContext::acquire(&root, "R1", false)
            .await
            .expect("acquire");
        assert!(!context.profile_path().join("leftover").exists());
        context.close().remove().await.expect("remove");
    }

    #[tokio::test]
    async fn keep_profile_leaves_directory() {
        let root = temp_dir("task-runtime-context-keep");
        let context = RequestContext::acquire(&root, "R1", true)
            .await
            .expect("acquire");
        let path = context.profile_path().to_path_buf();
        context.close().remove().await.expect("remove");
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn closed_context_keeps_profile_until_removed() {
        let root = temp_dir("task-runtime-context-close");
        let context = RequestContext::acquire(&root, "R1", false)
            .await
            .expect("acquire");
        let path = context.profile_path().to_path_buf();

        let removal = context.close();
        assert!(path.is_dir());
        removal.remove().await.expect("remove");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropped_removal_still_clears_profile() {
        let root = temp_dir("task-runtime-context-drop");
        let context = RequestContext::acquire(&root, "R1", false)
            .await
            .expect("acquire");
        let path = context.profile_path().to_path_buf();
        drop(context.close());
        assert!(!path.exists());
    }
}
