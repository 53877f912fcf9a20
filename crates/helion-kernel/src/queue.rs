//! Queued agent tasks.
//!
//! A small FIFO of work the user (or a background task) wants an LLM agent
//! to pick up later — "write a spec for the notes app", "review the shell".
//! Persisted to `claude-tasks.json`. LLM-budgeted scheduler tasks drain it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::registry::atomic_write;

/// Lifecycle of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTaskStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by a runner.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
}

/// One queued task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    /// Task id (uuid).
    pub id: String,
    /// What the agent should do.
    pub prompt: String,
    /// Current status.
    pub status: AgentTaskStatus,
    /// Result or error text once finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Unix seconds enqueued.
    pub created_at: u64,
}

/// The persistent FIFO.
pub struct AgentTaskQueue {
    path: PathBuf,
    tasks: Mutex<Vec<AgentTask>>,
}

impl AgentTaskQueue {
    /// Load from `<data_root>/claude-tasks.json`.
    pub fn load(data_root: &Path) -> Self {
        let path = data_root.join("claude-tasks.json");
        let tasks = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::warn!(%err, "corrupt claude-tasks.json, starting fresh");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            tasks: Mutex::new(tasks),
        }
    }

    /// Enqueue a prompt.
    pub fn enqueue(&self, prompt: &str) -> Result<AgentTask> {
        if prompt.trim().is_empty() {
            return Err(KernelError::Validation {
                reason: "agent task prompt is empty".into(),
            });
        }
        let task = AgentTask {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.trim().to_string(),
            status: AgentTaskStatus::Queued,
            outcome: None,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        {
            let mut tasks = self.tasks.lock();
            tasks.push(task.clone());
        }
        self.persist()?;
        Ok(task)
    }

    /// Claim the oldest queued task, marking it running.
    pub fn claim(&self) -> Option<AgentTask> {
        let claimed = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .iter_mut()
                .find(|t| t.status == AgentTaskStatus::Queued)?;
            task.status = AgentTaskStatus::Running;
            task.clone()
        };
        let _ = self.persist();
        Some(claimed)
    }

    /// Record a claimed task's outcome.
    pub fn complete(&self, id: &str, success: bool, outcome: &str) -> Result<()> {
        {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| KernelError::NotFound {
                    what: format!("agent task {id}"),
                })?;
            task.status = if success {
                AgentTaskStatus::Done
            } else {
                AgentTaskStatus::Failed
            };
            task.outcome = Some(outcome.to_string());
        }
        self.persist()
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<AgentTask> {
        self.tasks.lock().clone()
    }

    /// Number of tasks still queued.
    pub fn queued_len(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| t.status == AgentTaskStatus::Queued)
            .count()
    }

    fn persist(&self) -> Result<()> {
        let tasks = self.tasks.lock();
        let json = serde_json::to_vec_pretty(&*tasks)
            .map_err(|e| KernelError::Internal(format!("queue serialize: {e}")))?;
        drop(tasks);
        atomic_write(&self.path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fifo_order_and_lifecycle() {
        let dir = tempdir().unwrap();
        let queue = AgentTaskQueue::load(dir.path());
        let a = queue.enqueue("first").unwrap();
        queue.enqueue("second").unwrap();

        let claimed = queue.claim().unwrap();
        assert_eq!(claimed.id, a.id, "oldest first");
        assert_eq!(claimed.status, AgentTaskStatus::Running);

        queue.complete(&claimed.id, true, "done").unwrap();
        let done = queue
            .list()
            .into_iter()
            .find(|t| t.id == claimed.id)
            .unwrap();
        assert_eq!(done.status, AgentTaskStatus::Done);
        assert_eq!(queue.queued_len(), 1);
    }

    #[test]
    fn empty_prompt_rejected() {
        let dir = tempdir().unwrap();
        let queue = AgentTaskQueue::load(dir.path());
        assert!(queue.enqueue("   ").is_err());
    }

    #[test]
    fn survives_reload() {
        let dir = tempdir().unwrap();
        {
            let queue = AgentTaskQueue::load(dir.path());
            queue.enqueue("persisted").unwrap();
        }
        let queue = AgentTaskQueue::load(dir.path());
        assert_eq!(queue.queued_len(), 1);
    }
}
