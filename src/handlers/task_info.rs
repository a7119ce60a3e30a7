use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AgentError, Result};
use crate::protocol::{Context, Handler, ResponseCode};
use crate::task::store::blocking;
use crate::task::{SharedRegistry, TaskInfo, TaskRecord, TaskStore};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskQuery {
    #[serde(default, alias = "task_id")]
    task_id: String,
}

/// Task id from `data.taskId`, else the envelope's `taskId`.
fn query_id(ctx: &Context) -> Result<String> {
    ctx.bind::<TaskQuery>()
        .ok()
        .map(|q| q.task_id)
        .filter(|id| !id.is_empty())
        .or_else(|| Some(ctx.message.task_id.clone()).filter(|id| !id.is_empty()))
        .ok_or_else(|| AgentError::Internal("taskId is required".to_string()))
}

/// Answers `v1/GetTaskInfo` from live state, falling back to task history.
pub struct TaskInfoHandler {
    registry: SharedRegistry,
    store: Arc<TaskStore>,
}

impl TaskInfoHandler {
    pub fn new(registry: SharedRegistry, store: Arc<TaskStore>) -> Self {
        Self { registry, store }
    }

    /// Memory first, then the durable store.
    pub async fn lookup(&self, id: &str) -> Result<TaskRecord> {
        let live = self.registry.read().await.get(id);
        match live {
            Ok(task) => Ok(task.snapshot().await),
            Err(AgentError::TaskNotFound(_)) => {
                let id = id.to_string();
                blocking(&self.store, move |store| store.get(&id)).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Handler for TaskInfoHandler {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let id = match query_id(ctx) {
            Ok(id) => id,
            Err(e) => {
                ctx.json_error(ResponseCode::Error, "taskId is required").await?;
                return Err(e);
            }
        };

        match self.lookup(&id).await {
            Ok(record) => ctx.json_success(&TaskInfo::from(&record)).await,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Task info lookup failed");
                ctx.json_error(ResponseCode::Error, &e.to_string()).await
            }
        }
    }
}

/// Retires a finished task once the server acknowledges its result.
pub struct TaskAckHandler {
    registry: SharedRegistry,
    store: Arc<TaskStore>,
}

impl TaskAckHandler {
    pub fn new(registry: SharedRegistry, store: Arc<TaskStore>) -> Self {
        Self { registry, store }
    }

    /// Remove `id` from memory and store if it is terminal. Returns whether it was retired.
    pub async fn retire(&self, id: &str) -> Result<bool> {
        let mut registry = self.registry.write().await;
        let status = match registry.get(id) {
            Ok(task) => Some(task.status().await),
            Err(AgentError::TaskNotFound(_)) => None,
            Err(e) => return Err(e),
        };

        match status {
            Some(status) if !status.is_terminal() => {
                tracing::debug!(task_id = %id, status = %status, "Task still live, not retiring");
                Ok(false)
            }
            Some(_) => {
                registry.remove(id)?;
                drop(registry);
                self.remove_stored(id).await?;
                Ok(true)
            }
            None => {
                drop(registry);
                let key = id.to_string();
                match blocking(&self.store, move |store| store.get(&key)).await {
                    Ok(record) if record.status().is_terminal() => {
                        self.remove_stored(id).await?;
                        Ok(true)
                    }
                    Ok(_) => Ok(false),
                    Err(AgentError::TaskNotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn remove_stored(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        match blocking(&self.store, move |store| store.remove(&id)).await {
            Ok(()) | Err(AgentError::TaskNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Handler for TaskAckHandler {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let id = query_id(ctx)?;
        if self.retire(&id).await? {
            tracing::info!(task_id = %id, "Task retired");
        }
        Ok(())
    }
}
