use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::PlatformDefaults;
use crate::error::Result;
use crate::protocol::{Context, Handler, ResponseCode};
use crate::task::store::blocking;
use crate::task::{ScriptTaskRequest, SharedRegistry, Task, TaskStore};
use crate::worker::ScriptTask;

/// Runs `v1/ExecuteScript` requests to completion and replies with the result.
pub struct ScriptHandler {
    registry: SharedRegistry,
    store: Arc<TaskStore>,
    platform: PlatformDefaults,
}

impl ScriptHandler {
    pub fn new(registry: SharedRegistry, store: Arc<TaskStore>, platform: PlatformDefaults) -> Self {
        Self {
            registry,
            store,
            platform,
        }
    }

    async fn persist(&self, task: &Task) -> Result<()> {
        let record = task.snapshot().await;
        blocking(&self.store, move |store| store.save(&record)).await
    }
}

#[async_trait]
impl Handler for ScriptHandler {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let request: ScriptTaskRequest = match ctx.bind() {
            Ok(request) => request,
            Err(e) => {
                ctx.json_error(ResponseCode::Error, &format!("invalid script request: {}", e))
                    .await?;
                return Err(e);
            }
        };

        let task_id = [request.task_id.as_str(), ctx.message.task_id.as_str()]
            .into_iter()
            .find(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let script = Arc::new(
            ScriptTask::new(task_id.clone(), request, self.platform.clone())
                .with_cancellation(ctx.cancellation()),
        );
        let task = Task::Script(script.clone());

        if let Err(e) = self.registry.write().await.add(task.clone()) {
            tracing::warn!(task_id = %task_id, error = %e, "Rejecting script request");
            ctx.json_error(ResponseCode::Error, &e.to_string()).await?;
            return Ok(());
        }
        if let Err(e) = self.persist(&task).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to persist new task");
        }

        tracing::info!(task_id = %task_id, "Running script");
        let result = script.run().await;

        if let Err(e) = self.persist(&task).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to persist task result");
        }

        let payload = serde_json::to_value(&result)?;
        let code = result.code.response_code();
        let text = if code == ResponseCode::Success {
            "ok".to_string()
        } else {
            format!("{}: {}", result.code, result.error)
        };
        ctx.respond(code, &text, Some(payload)).await
    }
}
