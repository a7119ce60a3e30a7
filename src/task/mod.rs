pub mod model;
pub mod registry;
pub mod store;

use std::sync::Arc;

use tokio::sync::RwLock;

pub use model::{
    ScriptErrorCode, ScriptResult, ScriptTaskRequest, TaskInfo, TaskKind, TaskRecord, TaskStatus,
};
pub use registry::TaskRegistry;
pub use store::TaskStore;

use crate::worker::ScriptTask;

/// Registry shared between handlers; many readers, exclusive add/remove.
pub type SharedRegistry = Arc<RwLock<TaskRegistry>>;

/// A live task of any kind.
#[derive(Debug, Clone)]
pub enum Task {
    Script(Arc<ScriptTask>),
}

impl Task {
    pub fn id(&self) -> &str {
        match self {
            Task::Script(t) => t.id(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Script(_) => TaskKind::Script,
        }
    }

    pub fn content(&self) -> &[u8] {
        match self {
            Task::Script(t) => t.content(),
        }
    }

    pub async fn status(&self) -> TaskStatus {
        match self {
            Task::Script(t) => t.status().await,
        }
    }

    pub async fn result(&self) -> Option<ScriptResult> {
        match self {
            Task::Script(t) => t.result().await,
        }
    }

    pub async fn snapshot(&self) -> TaskRecord {
        match self {
            Task::Script(t) => t.snapshot().await,
        }
    }

    pub fn stop(&self) {
        match self {
            Task::Script(t) => t.stop(),
        }
    }
}

impl From<ScriptTask> for Task {
    fn from(task: ScriptTask) -> Self {
        Task::Script(Arc::new(task))
    }
}
