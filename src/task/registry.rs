use std::collections::HashMap;

use crate::error::{AgentError, Result};
use crate::task::Task;

/// In-memory view of live tasks, keyed by task id.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Fails if a task with the same id is already tracked.
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(task.id()) {
            return Err(AgentError::TaskExists(task.id().to_string()));
        }
        self.tasks.insert(task.id().to_string(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::TaskNotFound(id.to_string()))
    }

    pub fn remove(&mut self, id: &str) -> Result<Task> {
        self.tasks
            .remove(id)
            .ok_or_else(|| AgentError::TaskNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Copy of the current map. Later changes to the registry are not reflected.
    pub fn snapshot(&self) -> HashMap<String, Task> {
        self.tasks.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
