//! Message handlers, one per `type` routing key.

pub mod auth;
pub mod file;
pub mod script;
pub mod task_info;

use std::sync::Arc;

use crate::config::PlatformDefaults;
use crate::error::Result;
use crate::protocol::{types, HandlerRegistry};
use crate::task::{SharedRegistry, TaskStore};

pub use auth::{HeartbeatHandler, RegisterHandler};
pub use file::{DeleteFileHandler, DownloadFileHandler, GetFileInfoHandler, MoveFileHandler};
pub use script::ScriptHandler;
pub use task_info::{TaskAckHandler, TaskInfoHandler};

/// Build the full handler table. Fails on a duplicate type.
pub fn register_all(
    registry: &mut HandlerRegistry,
    tasks: SharedRegistry,
    store: Arc<TaskStore>,
    platform: PlatformDefaults,
    http: reqwest::Client,
) -> Result<()> {
    registry.register(types::REGISTER, Arc::new(RegisterHandler))?;
    registry.register(types::HEARTBEAT, Arc::new(HeartbeatHandler))?;
    registry.register(
        types::EXECUTE_SCRIPT,
        Arc::new(ScriptHandler::new(tasks.clone(), store.clone(), platform)),
    )?;
    registry.register(
        types::GET_TASK_INFO,
        Arc::new(TaskInfoHandler::new(tasks.clone(), store.clone())),
    )?;

    let ack = Arc::new(TaskAckHandler::new(tasks, store));
    registry.register(types::GET_TASK_INFO_RESPONSE, ack.clone())?;
    registry.register(types::EXECUTE_SCRIPT_RESPONSE, ack)?;

    registry.register(types::GET_FILE_INFO, Arc::new(GetFileInfoHandler))?;
    registry.register(types::DELETE_FILE, Arc::new(DeleteFileHandler))?;
    registry.register(types::MOVE_FILE, Arc::new(MoveFileHandler))?;
    registry.register(types::DOWNLOAD_FILE, Arc::new(DownloadFileHandler::new(http)))?;
    Ok(())
}
