use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{AgentError, Result};
use crate::task::model::TaskRecord;

/// Durable task history, one JSON record per task id in SQLite.
///
/// Access is serialized through a single connection. Ids are returned in key
/// order.
#[derive(Debug)]
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            ) WITHOUT ROWID;
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AgentError::Internal("task store lock poisoned".to_string()))
    }

    /// Insert a new record. Fails if the id is already stored.
    pub fn add(&self, record: &TaskRecord) -> Result<()> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tasks (id, kind, status, record, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id(),
                record.kind().to_string(),
                record.status().to_string(),
                record.encode()?,
                chrono::Utc::now().timestamp()
            ],
        )?;
        if inserted == 0 {
            return Err(AgentError::TaskExists(record.id().to_string()));
        }
        Ok(())
    }

    /// Insert or replace the record for its id.
    pub fn save(&self, record: &TaskRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (id, kind, status, record, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                status = excluded.status,
                record = excluded.record,
                updated_at = excluded.updated_at",
            params![
                record.id(),
                record.kind().to_string(),
                record.status().to_string(),
                record.encode()?,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<TaskRecord> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT record FROM tasks WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(raw) => TaskRecord::decode(&raw),
            None => Err(AgentError::TaskNotFound(id.to_string())),
        }
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(AgentError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM tasks ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Fail every record a previous process left running. Returns how many changed.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for id in self.ids()? {
            let record = match self.get(&id) {
                Ok(record) => record,
                Err(AgentError::Codec(e)) => {
                    tracing::warn!(task_id = %id, error = %e, "Skipping unreadable task record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if record.status().is_terminal() {
                continue;
            }
            self.save(&record.interrupted())?;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(recovered, "Marked interrupted tasks as failed");
        }
        Ok(recovered)
    }
}

/// Run `op` against the store on the blocking pool so disk waits stay off
/// the async workers.
pub async fn blocking<T, F>(store: &Arc<TaskStore>, op: F) -> Result<T>
where
    F: FnOnce(&TaskStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| AgentError::Internal(format!("task store operation failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{ScriptTaskRecord, ScriptTaskRequest, TaskStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord::Script(ScriptTaskRecord {
            id: id.to_string(),
            status,
            request: ScriptTaskRequest::default(),
            result: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn test_add_get_remove() {
        let store = TaskStore::open_in_memory().unwrap();
        store.add(&record("t1", TaskStatus::Completed)).unwrap();

        assert_eq!(store.get("t1").unwrap().status(), TaskStatus::Completed);
        store.remove("t1").unwrap();
        assert!(matches!(store.get("t1"), Err(AgentError::TaskNotFound(_))));
        assert!(matches!(store.remove("t1"), Err(AgentError::TaskNotFound(_))));
    }

    #[test]
    fn test_add_duplicate_fails() {
        let store = TaskStore::open_in_memory().unwrap();
        store.add(&record("t1", TaskStatus::Running)).unwrap();
        assert!(matches!(
            store.add(&record("t1", TaskStatus::Running)),
            Err(AgentError::TaskExists(_))
        ));
    }

    #[test]
    fn test_save_overwrites() {
        let store = TaskStore::open_in_memory().unwrap();
        store.save(&record("t1", TaskStatus::Running)).unwrap();
        store.save(&record("t1", TaskStatus::Completed)).unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get("t1").unwrap().status(), TaskStatus::Completed);
    }

    #[test]
    fn test_ids_are_ordered() {
        let store = TaskStore::open_in_memory().unwrap();
        for id in ["c", "a", "b"] {
            store.save(&record(id, TaskStatus::Completed)).unwrap();
        }
        assert_eq!(store.ids().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_recover_interrupted() {
        let store = TaskStore::open_in_memory().unwrap();
        store.save(&record("live", TaskStatus::Running)).unwrap();
        store.save(&record("done", TaskStatus::Completed)).unwrap();

        assert_eq!(store.recover_interrupted().unwrap(), 1);
        assert_eq!(store.get("live").unwrap().status(), TaskStatus::Failed);
        assert_eq!(store.get("done").unwrap().status(), TaskStatus::Completed);
        assert_eq!(store.recover_interrupted().unwrap(), 0);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("tasks.db");
        {
            let store = TaskStore::open(&path).unwrap();
            store.save(&record("t1", TaskStatus::Completed)).unwrap();
        }
        let store = TaskStore::open(&path).unwrap();
        assert_eq!(store.get("t1").unwrap().id(), "t1");
    }

    #[tokio::test]
    async fn test_blocking_runs_store_operations() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let saved = record("t1", TaskStatus::Completed);

        blocking(&store, move |s| s.save(&saved)).await.unwrap();
        let got = blocking(&store, |s| s.get("t1")).await.unwrap();
        assert_eq!(got.status(), TaskStatus::Completed);

        let err = blocking(&store, |s| s.get("missing")).await.unwrap_err();
        assert!(matches!(err, AgentError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_busy_store_does_not_stall_runtime() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        store.save(&record("t1", TaskStatus::Completed)).unwrap();

        let held = store.conn.lock().unwrap();
        let lookup = tokio::spawn({
            let store = store.clone();
            async move { blocking(&store, |s| s.get("t1")).await }
        });

        // Timers keep firing while the lookup waits on the connection
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!lookup.is_finished());

        drop(held);
        let got = tokio::time::timeout(std::time::Duration::from_secs(2), lookup)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.id(), "t1");
    }
}
