//! 检查点存储：每个任务每一步一份序列化的 WorkflowState
//!
//! 键为 (task_id, step_count)；load 返回最新一步，足以在进程重启后继续而无需重放。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::WorkflowState;
use crate::store::StoreError;

pub trait CheckpointStore: Send + Sync {
    /// 同一 (task_id, step_count) 重复保存时覆盖
    fn save(&self, state: &WorkflowState) -> Result<(), StoreError>;

    /// 最新检查点
    fn load(&self, task_id: &str) -> Result<Option<WorkflowState>, StoreError>;

    fn load_step(&self, task_id: &str, step: u64) -> Result<Option<WorkflowState>, StoreError>;

    /// 已保存的步骤号（升序）
    fn steps(&self, task_id: &str) -> Result<Vec<u64>, StoreError>;

    /// 删除任务的全部检查点，返回删除条数
    fn delete(&self, task_id: &str) -> Result<usize, StoreError>;
}

/// 内存实现（保存 JSON 文本，与 SQLite 行为一致）
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<HashMap<String, BTreeMap<u64, String>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        inner
            .entry(state.task_id.clone())
            .or_default()
            .insert(state.step_count, json);
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        inner
            .get(task_id)
            .and_then(|steps| steps.values().next_back())
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .transpose()
    }

    fn load_step(&self, task_id: &str, step: u64) -> Result<Option<WorkflowState>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        inner
            .get(task_id)
            .and_then(|steps| steps.get(&step))
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .transpose()
    }

    fn steps(&self, task_id: &str) -> Result<Vec<u64>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner
            .get(task_id)
            .map(|steps| steps.keys().copied().collect())
            .unwrap_or_default())
    }

    fn delete(&self, task_id: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.remove(task_id).map(|s| s.len()).unwrap_or(0))
    }
}

/// SQLite 实现
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteCheckpointStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        Self::init_schema(&conn)?;
        tracing::info!(path = %db_path.display(), "Checkpoint store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                task_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (task_id, step)
            );
            ",
        )?;
        Ok(())
    }

    fn decode(json: Option<String>) -> Result<Option<WorkflowState>, StoreError> {
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO workflow_checkpoints (task_id, step, state_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &state.task_id,
                state.step_count as i64,
                json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM workflow_checkpoints WHERE task_id = ?1 ORDER BY step DESC LIMIT 1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        Self::decode(json)
    }

    fn load_step(&self, task_id: &str, step: u64) -> Result<Option<WorkflowState>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM workflow_checkpoints WHERE task_id = ?1 AND step = ?2",
                params![task_id, step as i64],
                |row| row.get(0),
            )
            .optional()?;
        Self::decode(json)
    }

    fn steps(&self, task_id: &str) -> Result<Vec<u64>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt =
            conn.prepare("SELECT step FROM workflow_checkpoints WHERE task_id = ?1 ORDER BY step ASC")?;
        let rows = stmt.query_map(params![task_id], |row| row.get::<_, i64>(0))?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row? as u64);
        }
        Ok(steps)
    }

    fn delete(&self, task_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let n = conn.execute(
            "DELETE FROM workflow_checkpoints WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Task;

    fn state_at(task_id: &str, step: u64) -> WorkflowState {
        let mut state = WorkflowState::new(&Task::new(task_id, "s", "req"), 1000);
        state.step_count = step;
        state.current_milestone_index = step as usize;
        state
    }

    fn exercise(store: &dyn CheckpointStore) {
        assert!(store.load("t1").unwrap().is_none());

        store.save(&state_at("t1", 1)).unwrap();
        store.save(&state_at("t1", 3)).unwrap();
        store.save(&state_at("t1", 2)).unwrap();
        store.save(&state_at("t2", 7)).unwrap();

        let latest = store.load("t1").unwrap().unwrap();
        assert_eq!(latest.step_count, 3);
        assert_eq!(store.steps("t1").unwrap(), vec![1, 2, 3]);
        assert_eq!(
            store.load_step("t1", 2).unwrap().unwrap().current_milestone_index,
            2
        );

        let mut replaced = state_at("t1", 3);
        replaced.current_milestone_index = 42;
        store.save(&replaced).unwrap();
        assert_eq!(store.load("t1").unwrap().unwrap().current_milestone_index, 42);

        assert_eq!(store.delete("t1").unwrap(), 3);
        assert!(store.load("t1").unwrap().is_none());
        assert_eq!(store.load("t2").unwrap().unwrap().step_count, 7);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryCheckpointStore::new());
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteCheckpointStore::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoints.db");
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.save(&state_at("t1", 5)).unwrap();
        }
        let store = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(store.load("t1").unwrap().unwrap().step_count, 5);
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
