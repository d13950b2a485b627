//! 持久化层：任务存储与 WorkflowState 检查点

pub mod checkpoint;
pub mod task_store;

use thiserror::Error;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use task_store::{MemoryTaskStore, TaskStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}
