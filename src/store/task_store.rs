//! 任务存储：Task / Milestone / 交接上下文 / 压缩快照
//!
//! 编排器通过 get_status 观察外部取消；具体 ORM 与表结构不在本核心范围内，
//! MemoryTaskStore 供测试与单进程部署使用。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::core::{Milestone, Task, TaskStatus};
use crate::memory::CompactionSnapshot;
use crate::store::StoreError;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: Task) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    async fn get_status(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError>;

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        final_result: Option<String>,
    ) -> Result<(), StoreError>;

    async fn save_milestones(&self, task_id: &str, milestones: &[Milestone]) -> Result<(), StoreError>;

    async fn get_milestones(&self, task_id: &str) -> Result<Vec<Milestone>, StoreError>;

    /// 压缩后的摘要，供后续会话 / 接手者使用
    async fn save_handover_context(&self, task_id: &str, text: &str) -> Result<(), StoreError>;

    async fn handover_context(&self, task_id: &str) -> Result<Option<String>, StoreError>;

    async fn save_snapshot(&self, snapshot: CompactionSnapshot) -> Result<(), StoreError>;

    async fn list_snapshots(&self, task_id: &str) -> Result<Vec<CompactionSnapshot>, StoreError>;
}

#[derive(Default)]
struct TaskRecord {
    task: Option<Task>,
    milestones: Vec<Milestone>,
    handover: Option<String>,
    snapshots: Vec<CompactionSnapshot>,
}

#[derive(Default)]
pub struct MemoryTaskStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, task: Task) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let id = task.id.clone();
        records.entry(id).or_default().task = Some(task);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(task_id)
            .and_then(|r| r.task.clone()))
    }

    async fn get_status(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(task_id)
            .and_then(|r| r.task.as_ref())
            .map(|t| t.status))
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        final_result: Option<String>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let task = records
            .get_mut(task_id)
            .and_then(|r| r.task.as_mut())
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        task.status = status;
        if final_result.is_some() {
            task.final_result = final_result;
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn save_milestones(&self, task_id: &str, milestones: &[Milestone]) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.entry(task_id.to_string()).or_default().milestones = milestones.to_vec();
        Ok(())
    }

    async fn get_milestones(&self, task_id: &str) -> Result<Vec<Milestone>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(task_id)
            .map(|r| r.milestones.clone())
            .unwrap_or_default())
    }

    async fn save_handover_context(&self, task_id: &str, text: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.entry(task_id.to_string()).or_default().handover = Some(text.to_string());
        Ok(())
    }

    async fn handover_context(&self, task_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(task_id)
            .and_then(|r| r.handover.clone()))
    }

    async fn save_snapshot(&self, snapshot: CompactionSnapshot) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records
            .entry(snapshot.task_id.clone())
            .or_default()
            .snapshots
            .push(snapshot);
        Ok(())
    }

    async fn list_snapshots(&self, task_id: &str) -> Result<Vec<CompactionSnapshot>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(task_id)
            .map(|r| r.snapshots.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_round_trip() {
        let store = MemoryTaskStore::new();
        assert_eq!(store.get_status("t1").await.unwrap(), None);

        store.create_task(Task::new("t1", "s1", "req")).await.unwrap();
        assert_eq!(store.get_status("t1").await.unwrap(), Some(TaskStatus::Pending));

        store
            .update_status("t1", TaskStatus::Completed, Some("done".into()))
            .await
            .unwrap();
        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.final_result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_update_unknown_task_fails() {
        let store = MemoryTaskStore::new();
        let err = store
            .update_status("missing", TaskStatus::Cancelled, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_handover_keeps_latest() {
        let store = MemoryTaskStore::new();
        store.save_handover_context("t1", "first").await.unwrap();
        store.save_handover_context("t1", "second").await.unwrap();
        assert_eq!(
            store.handover_context("t1").await.unwrap().as_deref(),
            Some("second")
        );
    }
}
