//! 断点控制器：按任务记录「是否启用暂停」与「停在第几步」
//!
//! 只回答「这里该不该停」；挂起与恢复由 Orchestrator 的步骤循环负责。
//! 多个任务循环共享同一实例，内部用 RwLock 保护。

use std::collections::HashMap;

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Default)]
struct PauseEntry {
    enabled: bool,
    paused_at: Option<usize>,
}

#[derive(Debug, Default)]
pub struct PauseController {
    entries: RwLock<HashMap<String, PauseEntry>>,
}

impl PauseController {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_pause_enabled(&self, task_id: &str, enabled: bool) {
        let mut entries = self.entries.write().await;
        entries.entry(task_id.to_string()).or_default().enabled = enabled;
    }

    /// 未登记的任务返回 false
    pub async fn is_pause_enabled(&self, task_id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(task_id)
            .map(|e| e.enabled)
            .unwrap_or(false)
    }

    /// None 清除标记；未登记的任务为空操作
    pub async fn set_paused_at(&self, task_id: &str, step_index: Option<usize>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(task_id) {
            entry.paused_at = step_index;
        }
    }

    /// 仅当记录的步骤与 step_index 完全相等时为 true
    pub async fn is_paused_at(&self, task_id: &str, step_index: usize) -> bool {
        self.entries
            .read()
            .await
            .get(task_id)
            .and_then(|e| e.paused_at)
            == Some(step_index)
    }

    pub async fn paused_at(&self, task_id: &str) -> Option<usize> {
        self.entries.read().await.get(task_id).and_then(|e| e.paused_at)
    }

    /// 是否已登记（进程重启后为 false）
    pub async fn is_tracked(&self, task_id: &str) -> bool {
        self.entries.read().await.contains_key(task_id)
    }

    /// 任务进入终态后调用，移除全部记录
    pub async fn cleanup(&self, task_id: &str) {
        self.entries.write().await.remove(task_id);
    }

    pub async fn tracked_tasks(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_for_unknown_task() {
        let pc = PauseController::new();
        assert!(!pc.is_pause_enabled("t").await);
        assert!(!pc.is_paused_at("t", 0).await);
        pc.set_paused_at("t", Some(3)).await;
        assert!(!pc.is_paused_at("t", 3).await);
        assert_eq!(pc.tracked_tasks().await, 0);
    }

    #[tokio::test]
    async fn test_paused_at_exact_match() {
        let pc = PauseController::new();
        pc.set_pause_enabled("t", true).await;
        pc.set_paused_at("t", Some(2)).await;
        assert!(pc.is_paused_at("t", 2).await);
        assert!(!pc.is_paused_at("t", 1).await);
        assert!(!pc.is_paused_at("t", 3).await);

        pc.set_paused_at("t", None).await;
        assert!(!pc.is_paused_at("t", 2).await);
        assert!(pc.is_pause_enabled("t").await);
    }

    #[tokio::test]
    async fn test_cleanup_clears_every_index() {
        let pc = PauseController::new();
        pc.set_pause_enabled("t", true).await;
        for i in 0..5 {
            pc.set_paused_at("t", Some(i)).await;
        }
        assert!(pc.is_tracked("t").await);
        pc.cleanup("t").await;
        assert!(!pc.is_tracked("t").await);
        for i in 0..5 {
            assert!(!pc.is_paused_at("t", i).await);
        }
        assert!(!pc.is_pause_enabled("t").await);
    }

    #[tokio::test]
    async fn test_tasks_are_independent() {
        let pc = PauseController::new();
        pc.set_pause_enabled("a", true).await;
        pc.set_pause_enabled("b", false).await;
        pc.set_paused_at("a", Some(1)).await;
        assert!(pc.is_paused_at("a", 1).await);
        assert!(!pc.is_paused_at("b", 1).await);
        assert!(!pc.is_pause_enabled("b").await);
    }
}
