//! 工作项类型定义
//!
//! 定义依赖图中的节点、状态、统计与错误类型

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type WorkItemId = String;

/// 工作项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// 等待依赖满足
    Pending,
    /// 正在执行
    InProgress,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

/// 依赖图中的节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// 工作项 ID
    pub id: WorkItemId,
    /// 依赖的工作项 ID（不存在于图中的 ID 视为已满足）
    pub dependencies: Vec<WorkItemId>,
    /// 当前状态
    pub status: WorkItemStatus,
}

impl WorkItem {
    pub fn new(id: impl Into<WorkItemId>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            status: WorkItemStatus::Pending,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<WorkItemId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: WorkItemStatus) -> Self {
        self.status = status;
        self
    }
}

/// 按状态统计（用于可观测性）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// 当前 ready() 的数量
    pub ready: usize,
}

/// 工作流错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Cyclic dependency detected at work item '{0}'")]
    CycleDetected(WorkItemId),
}
