//! 编排错误类型
//!
//! 步骤内的错误（执行 / 审阅 / 调用失败）被记录进 WorkflowState.error 并走 fail 路径，
//! 不会从公共入口抛出；这里的变体只在边界（未知任务、非暂停状态下 resume、持久化失败）返回。

use thiserror::Error;

use crate::roles::RoleError;
use crate::store::StoreError;
use crate::workflow::WorkflowError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 依赖图有环，构建期致命错误，永不重试
    #[error("Dependency cycle detected at work item '{0}'")]
    CycleDetected(String),

    #[error("Step '{node}' failed: {message}")]
    StepExecution { node: String, message: String },

    #[error("Milestone '{milestone_id}' exceeded max retries ({max_retries})")]
    MaxRetriesExceeded {
        milestone_id: String,
        max_retries: u32,
    },

    #[error("Strategy rethink failed: {0}")]
    RethinkFailed(String),

    /// 用户在断点处中止，区别于 StepExecution
    #[error("Aborted by user{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    AbortedByUser(Option<String>),

    /// 仍有待执行项但没有可运行项（依赖失败或数据异常）
    #[error("Work graph is stuck with {pending} pending item(s)")]
    StuckGraph { pending: usize },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task '{0}' is not paused at a breakpoint")]
    NotPaused(String),

    #[error("Task '{0}' has already finished")]
    AlreadyFinished(String),

    #[error("Task '{0}' already exists")]
    DuplicateTask(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<WorkflowError> for OrchestratorError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::CycleDetected(id) => OrchestratorError::CycleDetected(id),
        }
    }
}

/// 拆解阶段的角色错误：调用失败归为步骤错误，成环保持为 CycleDetected
impl From<RoleError> for OrchestratorError {
    fn from(err: RoleError) -> Self {
        match err {
            RoleError::Invoke(e) => OrchestratorError::StepExecution {
                node: "plan".to_string(),
                message: e.to_string(),
            },
            RoleError::InvalidPlan(reason) => OrchestratorError::InvalidPlan(reason),
            RoleError::Workflow(e) => e.into(),
        }
    }
}
