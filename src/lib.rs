//! Hive - 里程碑编排核心
//!
//! 把一个请求拆解为有序（或带依赖）的里程碑，逐个执行、审阅、有界重试，
//! 失败时最多进行一次策略级重规划；每一步之后持久化检查点，可在断点处暂停并恢复。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态、状态机、断点、恢复、编排器主循环
//! - **llm**: 能力调用 trait、复杂度路由、Mock 实现
//! - **memory**: 上下文消息、Token 预算、上下文压缩、长期记忆
//! - **notification**: 编排事件与发布/订阅总线
//! - **observability**: tracing 初始化
//! - **roles**: Planner / Executor / Validator
//! - **store**: 任务存储与检查点存储（内存 / SQLite）
//! - **workflow**: 工作项依赖图与波次调度

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod notification;
pub mod observability;
pub mod roles;
pub mod store;
pub mod workflow;

pub use crate::core::{
    Orchestrator, OrchestratorBuilder, OrchestratorError, TaskRequest, UserResponse,
    WorkflowState,
};
