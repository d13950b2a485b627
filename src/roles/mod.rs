//! 角色层：Planner（拆解 / 重规划）、Executor（执行指令）、Validator（审阅判定）

pub mod executor;
pub mod planner;
pub mod validator;

use thiserror::Error;

use crate::llm::InvokeError;
use crate::workflow::WorkflowError;

pub use executor::Executor;
pub use planner::{extract_json, materialize, parse_plan, Plan, PlannedMilestone, Planner, MAX_MEMORY_HITS};
pub use validator::{parse_verdict, Validator, Verdict};

/// 角色调用错误
#[derive(Error, Debug)]
pub enum RoleError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}
