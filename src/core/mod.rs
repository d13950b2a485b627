//! 核心编排层：状态与状态机、断点、恢复、步骤循环

pub mod builder;
pub mod error;
pub mod machine;
pub mod orchestrator;
pub mod pause;
pub mod progress;
pub mod recovery;
pub mod state;

pub use builder::OrchestratorBuilder;
pub use error::OrchestratorError;
pub use machine::Transition;
pub use orchestrator::{
    Orchestrator, OrchestratorSettings, ResumeAction, TaskRequest, UserResponse,
};
pub use pause::PauseController;
pub use progress::{GroupProgress, ProgressReport};
pub use recovery::{RecoveryOutcome, RecoveryPolicy};
pub use state::{
    AttemptedMilestone, Complexity, FailureContext, Milestone, MilestoneStatus, PartialResult,
    QaDecision, Step, Task, TaskStatus, WorkflowState,
};
