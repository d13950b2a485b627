//! 恢复策略：每个任务至多一次策略级重规划
//!
//! 第一次终态失败时调用 Planner::rethink（带失败方案摘要与去重后的失败原因），
//! 成功则替换里程碑并从头继续；rethink 失败或已经重规划过则失败关闭，生成 FailureContext。

use std::sync::Arc;

use crate::core::machine::fail_task;
use crate::core::{Milestone, OrchestratorError, Step, WorkflowState};
use crate::memory::Message;
use crate::notification::{Event, EventPayload, NotificationBus};
use crate::roles::Planner;

/// 恢复结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// 已换上新计划，继续执行
    Replanned { milestones: usize },
    /// 已失败关闭
    Failed,
}

pub struct RecoveryPolicy {
    planner: Arc<Planner>,
    bus: Arc<NotificationBus>,
}

impl RecoveryPolicy {
    pub fn new(planner: Arc<Planner>, bus: Arc<NotificationBus>) -> Self {
        Self { planner, bus }
    }

    /// 失败方案摘要：每行 "N. description [status]"
    pub fn failed_approach_summary(milestones: &[Milestone]) -> String {
        milestones
            .iter()
            .map(|m| format!("{}. {} [{}]", m.sequence_number, m.description, m.status))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 当前错误、审阅反馈、重规划理由，按出现顺序去重
    pub fn collect_reasons(state: &WorkflowState) -> Vec<String> {
        let candidates = state
            .error
            .iter()
            .chain(state.milestones.iter().flat_map(|m| m.feedback.iter()))
            .chain(state.replan_reason.iter());

        let mut reasons: Vec<String> = Vec::new();
        for reason in candidates {
            let reason = reason.trim();
            if !reason.is_empty() && !reasons.iter().any(|r| r == reason) {
                reasons.push(reason.to_string());
            }
        }
        if reasons.is_empty() {
            reasons.push("Unknown failure".to_string());
        }
        reasons
    }

    pub async fn recover(&self, state: &mut WorkflowState) -> RecoveryOutcome {
        if state.strategy_retry_attempted {
            tracing::info!(task_id = %state.task_id, "Replan already used, failing task");
            fail_task(state);
            return RecoveryOutcome::Failed;
        }

        let reasons = Self::collect_reasons(state);
        let summary = Self::failed_approach_summary(&state.milestones);
        self.emit(state, EventPayload::RecoveryStarted {
            reasons: reasons.clone(),
        })
        .await;
        tracing::info!(
            task_id = %state.task_id,
            reasons = reasons.len(),
            "Attempting strategy-level replan"
        );

        state.strategy_retry_attempted = true;
        match self
            .planner
            .rethink(&state.original_request, &summary, &reasons)
            .await
        {
            Ok(milestones) => {
                let count = milestones.len();
                state.install_plan(milestones);
                state.clear_error();
                state.replan_reason = None;
                state.should_continue = true;
                state.workflow_complete = false;
                state.next_step = Step::ContextCheck;
                state.messages.push(Message::system(format!(
                    "Previous approach failed; continuing with a new plan of {count} milestone(s).\n{}",
                    Self::failed_approach_summary(&state.milestones)
                )));
                self.emit(state, EventPayload::RecoveryCompleted { milestones: count })
                    .await;
                RecoveryOutcome::Replanned { milestones: count }
            }
            Err(e) => {
                let err = OrchestratorError::RethinkFailed(e.to_string());
                tracing::warn!(task_id = %state.task_id, error = %err, "Recovery failed");
                self.emit(state, EventPayload::RecoveryFailed {
                    error: err.to_string(),
                })
                .await;
                if state.error.is_none() {
                    state.record_error(Step::Recovery, err.to_string());
                }
                fail_task(state);
                RecoveryOutcome::Failed
            }
        }
    }

    async fn emit(&self, state: &WorkflowState, payload: EventPayload) {
        self.bus.emit(Event::new(state.task_id.clone(), payload)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Complexity, MilestoneStatus, Task, TaskStatus};
    use crate::llm::{CapabilityRole, InvokeError, ScriptedInvoker};
    use crate::notification::{EventCollector, EventKind};

    fn failed_state() -> WorkflowState {
        let mut state = WorkflowState::new(&Task::new("t1", "s1", "build a cli"), 100_000);
        let mut a = Milestone::new("a", 1, "parse args", Complexity::Simple);
        a.status = MilestoneStatus::Passed;
        a.output = Some("args parsed".into());
        let mut b = Milestone::new("b", 2, "render output", Complexity::Moderate);
        b.status = MilestoneStatus::Failed;
        b.feedback = vec!["wrong format".into(), "wrong format".into()];
        state.install_plan(vec![a, b]);
        state.current_milestone_index = 1;
        state.retry_count = 4;
        state.record_error(Step::Advance, "retries exhausted");
        state
    }

    async fn policy(invoker: Arc<ScriptedInvoker>) -> (RecoveryPolicy, Arc<EventCollector>) {
        let bus = Arc::new(NotificationBus::new());
        let collector = Arc::new(EventCollector::new());
        bus.subscribe_all(collector.clone()).await;
        (
            RecoveryPolicy::new(Arc::new(Planner::new(invoker)), bus),
            collector,
        )
    }

    #[test]
    fn test_summary_and_reasons() {
        let mut state = failed_state();
        state.replan_reason = Some("wrong library".into());
        assert_eq!(
            RecoveryPolicy::failed_approach_summary(&state.milestones),
            "1. parse args [passed]\n2. render output [failed]"
        );
        assert_eq!(
            RecoveryPolicy::collect_reasons(&state),
            vec!["retries exhausted", "wrong format", "wrong library"]
        );

        let empty = WorkflowState::new(&Task::new("t", "s", "r"), 10);
        assert_eq!(RecoveryPolicy::collect_reasons(&empty), vec!["Unknown failure"]);
    }

    #[tokio::test]
    async fn test_successful_replan_resets_counters() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.push(
            CapabilityRole::Planner,
            r#"{"milestones": [{"description": "use a template engine", "complexity": "moderate"}]}"#,
        );
        let (policy, events) = policy(invoker.clone()).await;
        let mut state = failed_state();
        state.replan_count = 2;

        let outcome = policy.recover(&mut state).await;
        assert_eq!(outcome, RecoveryOutcome::Replanned { milestones: 1 });
        assert!(state.strategy_retry_attempted);
        assert_eq!(state.current_milestone_index, 0);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.replan_count, 0);
        assert!(state.error.is_none());
        assert!(!state.workflow_complete);
        assert_eq!(state.milestones[0].description, "use a template engine");
        assert_eq!(
            events.kinds(),
            vec![EventKind::RecoveryStarted, EventKind::RecoveryCompleted]
        );

        let call = &invoker.calls_for(CapabilityRole::Planner)[0];
        assert!(call.instruction.contains("2. render output [failed]"));
    }

    #[tokio::test]
    async fn test_rethink_failure_fails_closed() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.push_error(CapabilityRole::Planner, InvokeError::Timeout(30));
        let (policy, events) = policy(invoker).await;
        let mut state = failed_state();

        assert_eq!(policy.recover(&mut state).await, RecoveryOutcome::Failed);
        assert!(state.workflow_complete);
        assert!(state.strategy_retry_attempted);
        assert_eq!(state.task_status, TaskStatus::Failed);
        let ctx = state.failure_context.as_ref().unwrap();
        assert_eq!(ctx.final_error, "retries exhausted");
        assert_eq!(ctx.partial_results.len(), 1);
        assert_eq!(
            events.kinds(),
            vec![EventKind::RecoveryStarted, EventKind::RecoveryFailed]
        );
    }

    #[tokio::test]
    async fn test_second_failure_never_replans() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let (policy, events) = policy(invoker.clone()).await;
        let mut state = failed_state();
        state.strategy_retry_attempted = true;

        assert_eq!(policy.recover(&mut state).await, RecoveryOutcome::Failed);
        assert!(state.failure_context.is_some());
        assert!(invoker.calls().is_empty());
        assert!(events.kinds().is_empty());
    }
}
