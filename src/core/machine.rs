//! 里程碑状态机：QA 决策驱动的纯转移函数
//!
//! advance 只修改 WorkflowState 并返回转移结果，不做 I/O；
//! 事件发送、恢复调用、持久化都由 Orchestrator 根据 Transition 完成。

use chrono::Utc;

use crate::core::{FailureContext, MilestoneStatus, OrchestratorError, QaDecision, Step, TaskStatus, WorkflowState};

/// advance 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 当前里程碑通过，移动到下一个
    Next,
    /// 最后一个里程碑通过，任务完成
    Completed,
    /// 同一里程碑重新执行（带上累积反馈）
    Retry,
    /// 里程碑失败，仍可进行一次策略级重规划
    Recover,
    /// 任务失败（已生成 FailureContext）
    Failed,
}

/// 按当前 qa_decision 推进一步
///
/// 缺少 QA 决策时按 fail 处理。
pub fn advance(state: &mut WorkflowState, max_retries: u32) -> Transition {
    let decision = state.qa_decision.take().unwrap_or(QaDecision::Fail);
    match decision {
        QaDecision::Pass => pass_current(state),
        QaDecision::Retry => {
            state.retry_count += 1;
            let retry_count = state.retry_count;
            if let Some(m) = state.current_milestone_mut() {
                m.retry_count = retry_count;
            }
            if retry_count > max_retries {
                let milestone_id = state
                    .current_milestone()
                    .map(|m| m.id.clone())
                    .unwrap_or_default();
                let err = OrchestratorError::MaxRetriesExceeded {
                    milestone_id,
                    max_retries,
                };
                state.record_error(Step::Advance, err.to_string());
                fail_current(state)
            } else {
                state.should_continue = false;
                Transition::Retry
            }
        }
        QaDecision::Fail => fail_current(state),
    }
}

fn pass_current(state: &mut WorkflowState) -> Transition {
    if let Some(m) = state.current_milestone_mut() {
        m.status = MilestoneStatus::Passed;
        m.completed_at = Some(Utc::now());
    }
    state.retry_count = 0;
    state.clear_error();

    if state.current_milestone_index + 1 < state.milestones.len() {
        state.current_milestone_index += 1;
        state.should_continue = true;
        Transition::Next
    } else {
        complete_task(state);
        Transition::Completed
    }
}

fn fail_current(state: &mut WorkflowState) -> Transition {
    if let Some(m) = state.current_milestone_mut() {
        m.status = MilestoneStatus::Failed;
        m.completed_at = Some(Utc::now());
    }
    route_failure(state)
}

/// 失败分流：还没用过重规划则交给恢复，否则直接失败
pub fn route_failure(state: &mut WorkflowState) -> Transition {
    state.should_continue = false;
    if state.strategy_retry_attempted {
        fail_task(state);
        Transition::Failed
    } else {
        Transition::Recover
    }
}

pub fn complete_task(state: &mut WorkflowState) {
    state.task_status = TaskStatus::Completed;
    state.final_result = state.collect_final_result();
    state.workflow_complete = true;
    state.should_continue = false;
    state.next_step = Step::Finalize;
}

/// 失败关闭：生成 FailureContext 并进入终态
pub fn fail_task(state: &mut WorkflowState) {
    let final_error = state
        .error
        .clone()
        .unwrap_or_else(|| "Unknown failure".to_string());
    let ctx = FailureContext::from_state(state, final_error);
    state.final_result = Some(ctx.user_message());
    state.failure_context = Some(ctx);
    state.task_status = TaskStatus::Failed;
    state.workflow_complete = true;
    state.should_continue = false;
    state.next_step = Step::Finalize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Complexity, Milestone, Task};

    fn state_with(n: usize) -> WorkflowState {
        let task = Task::new("t1", "s1", "request");
        let mut state = WorkflowState::new(&task, 100_000);
        let milestones = (0..n)
            .map(|i| {
                Milestone::new(
                    format!("m{i}"),
                    i as u32 + 1,
                    format!("step {i}"),
                    Complexity::Simple,
                )
            })
            .collect();
        state.install_plan(milestones);
        state
    }

    #[test]
    fn test_pass_moves_forward_then_completes() {
        let mut state = state_with(2);
        state.qa_decision = Some(QaDecision::Pass);
        state.milestones[0].output = Some("a".into());
        assert_eq!(advance(&mut state, 3), Transition::Next);
        assert_eq!(state.current_milestone_index, 1);
        assert!(state.should_continue);
        assert!(!state.workflow_complete);

        state.qa_decision = Some(QaDecision::Pass);
        state.milestones[1].output = Some("b".into());
        assert_eq!(advance(&mut state, 3), Transition::Completed);
        assert!(state.workflow_complete);
        assert_eq!(state.task_status, TaskStatus::Completed);
        assert_eq!(state.passed_count(), 2);
        assert_eq!(state.final_result.as_deref(), Some("a\n\nb"));
    }

    #[test]
    fn test_pass_resets_retry_count() {
        let mut state = state_with(2);
        state.retry_count = 2;
        state.qa_decision = Some(QaDecision::Pass);
        advance(&mut state, 3);
        assert_eq!(state.retry_count, 0);
    }

    #[test]
    fn test_retry_escalates_after_max() {
        let mut state = state_with(1);
        for expected in 1..=3 {
            state.qa_decision = Some(QaDecision::Retry);
            assert_eq!(advance(&mut state, 3), Transition::Retry);
            assert_eq!(state.retry_count, expected);
            assert!(state.qa_decision.is_none());
            assert!(!state.should_continue);
        }

        state.qa_decision = Some(QaDecision::Retry);
        assert_eq!(advance(&mut state, 3), Transition::Recover);
        assert_eq!(state.milestones[0].status, MilestoneStatus::Failed);
        assert_ne!(state.milestones[0].status, MilestoneStatus::Passed);
        assert!(state.error.as_deref().unwrap().contains("exceeded max retries"));
        assert!(!state.workflow_complete);
    }

    #[test]
    fn test_fail_after_replan_produces_failure_context() {
        let mut state = state_with(1);
        state.strategy_retry_attempted = true;
        state.record_error(Step::Execute, "transport down");
        state.qa_decision = Some(QaDecision::Fail);

        assert_eq!(advance(&mut state, 3), Transition::Failed);
        assert!(state.workflow_complete);
        assert_eq!(state.task_status, TaskStatus::Failed);
        let ctx = state.failure_context.as_ref().unwrap();
        assert_eq!(ctx.final_error, "transport down");
        assert!(state.strategy_retry_attempted);
    }

    #[test]
    fn test_missing_decision_is_fail() {
        let mut state = state_with(1);
        assert_eq!(advance(&mut state, 3), Transition::Recover);
        assert_eq!(state.milestones[0].status, MilestoneStatus::Failed);
    }

    #[test]
    fn test_fail_without_error_reports_unknown() {
        let mut state = state_with(1);
        fail_task(&mut state);
        assert_eq!(
            state.failure_context.unwrap().final_error,
            "Unknown failure"
        );
    }
}
