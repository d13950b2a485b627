//! 编排器：里程碑状态机的异步驱动
//!
//! 一个任务按离散、可恢复的步骤推进：
//! Plan -> ContextCheck -> SelectStrategy -> Execute -> Validate -> Breakpoint -> Advance -> ...，
//! 失败时进入 Recovery，任务结束时进入 Finalize。任一里程碑声明了依赖时，
//! ContextCheck 之后改走 Wave：按依赖图并发执行就绪的里程碑，整个波次结束后再计算下一波。
//!
//! 每一步结束后保存一份 WorkflowState 检查点；断点处步骤循环返回（不阻塞），
//! 由 resume_task 从最新检查点重新进入。取消是协作式的：每一步之前查询任务存储的状态。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorSection;
use crate::core::machine::{self, Transition};
use crate::core::{
    Milestone, MilestoneStatus, OrchestratorError, PauseController, ProgressReport, QaDecision,
    RecoveryOutcome, RecoveryPolicy, Step, Task, TaskStatus, WorkflowState,
};
use crate::llm::{Invocation, StrategySelector};
use crate::memory::{
    estimate_messages, CompactionOutcome, CompactionSnapshot, ContextBudgetPolicy, ContextCompactor,
    LongTermMemory, Message,
};
use crate::notification::{Event, EventPayload, NotificationBus};
use crate::roles::{Executor, Planner, Validator, Verdict};
use crate::store::{CheckpointStore, TaskStore};
use crate::workflow::{WaveRunner, WorkItem, WorkItemGraph, WorkflowError};

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_retries: u32,
    pub worker_pool_size: usize,
    pub default_max_context_tokens: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&OrchestratorSection::default())
    }
}

impl From<&OrchestratorSection> for OrchestratorSettings {
    fn from(section: &OrchestratorSection) -> Self {
        Self {
            max_retries: section.max_retries,
            worker_pool_size: section.worker_pool_size.max(1),
            default_max_context_tokens: section.default_max_context_tokens,
        }
    }
}

/// start_task 的输入
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: String,
    pub request: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// 未设置时使用 default_max_context_tokens
    pub max_context_tokens: Option<usize>,
    /// 启用后每个里程碑通过（波次模式下每个波次结束）时停在断点
    pub breakpoints: bool,
    /// 调用方指定的执行策略，总是优先于复杂度路由
    pub preferred_strategy: Option<String>,
}

impl TaskRequest {
    pub fn new(task_id: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            request: request.into(),
            session_id: None,
            user_id: None,
            max_context_tokens: None,
            breakpoints: false,
            preferred_strategy: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_max_context_tokens(mut self, max_tokens: usize) -> Self {
        self.max_context_tokens = Some(max_tokens);
        self
    }

    pub fn with_breakpoints(mut self, enabled: bool) -> Self {
        self.breakpoints = enabled;
        self
    }

    pub fn with_preferred_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.preferred_strategy = Some(strategy.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    Continue,
    Abort,
}

/// 断点处的用户答复
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResponse {
    pub action: ResumeAction,
    /// continue 时作为下一次执行的用户指导，abort 时作为中止理由
    pub feedback: Option<String>,
}

impl UserResponse {
    pub fn proceed() -> Self {
        Self {
            action: ResumeAction::Continue,
            feedback: None,
        }
    }

    pub fn proceed_with(feedback: impl Into<String>) -> Self {
        Self {
            action: ResumeAction::Continue,
            feedback: Some(feedback.into()),
        }
    }

    pub fn abort(reason: Option<String>) -> Self {
        Self {
            action: ResumeAction::Abort,
            feedback: reason,
        }
    }
}

enum StepOutcome {
    Continue,
    Paused,
    Finished,
}

/// 波次中单个里程碑子循环的结果
struct MilestoneRun {
    milestone: Milestone,
    messages: Vec<Message>,
    tokens: usize,
    error: Option<String>,
}

impl MilestoneRun {
    fn new(milestone: Milestone) -> Self {
        Self {
            milestone,
            messages: Vec::new(),
            tokens: 0,
            error: None,
        }
    }
}

pub struct Orchestrator {
    pub(crate) planner: Arc<Planner>,
    pub(crate) executor: Executor,
    pub(crate) validator: Validator,
    pub(crate) recovery: RecoveryPolicy,
    pub(crate) compactor: ContextCompactor,
    pub(crate) strategy: Arc<dyn StrategySelector>,
    pub(crate) long_term: Arc<dyn LongTermMemory>,
    pub(crate) task_store: Arc<dyn TaskStore>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) bus: Arc<NotificationBus>,
    pub(crate) pause: Arc<PauseController>,
    pub(crate) waves: WaveRunner,
    pub(crate) settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn pause_controller(&self) -> &Arc<PauseController> {
        &self.pause
    }

    pub fn task_store(&self) -> &Arc<dyn TaskStore> {
        &self.task_store
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 创建任务、拆解计划并运行到完成、失败或第一个断点
    pub async fn start_task(&self, request: TaskRequest) -> Result<WorkflowState, OrchestratorError> {
        if let Some(status) = self.task_store.get_status(&request.task_id).await? {
            return Err(if status.is_terminal() {
                OrchestratorError::AlreadyFinished(request.task_id)
            } else {
                OrchestratorError::DuplicateTask(request.task_id)
            });
        }

        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| format!("sess_{}", uuid::Uuid::new_v4()));
        let mut task = Task::new(&request.task_id, session_id, &request.request);
        task.user_id = request.user_id.clone();
        task.status = TaskStatus::InProgress;
        self.task_store.create_task(task.clone()).await?;

        let max_tokens = request
            .max_context_tokens
            .unwrap_or(self.settings.default_max_context_tokens);
        let mut state = WorkflowState::new(&task, max_tokens);
        state.pause_enabled = request.breakpoints;
        state.preferred_strategy = request.preferred_strategy.filter(|s| !s.trim().is_empty());
        state.current_context_tokens = estimate_messages(&state.messages);
        self.pause
            .set_pause_enabled(&task.id, state.pause_enabled)
            .await;

        tracing::info!(
            task_id = %task.id,
            session_id = %task.session_id,
            max_context_tokens = max_tokens,
            breakpoints = state.pause_enabled,
            "Task started"
        );
        self.emit(
            &state,
            EventPayload::TaskStarted {
                request: task.original_request.clone(),
            },
        )
        .await;
        self.checkpoints.save(&state)?;

        self.drive(state).await
    }

    /// 从断点继续或中止
    pub async fn resume_task(
        &self,
        task_id: &str,
        response: UserResponse,
    ) -> Result<WorkflowState, OrchestratorError> {
        let mut state = self.load_state(task_id)?;
        if state.workflow_complete {
            return Err(OrchestratorError::AlreadyFinished(task_id.to_string()));
        }
        if state.pending_breakpoint.take().is_none() {
            return Err(OrchestratorError::NotPaused(task_id.to_string()));
        }

        // 进程重启后控制器里没有记录，按检查点恢复
        if !self.pause.is_tracked(task_id).await {
            self.pause.set_pause_enabled(task_id, state.pause_enabled).await;
        }
        self.pause.set_paused_at(task_id, None).await;

        let feedback = response.feedback.filter(|f| !f.trim().is_empty());
        match response.action {
            ResumeAction::Continue => {
                tracing::info!(task_id, has_feedback = feedback.is_some(), "Task resumed");
                if let Some(fb) = &feedback {
                    let message = Message::user(format!("User feedback: {fb}"));
                    state.current_context_tokens += message.estimated_tokens();
                    state.messages.push(message);
                }
                state.user_feedback = feedback.clone();
                self.emit(&state, EventPayload::TaskResumed { feedback }).await;
            }
            ResumeAction::Abort => {
                let err = OrchestratorError::AbortedByUser(feedback.clone());
                tracing::info!(task_id, reason = ?feedback, "Task aborted at breakpoint");
                // 断点前的里程碑已经通过审阅，计入部分结果
                if state.qa_decision.take() == Some(QaDecision::Pass) {
                    if let Some(m) = state.current_milestone_mut() {
                        m.status = MilestoneStatus::Passed;
                        m.completed_at = Some(Utc::now());
                    }
                }
                state.record_error(Step::Breakpoint, err.to_string());
                machine::fail_task(&mut state);
                self.emit(&state, EventPayload::TaskAborted { reason: feedback })
                    .await;
            }
        }

        self.drive(state).await
    }

    /// 当前进度；停在断点时返回断点载荷
    pub async fn get_progress(&self, task_id: &str) -> Result<ProgressReport, OrchestratorError> {
        let state = self.load_state(task_id)?;
        Ok(state.pending_breakpoint.clone().unwrap_or_else(|| {
            ProgressReport::from_milestones(&state.milestones, state.current_milestone_index)
        }))
    }

    /// 最新检查点
    pub async fn get_state(&self, task_id: &str) -> Result<WorkflowState, OrchestratorError> {
        self.load_state(task_id)
    }

    /// 标记任务已取消；运行中的循环在下一步之前观察到，停在断点的任务在这里直接收尾
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let status = self
            .task_store
            .get_status(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if status.is_terminal() {
            return Err(OrchestratorError::AlreadyFinished(task_id.to_string()));
        }
        self.task_store
            .update_status(task_id, TaskStatus::Cancelled, None)
            .await?;
        tracing::info!(task_id, "Cancellation requested");

        if let Some(mut state) = self.checkpoints.load(task_id)? {
            if state.is_paused() {
                self.mark_cancelled(&mut state).await;
                self.persist(&mut state)?;
            }
        }
        Ok(())
    }

    /// 手动检查点压缩：不看阈值，写入 manual_checkpoint 快照
    ///
    /// 面向已暂停或已结束的任务；上下文为空时返回 None。
    pub async fn checkpoint_context(
        &self,
        task_id: &str,
        key_decisions: Option<serde_json::Value>,
    ) -> Result<Option<CompactionSnapshot>, OrchestratorError> {
        let mut state = self.load_state(task_id)?;
        let before = state.current_context_tokens;
        let outcome = self
            .compactor
            .checkpoint(task_id, &state.messages, state.max_context_tokens, key_decisions)
            .await
            .map_err(|e| OrchestratorError::StepExecution {
                node: "checkpoint_context".to_string(),
                message: e.to_string(),
            })?;
        let Some(outcome) = outcome else {
            return Ok(None);
        };
        let snapshot = outcome.snapshot.clone();
        self.apply_compaction(&mut state, outcome, before).await?;
        self.persist(&mut state)?;
        Ok(Some(snapshot))
    }

    fn load_state(&self, task_id: &str) -> Result<WorkflowState, OrchestratorError> {
        self.checkpoints
            .load(task_id)?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    fn persist(&self, state: &mut WorkflowState) -> Result<(), OrchestratorError> {
        state.step_count += 1;
        state.updated_at = Utc::now();
        self.checkpoints.save(state)?;
        Ok(())
    }

    async fn emit(&self, state: &WorkflowState, payload: EventPayload) {
        self.emit_for(&state.task_id, payload).await;
    }

    async fn emit_for(&self, task_id: &str, payload: EventPayload) {
        self.bus.emit(Event::new(task_id, payload)).await;
    }

    /// 步骤循环：每步之前检查取消，每步之后保存检查点
    async fn drive(&self, mut state: WorkflowState) -> Result<WorkflowState, OrchestratorError> {
        loop {
            if self.cancellation_requested(&state).await? {
                self.mark_cancelled(&mut state).await;
                self.persist(&mut state)?;
                return Ok(state);
            }

            tracing::debug!(task_id = %state.task_id, step = %state.next_step, "Running step");
            let outcome = self.run_step(&mut state).await?;
            self.persist(&mut state)?;

            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::Paused => {
                    tracing::info!(
                        task_id = %state.task_id,
                        milestone = state.current_milestone_index,
                        "Task paused at breakpoint"
                    );
                    return Ok(state);
                }
                StepOutcome::Finished => return Ok(state),
            }
        }
    }

    async fn cancellation_requested(&self, state: &WorkflowState) -> Result<bool, OrchestratorError> {
        let status = self.task_store.get_status(&state.task_id).await?;
        Ok(matches!(status, Some(s) if s.is_terminal()))
    }

    async fn mark_cancelled(&self, state: &mut WorkflowState) {
        tracing::info!(task_id = %state.task_id, step = %state.next_step, "Task cancelled");
        state.task_status = TaskStatus::Cancelled;
        state.workflow_complete = true;
        state.should_continue = false;
        state.pending_breakpoint = None;
        state.next_step = Step::Finalize;
        self.pause.cleanup(&state.task_id).await;
        self.emit(state, EventPayload::TaskCancelled).await;
    }

    async fn run_step(&self, state: &mut WorkflowState) -> Result<StepOutcome, OrchestratorError> {
        match state.next_step {
            Step::Plan => self.plan(state).await?,
            Step::ContextCheck => {
                self.check_context(state).await?;
                state.next_step = if state.wave_mode {
                    Step::Wave
                } else {
                    Step::SelectStrategy
                };
            }
            Step::SelectStrategy => self.select_strategy(state).await,
            Step::Execute => self.execute(state).await,
            Step::Validate => self.validate(state).await,
            Step::Breakpoint => return Ok(self.breakpoint(state).await),
            Step::Advance => self.advance(state).await,
            Step::Recovery => {
                if let RecoveryOutcome::Replanned { .. } = self.recovery.recover(state).await {
                    self.task_store
                        .save_milestones(&state.task_id, &state.milestones)
                        .await?;
                }
            }
            Step::Wave => return self.run_wave(state).await,
            Step::Finalize => {
                self.finalize(state).await?;
                return Ok(StepOutcome::Finished);
            }
        }
        Ok(StepOutcome::Continue)
    }

    /// 拆解失败（调用错误、无效计划、依赖成环）直接失败，不进入重规划
    async fn plan(&self, state: &mut WorkflowState) -> Result<(), OrchestratorError> {
        match self
            .planner
            .decompose(&state.original_request, state.user_id.as_deref())
            .await
        {
            Ok(milestones) => {
                state.install_plan(milestones);
                let outline = state
                    .milestones
                    .iter()
                    .map(|m| format!("{}. {} ({})", m.sequence_number, m.description, m.complexity))
                    .collect::<Vec<_>>()
                    .join("\n");
                let plan_message = Message::assistant(format!("Plan:\n{outline}"));
                state.current_context_tokens += plan_message.estimated_tokens();
                state.messages.push(plan_message);
                self.task_store
                    .save_milestones(&state.task_id, &state.milestones)
                    .await?;
                tracing::info!(
                    task_id = %state.task_id,
                    milestones = state.milestones.len(),
                    wave_mode = state.wave_mode,
                    "Plan created"
                );
                self.emit(
                    state,
                    EventPayload::PlanCreated {
                        milestones: state.milestones.len(),
                        wave_mode: state.wave_mode,
                    },
                )
                .await;
                state.next_step = Step::ContextCheck;
            }
            Err(e) => {
                let err = OrchestratorError::from(e);
                tracing::warn!(task_id = %state.task_id, error = %err, "Planning failed");
                state.record_error(Step::Plan, err.to_string());
                machine::fail_task(state);
            }
        }
        Ok(())
    }

    /// 超过阈值时压缩；压缩失败只记录告警，继续使用完整上下文
    async fn check_context(&self, state: &mut WorkflowState) -> Result<(), OrchestratorError> {
        let (current, max) = (state.current_context_tokens, state.max_context_tokens);
        if !ContextBudgetPolicy::should_compress(current, max) {
            return Ok(());
        }
        match self
            .compactor
            .compact(&state.task_id, &state.messages, current, max)
            .await
        {
            Ok(Some(outcome)) => self.apply_compaction(state, outcome, current).await?,
            Ok(None) => tracing::debug!(task_id = %state.task_id, "Nothing to compact"),
            Err(e) => tracing::warn!(
                task_id = %state.task_id,
                error = %e,
                "Context compaction failed, continuing with full context"
            ),
        }
        Ok(())
    }

    /// 先持久化快照与交接摘要，再缩短上下文
    async fn apply_compaction(
        &self,
        state: &mut WorkflowState,
        outcome: CompactionOutcome,
        tokens_before: usize,
    ) -> Result<(), OrchestratorError> {
        let CompactionOutcome {
            snapshot,
            messages,
            tokens_after,
        } = outcome;
        self.task_store.save_snapshot(snapshot.clone()).await?;
        self.task_store
            .save_handover_context(&state.task_id, &snapshot.summary)
            .await?;

        if messages != state.messages {
            state.messages = messages;
            state.current_context_tokens = tokens_after;
        }
        tracing::info!(
            task_id = %state.task_id,
            snapshot = %snapshot.id,
            tokens_before,
            tokens_after = state.current_context_tokens,
            summarized = snapshot.summarized_messages,
            "Context compacted"
        );
        self.emit(
            state,
            EventPayload::ContextCompacted {
                snapshot_id: snapshot.id,
                kind: snapshot.kind,
                tokens_before,
                tokens_after: state.current_context_tokens,
            },
        )
        .await;
        Ok(())
    }

    async fn select_strategy(&self, state: &mut WorkflowState) {
        if state.current_milestone().is_none() {
            machine::complete_task(state);
            return;
        }
        let preferred = state.preferred_strategy.clone();
        let attempt = state.retry_count + 1;
        let idx = state.current_milestone_index;
        let milestone = &mut state.milestones[idx];
        let strategy = self.strategy.select(milestone.complexity, preferred.as_deref());
        milestone.strategy = Some(strategy.clone());
        milestone.status = MilestoneStatus::InProgress;
        milestone.started_at.get_or_insert_with(Utc::now);

        tracing::info!(
            task_id = %state.task_id,
            milestone = %milestone.id,
            complexity = %milestone.complexity,
            strategy = %strategy,
            attempt,
            "Milestone started"
        );
        let payload = EventPayload::MilestoneStarted {
            milestone_id: milestone.id.clone(),
            complexity: milestone.complexity,
            strategy,
            attempt,
        };
        self.emit(state, payload).await;
        state.next_step = Step::Execute;
    }

    async fn execute(&self, state: &mut WorkflowState) {
        let idx = state.current_milestone_index;
        let prior = idx
            .checked_sub(1)
            .and_then(|i| state.milestones.get(i))
            .and_then(|m| m.output.clone());
        let milestone = state.milestones[idx].clone();

        match self
            .executor
            .execute(&milestone, prior, state.user_feedback.as_deref())
            .await
        {
            Ok((instruction, invocation)) => {
                state.user_feedback = None;
                let cost = self.record_output(&mut state.milestones[idx], &instruction, &invocation);
                state.messages.push(Message::user(instruction));
                state.messages.push(Message::assistant(invocation.content.clone()));
                state.current_context_tokens += invocation.total_tokens() as usize;
                self.emit(
                    state,
                    EventPayload::MilestoneExecuted {
                        milestone_id: milestone.id,
                        input_tokens: invocation.input_tokens,
                        output_tokens: invocation.output_tokens,
                        cost,
                    },
                )
                .await;
                state.next_step = Step::Validate;
            }
            Err(e) => {
                let err = OrchestratorError::StepExecution {
                    node: Step::Execute.to_string(),
                    message: e.to_string(),
                };
                tracing::warn!(task_id = %state.task_id, milestone = %milestone.id, error = %err, "Execution failed");
                state.record_error(Step::Execute, err.to_string());
                state.qa_decision = Some(QaDecision::Fail);
                state.next_step = Step::Advance;
            }
        }
    }

    async fn validate(&self, state: &mut WorkflowState) {
        let idx = state.current_milestone_index;
        let milestone = state.milestones[idx].clone();
        let output = milestone.output.clone().unwrap_or_default();

        match self.validator.validate(&milestone, &output).await {
            Ok((verdict, invocation)) => {
                let m = &mut state.milestones[idx];
                self.charge(m, &invocation);
                record_verdict(m, &verdict);
                state.current_context_tokens += invocation.total_tokens() as usize;
                if let Some(reason) = &verdict.replan_reason {
                    state.replan_reason = Some(reason.clone());
                    state.replan_count += 1;
                }
                if verdict.decision == QaDecision::Fail {
                    state.record_error(Step::Validate, rejection_message(&milestone, &verdict));
                }
                state.messages.push(Message::assistant(review_line(&verdict)));
                state.qa_decision = Some(verdict.decision);

                tracing::info!(
                    task_id = %state.task_id,
                    milestone = %milestone.id,
                    decision = %verdict.decision,
                    "QA decision"
                );
                self.emit(
                    state,
                    EventPayload::QaDecided {
                        milestone_id: milestone.id,
                        decision: verdict.decision,
                        feedback: verdict.feedback,
                    },
                )
                .await;
                state.next_step = Step::Breakpoint;
            }
            Err(e) => {
                let err = OrchestratorError::StepExecution {
                    node: Step::Validate.to_string(),
                    message: e.to_string(),
                };
                tracing::warn!(task_id = %state.task_id, milestone = %milestone.id, error = %err, "Validation failed");
                state.record_error(Step::Validate, err.to_string());
                state.qa_decision = Some(QaDecision::Fail);
                state.next_step = Step::Advance;
            }
        }
    }

    /// 里程碑通过且还有下一个时，若启用暂停则停在这里
    async fn breakpoint(&self, state: &mut WorkflowState) -> StepOutcome {
        state.next_step = Step::Advance;
        state.pause_enabled = self.pause.is_pause_enabled(&state.task_id).await;
        let idx = state.current_milestone_index;
        let has_next = idx + 1 < state.milestones.len();
        if !state.pause_enabled || !has_next || state.qa_decision != Some(QaDecision::Pass) {
            return StepOutcome::Continue;
        }

        let mut preview = state.milestones.clone();
        preview[idx].status = MilestoneStatus::Passed;
        let progress = ProgressReport::from_milestones(&preview, idx + 1);
        self.park(state, progress).await
    }

    async fn park(&self, state: &mut WorkflowState, progress: ProgressReport) -> StepOutcome {
        self.pause
            .set_paused_at(&state.task_id, Some(state.current_milestone_index))
            .await;
        state.pending_breakpoint = Some(progress.clone());
        self.emit(state, EventPayload::BreakpointReached { progress })
            .await;
        StepOutcome::Paused
    }

    async fn advance(&self, state: &mut WorkflowState) {
        let milestone_id = state
            .current_milestone()
            .map(|m| m.id.clone())
            .unwrap_or_default();
        let transition = machine::advance(state, self.settings.max_retries);
        tracing::debug!(task_id = %state.task_id, milestone = %milestone_id, ?transition, "Advanced");

        match transition {
            Transition::Next | Transition::Completed => {
                self.emit(state, EventPayload::MilestonePassed { milestone_id })
                    .await;
                if transition == Transition::Next {
                    state.next_step = Step::ContextCheck;
                }
            }
            Transition::Retry => {
                self.emit(
                    state,
                    EventPayload::MilestoneRetrying {
                        milestone_id,
                        retry_count: state.retry_count,
                    },
                )
                .await;
                state.next_step = Step::ContextCheck;
            }
            Transition::Recover | Transition::Failed => {
                tracing::warn!(task_id = %state.task_id, milestone = %milestone_id, error = ?state.error, "Milestone failed");
                self.emit(
                    state,
                    EventPayload::MilestoneFailed {
                        milestone_id,
                        error: state.error.clone(),
                    },
                )
                .await;
                if transition == Transition::Recover {
                    state.next_step = Step::Recovery;
                }
            }
        }
    }

    async fn run_wave(&self, state: &mut WorkflowState) -> Result<StepOutcome, OrchestratorError> {
        let mut graph = match build_graph(&state.milestones) {
            Ok(graph) => graph,
            Err(e) => {
                state.record_error(Step::Wave, OrchestratorError::from(e).to_string());
                escalate(state);
                return Ok(StepOutcome::Continue);
            }
        };

        let ready = graph.ready();
        if ready.is_empty() {
            self.settle_idle_graph(state, &graph).await;
            return Ok(StepOutcome::Continue);
        }

        tracing::info!(task_id = %state.task_id, wave = ?ready, "Wave started");
        self.emit(
            state,
            EventPayload::WaveStarted {
                milestone_ids: ready.clone(),
            },
        )
        .await;

        let by_id: HashMap<String, Milestone> = state
            .milestones
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect();
        let priors: HashMap<&str, Option<String>> = ready
            .iter()
            .map(|id| (id.as_str(), dependency_output(&by_id, id)))
            .collect();
        let user_feedback = state.user_feedback.take();
        let preferred = state.preferred_strategy.clone();
        let task_id = state.task_id.clone();

        let report = self
            .waves
            .run_wave(&mut graph, |id| {
                let milestone = by_id.get(&id).cloned();
                let prior = priors.get(id.as_str()).cloned().flatten();
                let (task_id, user_feedback, preferred) =
                    (task_id.as_str(), user_feedback.as_deref(), preferred.as_deref());
                async move {
                    match milestone {
                        Some(m) => {
                            self.run_milestone(task_id, m, prior, user_feedback, preferred)
                                .await
                        }
                        None => Err(None),
                    }
                }
            })
            .await;

        let (succeeded, failed) = (report.succeeded(), report.failed());
        let mut first_error: Option<String> = None;
        for (_, outcome) in report.outcomes {
            let run = match outcome {
                Ok(run) => run,
                Err(Some(run)) => {
                    if first_error.is_none() {
                        first_error = run.error.clone();
                    }
                    run
                }
                Err(None) => continue,
            };
            state.messages.extend(run.messages);
            state.current_context_tokens += run.tokens;
            if let Some(slot) = state
                .milestones
                .iter_mut()
                .find(|m| m.id == run.milestone.id)
            {
                *slot = run.milestone;
            }
        }
        state.current_milestone_index = state
            .milestones
            .iter()
            .position(|m| m.status != MilestoneStatus::Passed)
            .unwrap_or(state.milestones.len().saturating_sub(1));

        tracing::info!(task_id = %state.task_id, succeeded, failed, "Wave completed");
        self.emit(state, EventPayload::WaveCompleted { succeeded, failed })
            .await;

        if failed > 0 {
            state.record_error(
                Step::Wave,
                first_error.unwrap_or_else(|| "Milestone failed in wave".to_string()),
            );
            escalate(state);
            return Ok(StepOutcome::Continue);
        }
        if state
            .milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Passed)
        {
            machine::complete_task(state);
            return Ok(StepOutcome::Continue);
        }

        state.next_step = Step::ContextCheck;
        state.pause_enabled = self.pause.is_pause_enabled(&state.task_id).await;
        if state.pause_enabled {
            let progress =
                ProgressReport::from_milestones(&state.milestones, state.current_milestone_index);
            return Ok(self.park(state, progress).await);
        }
        Ok(StepOutcome::Continue)
    }

    /// 没有就绪项：全部通过则完成，否则报告阻塞并走失败分流
    async fn settle_idle_graph(&self, state: &mut WorkflowState, graph: &WorkItemGraph) {
        if state
            .milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Passed)
        {
            machine::complete_task(state);
            return;
        }

        let blocked = graph.blocked();
        let message = if blocked.is_empty() {
            let pending = graph.stats().pending;
            OrchestratorError::StuckGraph { pending }.to_string()
        } else {
            format!(
                "{} milestone(s) blocked by failed dependencies: {}",
                blocked.len(),
                blocked.join(", ")
            )
        };
        tracing::warn!(task_id = %state.task_id, blocked = ?blocked, error = %message, "Wave blocked");
        self.emit(
            state,
            EventPayload::WorkBlocked {
                milestone_ids: blocked,
            },
        )
        .await;
        state.record_error(Step::Wave, message);
        escalate(state);
    }

    /// 波次中单个里程碑的 select -> execute -> validate 子循环（重试上限与顺序模式相同）
    async fn run_milestone(
        &self,
        task_id: &str,
        mut milestone: Milestone,
        prior: Option<String>,
        user_feedback: Option<&str>,
        preferred: Option<&str>,
    ) -> Result<MilestoneRun, Option<MilestoneRun>> {
        let mut messages = Vec::new();
        let mut tokens = 0usize;
        let max_retries = self.settings.max_retries;

        loop {
            let strategy = self.strategy.select(milestone.complexity, preferred);
            milestone.strategy = Some(strategy.clone());
            milestone.status = MilestoneStatus::InProgress;
            milestone.started_at.get_or_insert_with(Utc::now);
            self.emit_for(
                task_id,
                EventPayload::MilestoneStarted {
                    milestone_id: milestone.id.clone(),
                    complexity: milestone.complexity,
                    strategy,
                    attempt: milestone.retry_count + 1,
                },
            )
            .await;

            let (instruction, invocation) = match self
                .executor
                .execute(&milestone, prior.clone(), user_feedback)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    let message = OrchestratorError::StepExecution {
                        node: Step::Execute.to_string(),
                        message: e.to_string(),
                    }
                    .to_string();
                    let run = MilestoneRun { messages, tokens, ..MilestoneRun::new(milestone) };
                    return Err(Some(self.fail_run(task_id, run, message).await));
                }
            };
            let cost = self.record_output(&mut milestone, &instruction, &invocation);
            messages.push(Message::user(instruction));
            messages.push(Message::assistant(invocation.content.clone()));
            tokens += invocation.total_tokens() as usize;
            self.emit_for(
                task_id,
                EventPayload::MilestoneExecuted {
                    milestone_id: milestone.id.clone(),
                    input_tokens: invocation.input_tokens,
                    output_tokens: invocation.output_tokens,
                    cost,
                },
            )
            .await;

            let (verdict, review) = match self
                .validator
                .validate(&milestone, &invocation.content)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    let message = OrchestratorError::StepExecution {
                        node: Step::Validate.to_string(),
                        message: e.to_string(),
                    }
                    .to_string();
                    let run = MilestoneRun { messages, tokens, ..MilestoneRun::new(milestone) };
                    return Err(Some(self.fail_run(task_id, run, message).await));
                }
            };
            self.charge(&mut milestone, &review);
            record_verdict(&mut milestone, &verdict);
            tokens += review.total_tokens() as usize;
            messages.push(Message::assistant(review_line(&verdict)));
            self.emit_for(
                task_id,
                EventPayload::QaDecided {
                    milestone_id: milestone.id.clone(),
                    decision: verdict.decision,
                    feedback: verdict.feedback.clone(),
                },
            )
            .await;

            match verdict.decision {
                QaDecision::Pass => {
                    milestone.status = MilestoneStatus::Passed;
                    milestone.completed_at = Some(Utc::now());
                    self.emit_for(
                        task_id,
                        EventPayload::MilestonePassed {
                            milestone_id: milestone.id.clone(),
                        },
                    )
                    .await;
                    return Ok(MilestoneRun { messages, tokens, ..MilestoneRun::new(milestone) });
                }
                QaDecision::Fail => {
                    let message = rejection_message(&milestone, &verdict);
                    let run = MilestoneRun { messages, tokens, ..MilestoneRun::new(milestone) };
                    return Err(Some(self.fail_run(task_id, run, message).await));
                }
                QaDecision::Retry => {
                    milestone.retry_count += 1;
                    if milestone.retry_count > max_retries {
                        let message = OrchestratorError::MaxRetriesExceeded {
                            milestone_id: milestone.id.clone(),
                            max_retries,
                        }
                        .to_string();
                        let run = MilestoneRun { messages, tokens, ..MilestoneRun::new(milestone) };
                        return Err(Some(self.fail_run(task_id, run, message).await));
                    }
                    self.emit_for(
                        task_id,
                        EventPayload::MilestoneRetrying {
                            milestone_id: milestone.id.clone(),
                            retry_count: milestone.retry_count,
                        },
                    )
                    .await;
                }
            }
        }
    }

    async fn fail_run(&self, task_id: &str, mut run: MilestoneRun, message: String) -> MilestoneRun {
        tracing::warn!(task_id, milestone = %run.milestone.id, error = %message, "Milestone failed");
        run.milestone.status = MilestoneStatus::Failed;
        run.milestone.completed_at = Some(Utc::now());
        self.emit_for(
            task_id,
            EventPayload::MilestoneFailed {
                milestone_id: run.milestone.id.clone(),
                error: Some(message.clone()),
            },
        )
        .await;
        run.error = Some(message);
        run
    }

    /// 记录执行产出与 token / 成本，返回本次成本
    fn record_output(&self, milestone: &mut Milestone, instruction: &str, invocation: &Invocation) -> f64 {
        milestone.instruction = Some(instruction.to_string());
        milestone.output = Some(invocation.content.clone());
        self.charge(milestone, invocation)
    }

    fn charge(&self, milestone: &mut Milestone, invocation: &Invocation) -> f64 {
        let strategy = milestone.strategy.as_deref().unwrap_or_default();
        let cost = self
            .strategy
            .estimate_cost(strategy, invocation.input_tokens, invocation.output_tokens);
        milestone.input_tokens += invocation.input_tokens;
        milestone.output_tokens += invocation.output_tokens;
        milestone.cost += cost;
        cost
    }

    async fn finalize(&self, state: &mut WorkflowState) -> Result<(), OrchestratorError> {
        state.pending_breakpoint = None;
        state.workflow_complete = true;
        state.should_continue = false;
        if !state.task_status.is_terminal() {
            state.task_status = TaskStatus::Failed;
        }

        self.task_store
            .save_milestones(&state.task_id, &state.milestones)
            .await?;
        self.task_store
            .update_status(&state.task_id, state.task_status, state.final_result.clone())
            .await?;
        self.pause.cleanup(&state.task_id).await;

        if state.task_status == TaskStatus::Completed {
            if let Some(user_id) = state.user_id.as_deref() {
                if self.long_term.enabled() {
                    self.long_term.add(
                        user_id,
                        &format!(
                            "Completed request: {} ({} milestones)",
                            state.original_request,
                            state.milestones.len()
                        ),
                    );
                }
            }
            let total_cost = state.total_cost();
            tracing::info!(
                task_id = %state.task_id,
                milestones = state.milestones.len(),
                total_cost,
                "Task completed"
            );
            self.emit(
                state,
                EventPayload::TaskCompleted {
                    result: state.final_result.clone(),
                    total_cost,
                },
            )
            .await;
        } else {
            let error = state
                .failure_context
                .as_ref()
                .map(|c| c.final_error.clone())
                .or_else(|| state.error.clone())
                .unwrap_or_else(|| "Unknown failure".to_string());
            tracing::warn!(task_id = %state.task_id, error = %error, "Task failed");
            self.emit(state, EventPayload::TaskFailed { error }).await;
        }
        Ok(())
    }
}

/// 波次失败后的分流：可恢复则进入 Recovery，否则 fail_task 已切到 Finalize
fn escalate(state: &mut WorkflowState) {
    if machine::route_failure(state) == Transition::Recover {
        state.next_step = Step::Recovery;
    }
}

/// 里程碑状态映射到图节点；中断在 in_progress 的里程碑重新执行
fn build_graph(milestones: &[Milestone]) -> Result<WorkItemGraph, WorkflowError> {
    use crate::workflow::WorkItemStatus;

    WorkItemGraph::new(milestones.iter().map(|m| {
        let status = match m.status {
            MilestoneStatus::Passed => WorkItemStatus::Completed,
            MilestoneStatus::Failed => WorkItemStatus::Failed,
            MilestoneStatus::Pending | MilestoneStatus::InProgress => WorkItemStatus::Pending,
        };
        WorkItem::new(m.id.clone())
            .depends_on(m.depends_on.clone())
            .with_status(status)
    }))
}

/// 依赖的产出按计划顺序拼接，作为 prior_output
fn dependency_output(by_id: &HashMap<String, Milestone>, id: &str) -> Option<String> {
    let milestone = by_id.get(id)?;
    let outputs: Vec<&str> = milestone
        .depends_on
        .iter()
        .filter_map(|dep| by_id.get(dep))
        .filter_map(|dep| dep.output.as_deref())
        .collect();
    if outputs.is_empty() {
        None
    } else {
        Some(outputs.join("\n\n"))
    }
}

/// 未通过时把审阅反馈存进里程碑，供下一次执行使用
fn record_verdict(milestone: &mut Milestone, verdict: &Verdict) {
    if verdict.decision != QaDecision::Pass {
        if let Some(feedback) = &verdict.feedback {
            milestone.feedback.push(feedback.clone());
        }
    }
}

fn rejection_message(milestone: &Milestone, verdict: &Verdict) -> String {
    verdict
        .feedback
        .clone()
        .unwrap_or_else(|| format!("Validator rejected milestone {}", milestone.sequence_number))
}

fn review_line(verdict: &Verdict) -> String {
    match &verdict.feedback {
        Some(feedback) => format!("[review] {}: {}", verdict.decision, feedback),
        None => format!("[review] {}", verdict.decision),
    }
}
