//! 状态定义：Task / Milestone / WorkflowState / FailureContext
//!
//! WorkflowState 是每一步之间传递、可序列化的完整状态，也是检查点的单位：
//! resume / retry / recovery 都从最新的 WorkflowState 重新进入步骤循环。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::ProgressReport;
use crate::memory::Message;

/// 复杂度等级（有序），用于选择执行策略 / 模型权重
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    ContextHeavy,
}

impl Complexity {
    pub fn all() -> [Complexity; 5] {
        [
            Complexity::Trivial,
            Complexity::Simple,
            Complexity::Moderate,
            Complexity::Complex,
            Complexity::ContextHeavy,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Trivial => "trivial",
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
            Complexity::ContextHeavy => "context_heavy",
        }
    }

    /// 序数 0..=4
    pub fn from_ordinal(n: u64) -> Option<Self> {
        Self::all().get(n as usize).copied()
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Complexity {
    type Err = String;

    /// 大小写不敏感，`-` 与 `_` 等价，也接受序数字符串
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "trivial" => Ok(Complexity::Trivial),
            "simple" => Ok(Complexity::Simple),
            "moderate" => Ok(Complexity::Moderate),
            "complex" => Ok(Complexity::Complex),
            "context_heavy" | "contextheavy" => Ok(Complexity::ContextHeavy),
            other => other
                .parse::<u64>()
                .ok()
                .and_then(Complexity::from_ordinal)
                .ok_or_else(|| format!("unknown complexity '{s}'")),
        }
    }
}

impl<'de> Deserialize<'de> for Complexity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Ordinal(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
            Raw::Ordinal(n) => Complexity::from_ordinal(n).ok_or_else(|| {
                serde::de::Error::custom(format!("complexity ordinal {n} out of range 0..=4"))
            }),
        }
    }
}

/// 任务状态；completed / failed / cancelled 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// 里程碑状态：pending -> in_progress -> {passed | failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Passed,
    Failed,
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::Passed => "passed",
            MilestoneStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// QA 决策
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaDecision {
    Pass,
    Retry,
    Fail,
}

impl fmt::Display for QaDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QaDecision::Pass => "pass",
            QaDecision::Retry => "retry",
            QaDecision::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// 一个用户请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub original_request: String,
    pub status: TaskStatus,
    pub final_result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        original_request: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: session_id.into(),
            user_id: None,
            original_request: original_request.into(),
            status: TaskStatus::Pending,
            final_result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 计划中的一个可执行单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    /// 从 1 开始
    pub sequence_number: u32,
    pub description: String,
    pub complexity: Complexity,
    pub acceptance_criteria: Vec<String>,
    /// 非空时任务进入波次调度
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 进度按组汇总
    #[serde(default)]
    pub group: Option<String>,
    pub status: MilestoneStatus,
    pub strategy: Option<String>,
    pub instruction: Option<String>,
    pub output: Option<String>,
    /// 累积的审阅反馈，下一次执行时带入
    #[serde(default)]
    pub feedback: Vec<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl Milestone {
    pub fn new(
        id: impl Into<String>,
        sequence_number: u32,
        description: impl Into<String>,
        complexity: Complexity,
    ) -> Self {
        Self {
            id: id.into(),
            sequence_number,
            description: description.into(),
            complexity,
            acceptance_criteria: Vec::new(),
            depends_on: Vec::new(),
            group: None,
            status: MilestoneStatus::Pending,
            strategy: None,
            instruction: None,
            output: None,
            feedback: Vec::new(),
            retry_count: 0,
            started_at: None,
            completed_at: None,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
        }
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// 已尝试的里程碑（失败报告用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptedMilestone {
    pub sequence_number: u32,
    pub description: String,
    pub status: MilestoneStatus,
}

/// 已通过里程碑的部分产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub milestone_id: String,
    pub description: String,
    pub output: Option<String>,
}

/// 恢复用尽后生成的失败报告，创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub original_request: String,
    pub attempted_milestones: Vec<AttemptedMilestone>,
    pub partial_results: Vec<PartialResult>,
    pub final_error: String,
    pub created_at: DateTime<Utc>,
}

impl FailureContext {
    pub fn from_state(state: &WorkflowState, final_error: impl Into<String>) -> Self {
        Self {
            original_request: state.original_request.clone(),
            attempted_milestones: state
                .milestones
                .iter()
                .map(|m| AttemptedMilestone {
                    sequence_number: m.sequence_number,
                    description: m.description.clone(),
                    status: m.status,
                })
                .collect(),
            partial_results: state
                .milestones
                .iter()
                .filter(|m| m.status == MilestoneStatus::Passed)
                .map(|m| PartialResult {
                    milestone_id: m.id.clone(),
                    description: m.description.clone(),
                    output: m.output.clone(),
                })
                .collect(),
            final_error: final_error.into(),
            created_at: Utc::now(),
        }
    }

    /// 面向用户的失败说明
    pub fn user_message(&self) -> String {
        let mut lines = vec![format!(
            "The task could not be completed: {}",
            self.final_error
        )];
        if !self.partial_results.is_empty() {
            lines.push(format!(
                "{} of {} milestone(s) were completed:",
                self.partial_results.len(),
                self.attempted_milestones.len()
            ));
            for r in &self.partial_results {
                lines.push(format!("- {}", r.description));
            }
        }
        lines.join("\n")
    }
}

/// 步骤循环中的下一步
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// 拆解请求
    Plan,
    ContextCheck,
    SelectStrategy,
    Execute,
    Validate,
    Breakpoint,
    Advance,
    Recovery,
    /// 按依赖图执行一个波次
    Wave,
    Finalize,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Plan => "plan",
            Step::ContextCheck => "context_check",
            Step::SelectStrategy => "select_strategy",
            Step::Execute => "execute",
            Step::Validate => "validate",
            Step::Breakpoint => "breakpoint",
            Step::Advance => "advance",
            Step::Recovery => "recovery",
            Step::Wave => "wave",
            Step::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤间传递的完整状态（检查点单位）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub task_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub original_request: String,

    pub milestones: Vec<Milestone>,
    pub current_milestone_index: usize,
    /// 任一里程碑声明了依赖时按波次调度
    pub wave_mode: bool,

    pub messages: Vec<Message>,
    pub current_context_tokens: usize,
    pub max_context_tokens: usize,

    pub retry_count: u32,
    pub replan_count: u32,
    pub replan_reason: Option<String>,
    pub qa_decision: Option<QaDecision>,
    pub error: Option<String>,
    /// 产生 error 的步骤
    pub error_node: Option<String>,

    pub pause_enabled: bool,
    /// 停在断点时的进度；存在即表示等待 resume
    pub pending_breakpoint: Option<ProgressReport>,
    /// resume 时用户给出的反馈，下一次执行时消费
    pub user_feedback: Option<String>,
    pub preferred_strategy: Option<String>,

    pub strategy_retry_attempted: bool,
    pub should_continue: bool,
    pub workflow_complete: bool,
    pub failure_context: Option<FailureContext>,

    pub task_status: TaskStatus,
    pub final_result: Option<String>,

    pub next_step: Step,
    pub step_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(task: &Task, max_context_tokens: usize) -> Self {
        Self {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            user_id: task.user_id.clone(),
            original_request: task.original_request.clone(),
            milestones: Vec::new(),
            current_milestone_index: 0,
            wave_mode: false,
            messages: vec![Message::user(task.original_request.clone())],
            current_context_tokens: 0,
            max_context_tokens,
            retry_count: 0,
            replan_count: 0,
            replan_reason: None,
            qa_decision: None,
            error: None,
            error_node: None,
            pause_enabled: false,
            pending_breakpoint: None,
            user_feedback: None,
            preferred_strategy: None,
            strategy_retry_attempted: false,
            should_continue: true,
            workflow_complete: false,
            failure_context: None,
            task_status: TaskStatus::InProgress,
            final_result: None,
            next_step: Step::Plan,
            step_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// 替换计划：重置索引与计数，并根据依赖声明决定调度模式
    pub fn install_plan(&mut self, milestones: Vec<Milestone>) {
        self.wave_mode = milestones.iter().any(|m| !m.depends_on.is_empty());
        self.milestones = milestones;
        self.current_milestone_index = 0;
        self.retry_count = 0;
        self.replan_count = 0;
        self.qa_decision = None;
    }

    pub fn current_milestone(&self) -> Option<&Milestone> {
        self.milestones.get(self.current_milestone_index)
    }

    pub fn current_milestone_mut(&mut self) -> Option<&mut Milestone> {
        self.milestones.get_mut(self.current_milestone_index)
    }

    /// 记录步骤错误（不向外抛出）
    pub fn record_error(&mut self, node: Step, message: impl Into<String>) {
        self.error = Some(message.into());
        self.error_node = Some(node.as_str().to_string());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
        self.error_node = None;
    }

    pub fn is_paused(&self) -> bool {
        self.pending_breakpoint.is_some()
    }

    pub fn passed_count(&self) -> usize {
        self.milestones
            .iter()
            .filter(|m| m.status == MilestoneStatus::Passed)
            .count()
    }

    pub fn total_cost(&self) -> f64 {
        self.milestones.iter().map(|m| m.cost).sum()
    }

    /// 已通过里程碑产出按顺序拼接
    pub fn collect_final_result(&self) -> Option<String> {
        let outputs: Vec<&str> = self
            .milestones
            .iter()
            .filter(|m| m.status == MilestoneStatus::Passed)
            .filter_map(|m| m.output.as_deref())
            .collect();
        if outputs.is_empty() {
            None
        } else {
            Some(outputs.join("\n\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complexity_accepts_names_and_ordinals() {
        let parsed: Vec<Complexity> =
            serde_json::from_str(r#"["trivial", "Context-Heavy", "MODERATE", 3, "context_heavy"]"#)
                .unwrap();
        assert_eq!(
            parsed,
            vec![
                Complexity::Trivial,
                Complexity::ContextHeavy,
                Complexity::Moderate,
                Complexity::Complex,
                Complexity::ContextHeavy,
            ]
        );
        assert!(serde_json::from_str::<Complexity>("7").is_err());
        assert!(serde_json::from_str::<Complexity>(r#""huge""#).is_err());
    }

    #[test]
    fn test_complexity_is_ordered() {
        assert!(Complexity::Trivial < Complexity::Simple);
        assert!(Complexity::Complex < Complexity::ContextHeavy);
        assert_eq!(
            serde_json::to_string(&Complexity::ContextHeavy).unwrap(),
            r#""context_heavy""#
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn test_failure_context_collects_partial_results() {
        let task = Task::new("t1", "s1", "build it");
        let mut state = WorkflowState::new(&task, 1000);
        let mut a = Milestone::new("a", 1, "first", Complexity::Simple);
        a.status = MilestoneStatus::Passed;
        a.output = Some("done a".into());
        let mut b = Milestone::new("b", 2, "second", Complexity::Moderate);
        b.status = MilestoneStatus::Failed;
        state.install_plan(vec![a, b]);

        let ctx = FailureContext::from_state(&state, "boom");
        assert_eq!(ctx.attempted_milestones.len(), 2);
        assert_eq!(ctx.attempted_milestones[1].status, MilestoneStatus::Failed);
        assert_eq!(ctx.partial_results.len(), 1);
        assert_eq!(ctx.partial_results[0].output.as_deref(), Some("done a"));
        assert!(ctx.user_message().contains("boom"));
    }

    #[test]
    fn test_install_plan_detects_wave_mode() {
        let task = Task::new("t1", "s1", "x");
        let mut state = WorkflowState::new(&task, 1000);
        state.install_plan(vec![Milestone::new("a", 1, "a", Complexity::Simple)]);
        assert!(!state.wave_mode);
        state.install_plan(vec![
            Milestone::new("a", 1, "a", Complexity::Simple),
            Milestone::new("b", 2, "b", Complexity::Simple).with_dependencies(["a"]),
        ]);
        assert!(state.wave_mode);
    }
}
