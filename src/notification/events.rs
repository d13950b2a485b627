//! 编排事件：每种状态转移对应一个带类型的载荷，可序列化为 JSON 供外部展示

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Complexity, ProgressReport, QaDecision};
use crate::memory::SnapshotKind;

/// 事件类型（订阅键）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStarted,
    PlanCreated,
    MilestoneStarted,
    MilestoneExecuted,
    QaDecided,
    MilestonePassed,
    MilestoneRetrying,
    MilestoneFailed,
    ContextCompacted,
    BreakpointReached,
    TaskResumed,
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed,
    WaveStarted,
    WaveCompleted,
    WorkBlocked,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskAborted,
}

/// 事件载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    TaskStarted {
        request: String,
    },
    PlanCreated {
        milestones: usize,
        wave_mode: bool,
    },
    MilestoneStarted {
        milestone_id: String,
        complexity: Complexity,
        strategy: String,
        attempt: u32,
    },
    MilestoneExecuted {
        milestone_id: String,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    },
    QaDecided {
        milestone_id: String,
        decision: QaDecision,
        feedback: Option<String>,
    },
    MilestonePassed {
        milestone_id: String,
    },
    MilestoneRetrying {
        milestone_id: String,
        retry_count: u32,
    },
    MilestoneFailed {
        milestone_id: String,
        error: Option<String>,
    },
    ContextCompacted {
        snapshot_id: String,
        kind: SnapshotKind,
        tokens_before: usize,
        tokens_after: usize,
    },
    BreakpointReached {
        progress: ProgressReport,
    },
    TaskResumed {
        feedback: Option<String>,
    },
    RecoveryStarted {
        reasons: Vec<String>,
    },
    RecoveryCompleted {
        milestones: usize,
    },
    RecoveryFailed {
        error: String,
    },
    WaveStarted {
        milestone_ids: Vec<String>,
    },
    WaveCompleted {
        succeeded: usize,
        failed: usize,
    },
    WorkBlocked {
        milestone_ids: Vec<String>,
    },
    TaskCompleted {
        result: Option<String>,
        total_cost: f64,
    },
    TaskFailed {
        error: String,
    },
    TaskCancelled,
    TaskAborted {
        reason: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::TaskStarted { .. } => EventKind::TaskStarted,
            EventPayload::PlanCreated { .. } => EventKind::PlanCreated,
            EventPayload::MilestoneStarted { .. } => EventKind::MilestoneStarted,
            EventPayload::MilestoneExecuted { .. } => EventKind::MilestoneExecuted,
            EventPayload::QaDecided { .. } => EventKind::QaDecided,
            EventPayload::MilestonePassed { .. } => EventKind::MilestonePassed,
            EventPayload::MilestoneRetrying { .. } => EventKind::MilestoneRetrying,
            EventPayload::MilestoneFailed { .. } => EventKind::MilestoneFailed,
            EventPayload::ContextCompacted { .. } => EventKind::ContextCompacted,
            EventPayload::BreakpointReached { .. } => EventKind::BreakpointReached,
            EventPayload::TaskResumed { .. } => EventKind::TaskResumed,
            EventPayload::RecoveryStarted { .. } => EventKind::RecoveryStarted,
            EventPayload::RecoveryCompleted { .. } => EventKind::RecoveryCompleted,
            EventPayload::RecoveryFailed { .. } => EventKind::RecoveryFailed,
            EventPayload::WaveStarted { .. } => EventKind::WaveStarted,
            EventPayload::WaveCompleted { .. } => EventKind::WaveCompleted,
            EventPayload::WorkBlocked { .. } => EventKind::WorkBlocked,
            EventPayload::TaskCompleted { .. } => EventKind::TaskCompleted,
            EventPayload::TaskFailed { .. } => EventKind::TaskFailed,
            EventPayload::TaskCancelled => EventKind::TaskCancelled,
            EventPayload::TaskAborted { .. } => EventKind::TaskAborted,
        }
    }
}

/// 带任务 ID 与时间戳的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub task_id: String,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(task_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            task_id: task_id.into(),
            emitted_at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::new(
            "t1",
            EventPayload::MilestonePassed {
                milestone_id: "m1".into(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "milestone_passed");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["milestone_id"], "m1");
        assert_eq!(event.kind(), EventKind::MilestonePassed);
    }

    #[test]
    fn test_unit_payload_round_trips() {
        let event = Event::new("t1", EventPayload::TaskCancelled);
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), EventKind::TaskCancelled);
    }
}
