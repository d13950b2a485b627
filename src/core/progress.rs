//! 进度汇总：断点载荷与 get_progress 的返回值

use serde::{Deserialize, Serialize};

use crate::core::{Milestone, MilestoneStatus};

/// 单个分组的进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupProgress {
    pub group: String,
    pub total: usize,
    pub completed: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub failed: usize,
    /// 0.0 ..= 100.0，保留一位小数
    pub percent: f64,
    /// 当前里程碑描述
    pub current_item: Option<String>,
    /// 计划带分组时按首次出现顺序汇总
    pub group_progress: Vec<GroupProgress>,
}

impl ProgressReport {
    pub fn from_milestones(milestones: &[Milestone], current_index: usize) -> Self {
        let count = |status: MilestoneStatus| milestones.iter().filter(|m| m.status == status).count();
        let total = milestones.len();
        let completed = count(MilestoneStatus::Passed);

        let current_item = milestones
            .iter()
            .find(|m| m.status == MilestoneStatus::InProgress)
            .or_else(|| milestones.get(current_index))
            .map(|m| m.description.clone());

        let mut groups: Vec<GroupProgress> = Vec::new();
        for m in milestones {
            let Some(name) = m.group.as_deref() else {
                continue;
            };
            let idx = match groups.iter().position(|g| g.group == name) {
                Some(idx) => idx,
                None => {
                    groups.push(GroupProgress {
                        group: name.to_string(),
                        total: 0,
                        completed: 0,
                        percent: 0.0,
                    });
                    groups.len() - 1
                }
            };
            groups[idx].total += 1;
            if m.status == MilestoneStatus::Passed {
                groups[idx].completed += 1;
            }
        }
        for g in &mut groups {
            g.percent = percent(g.completed, g.total);
        }

        Self {
            total,
            completed,
            pending: count(MilestoneStatus::Pending),
            in_progress: count(MilestoneStatus::InProgress),
            failed: count(MilestoneStatus::Failed),
            percent: percent(completed, total),
            current_item,
            group_progress: groups,
        }
    }
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 * 1000.0 / total as f64).round() / 10.0
}
