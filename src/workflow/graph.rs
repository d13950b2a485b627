//! 工作项依赖图
//!
//! 使用下标竞技场（arena + index）保存节点，依赖表与邻接表均存下标。
//! 构造时用显式栈做深度优先环检测，失败时不暴露任何半成品图。

use std::collections::HashMap;

use crate::workflow::types::*;

/// 工作项依赖图：只回答「现在能跑什么」，不做 I/O、不持锁
#[derive(Debug, Clone)]
pub struct WorkItemGraph {
    items: Vec<WorkItem>,
    index: HashMap<WorkItemId, usize>,
    /// 依赖表：节点 -> 图内存在的依赖节点
    dependencies: Vec<Vec<usize>>,
}

impl WorkItemGraph {
    /// 创建依赖图；存在环时返回 CycleDetected（携带环上的一个节点 ID）
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Result<Self, WorkflowError> {
        let mut arena: Vec<WorkItem> = Vec::new();
        let mut index: HashMap<WorkItemId, usize> = HashMap::new();

        for item in items {
            if index.contains_key(&item.id) {
                tracing::warn!(id = %item.id, "Duplicate work item id ignored");
                continue;
            }
            index.insert(item.id.clone(), arena.len());
            arena.push(item);
        }

        let mut dependencies = vec![Vec::new(); arena.len()];
        for (idx, item) in arena.iter().enumerate() {
            for dep_id in &item.dependencies {
                // 缺失的依赖视为已满足
                if let Some(&dep_idx) = index.get(dep_id) {
                    if !dependencies[idx].contains(&dep_idx) {
                        dependencies[idx].push(dep_idx);
                    }
                }
            }
        }

        if let Some(offending) = find_cycle(&dependencies) {
            return Err(WorkflowError::CycleDetected(arena[offending].id.clone()));
        }

        Ok(Self {
            items: arena,
            index,
            dependencies,
        })
    }

    pub fn status(&self, id: &str) -> Option<WorkItemStatus> {
        self.index.get(id).map(|&idx| self.items[idx].status)
    }

    /// 获取可执行的工作项：Pending 且所有（图内）依赖均已 Completed
    pub fn ready(&self) -> Vec<WorkItemId> {
        let statuses: Vec<WorkItemStatus> = self.items.iter().map(|i| i.status).collect();
        self.ready_indices(&statuses)
            .into_iter()
            .map(|idx| self.items[idx].id.clone())
            .collect()
    }

    fn ready_indices(&self, statuses: &[WorkItemStatus]) -> Vec<usize> {
        (0..self.items.len())
            .filter(|&idx| {
                statuses[idx] == WorkItemStatus::Pending
                    && self.dependencies[idx]
                        .iter()
                        .all(|&dep| statuses[dep] == WorkItemStatus::Completed)
            })
            .collect()
    }

    pub fn mark_in_progress(&mut self, id: &str) {
        self.set_status(id, WorkItemStatus::InProgress);
    }

    pub fn mark_completed(&mut self, id: &str) {
        self.set_status(id, WorkItemStatus::Completed);
    }

    pub fn mark_failed(&mut self, id: &str) {
        self.set_status(id, WorkItemStatus::Failed);
    }

    /// ID 不存在时为 no-op；不校验状态迁移（上游计划数据才是真相来源）
    fn set_status(&mut self, id: &str, status: WorkItemStatus) {
        if let Some(&idx) = self.index.get(id) {
            self.items[idx].status = status;
        }
    }

    /// 永久阻塞的工作项：Pending 且至少一个依赖 Failed
    pub fn blocked(&self) -> Vec<WorkItemId> {
        self.items
            .iter()
            .enumerate()
            .filter(|(idx, item)| {
                item.status == WorkItemStatus::Pending
                    && self.dependencies[*idx]
                        .iter()
                        .any(|&dep| self.items[dep].status == WorkItemStatus::Failed)
            })
            .map(|(_, item)| item.id.clone())
            .collect()
    }

    /// 有 Pending 工作，但既无可执行项也无进行中项
    pub fn is_stuck(&self) -> bool {
        let stats = self.stats();
        stats.pending > 0 && stats.ready == 0 && stats.in_progress == 0
    }

    /// 在私有状态副本上模拟执行，按波次返回 ID 列表；可重复调用
    pub fn batches(&self) -> Batches<'_> {
        Batches {
            graph: self,
            statuses: self.items.iter().map(|i| i.status).collect(),
        }
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            total: self.items.len(),
            ..GraphStats::default()
        };
        for item in &self.items {
            match item.status {
                WorkItemStatus::Pending => stats.pending += 1,
                WorkItemStatus::InProgress => stats.in_progress += 1,
                WorkItemStatus::Completed => stats.completed += 1,
                WorkItemStatus::Failed => stats.failed += 1,
            }
        }
        stats.ready = self.ready().len();
        stats
    }
}

/// 波次序列：每一波为同时可执行的 ID；某一波无可执行项即终止（图卡住时提前结束）
pub struct Batches<'a> {
    graph: &'a WorkItemGraph,
    statuses: Vec<WorkItemStatus>,
}

impl Iterator for Batches<'_> {
    type Item = Vec<WorkItemId>;

    fn next(&mut self) -> Option<Self::Item> {
        let wave = self.graph.ready_indices(&self.statuses);
        if wave.is_empty() {
            return None;
        }
        for &idx in &wave {
            self.statuses[idx] = WorkItemStatus::Completed;
        }
        Some(
            wave.into_iter()
                .map(|idx| self.graph.items[idx].id.clone())
                .collect(),
        )
    }
}

/// 显式栈 DFS 环检测，返回环上被回访的节点
fn find_cycle(dependencies: &[Vec<usize>]) -> Option<usize> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    for root in 0..dependencies.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::Visiting;
        // (节点, 下一条待访问边的游标)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            match dependencies[node].get(frame.1) {
                Some(&next) => {
                    frame.1 += 1;
                    match marks[next] {
                        Mark::Visiting => return Some(next),
                        Mark::Unvisited => {
                            marks[next] = Mark::Visiting;
                            stack.push((next, 0));
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }
    None
}
