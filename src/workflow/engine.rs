//! 波次执行引擎
//!
//! 每次从依赖图取出 ready() 的全部工作项并发执行，
//! 等整个波次落定（成功或失败）后再计算下一波。
//! 并发上限只作用于单个波次：每个波次各自持有一个 Semaphore，不同任务的波次互不占用许可。

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;

use crate::workflow::graph::WorkItemGraph;
use crate::workflow::types::*;

/// 单个波次的执行报告
#[derive(Debug)]
pub struct WaveReport<T, E> {
    /// 按派发顺序排列的 (ID, 结果)
    pub outcomes: Vec<(WorkItemId, Result<T, E>)>,
}

impl<T, E> WaveReport<T, E> {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// 波次执行器：只记录工作池大小，许可在每个波次内部创建
#[derive(Debug, Clone, Copy)]
pub struct WaveRunner {
    pool_size: usize,
}

impl WaveRunner {
    pub fn new(worker_pool_size: usize) -> Self {
        Self {
            pool_size: worker_pool_size.max(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// 执行一个波次：标记 InProgress -> 并发运行 -> 按结果标记 Completed / Failed
    pub async fn run_wave<F, Fut, T, E>(&self, graph: &mut WorkItemGraph, run: F) -> WaveReport<T, E>
    where
        F: Fn(WorkItemId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ready = graph.ready();
        for id in &ready {
            graph.mark_in_progress(id);
        }

        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let run = &run;
        let tasks = ready.into_iter().map(|id| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                // Semaphore 从不关闭，acquire 失败时仍继续执行
                let _permit = semaphore.acquire_owned().await.ok();
                let result = run(id.clone()).await;
                (id, result)
            }
        });
        let outcomes = join_all(tasks).await;

        for (id, result) in &outcomes {
            match result {
                Ok(_) => graph.mark_completed(id),
                Err(_) => graph.mark_failed(id),
            }
        }
        tracing::debug!(
            dispatched = outcomes.len(),
            pool_size = self.pool_size,
            "Wave settled"
        );

        WaveReport { outcomes }
    }
}

impl Default for WaveRunner {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn diamond() -> WorkItemGraph {
        WorkItemGraph::new(vec![
            WorkItem::new("a"),
            WorkItem::new("b").depends_on(["a"]),
            WorkItem::new("c").depends_on(["a"]),
            WorkItem::new("d").depends_on(["b", "c"]),
        ])
        .unwrap()
    }

    /// 逐波执行直到没有就绪项
    async fn drain<F, Fut, T, E>(
        runner: &WaveRunner,
        graph: &mut WorkItemGraph,
        run: F,
    ) -> Vec<WaveReport<T, E>>
    where
        F: Fn(WorkItemId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut reports = Vec::new();
        while !graph.ready().is_empty() {
            reports.push(runner.run_wave(graph, &run).await);
        }
        reports
    }

    #[tokio::test]
    async fn test_waves_respect_dependencies() {
        let runner = WaveRunner::new(4);
        let mut graph = diamond();
        let order = Mutex::new(Vec::new());

        let reports = drain(&runner, &mut graph, |id| {
            order.lock().unwrap().push(id.clone());
            async move { Ok::<_, String>(id) }
        })
        .await;

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[1].outcomes.len(), 2);
        let order = order.into_inner().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        assert_eq!(graph.stats().completed, 4);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents() {
        let runner = WaveRunner::new(2);
        let mut graph = diamond();

        let reports = drain(&runner, &mut graph, |id| async move {
            if id == "b" {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        })
        .await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].failed(), 1);
        assert_eq!(graph.blocked(), vec!["d".to_string()]);
        assert_eq!(graph.status("d"), Some(WorkItemStatus::Pending));
    }

    #[tokio::test]
    async fn test_pool_size_bounds_concurrency() {
        let runner = WaveRunner::new(2);
        let mut graph = WorkItemGraph::new((0..6).map(|i| WorkItem::new(format!("w{i}")))).unwrap();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        runner
            .run_wave(&mut graph, |_id| {
                let active = &active;
                let peak = &peak;
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ()>(())
                }
            })
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(graph.stats().completed, 6);
    }

    #[tokio::test]
    async fn test_concurrent_waves_do_not_share_permits() {
        let runner = WaveRunner::new(2);
        let mut left = WorkItemGraph::new((0..2).map(|i| WorkItem::new(format!("l{i}")))).unwrap();
        let mut right = WorkItemGraph::new((0..2).map(|i| WorkItem::new(format!("r{i}")))).unwrap();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let work = |_id: WorkItemId| {
            let active = &active;
            let peak = &peak;
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ()>(())
            }
        };
        tokio::join!(
            runner.run_wave(&mut left, work),
            runner.run_wave(&mut right, work)
        );

        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }
}
