//! Context Compaction：把较旧的消息前缀摘要为一条 system 消息
//!
//! 保留多少由 ContextBudgetPolicy 决定；摘要由外部 Summarizer 生成。
//! 压缩产出一条不可变快照，调用方须在缩短上下文之前持久化它。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{InvokeError, Summarizer};
use crate::memory::{estimate_messages, ContextBudgetPolicy, Message, Role};

const SUMMARY_HEADER: &str = "Previous context summary:";

/// 快照类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// 超过阈值时自动压缩
    Automatic,
    /// 手动检查点
    ManualCheckpoint,
}

/// 压缩快照（写入后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionSnapshot {
    pub id: String,
    pub task_id: String,
    pub kind: SnapshotKind,
    /// 被丢弃内容的摘要
    pub summary: String,
    /// 被摘要部分的 token 数
    pub token_count: usize,
    pub summarized_messages: usize,
    /// 可选的结构化关键决策
    pub key_decisions: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// 一次压缩的结果
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub snapshot: CompactionSnapshot,
    /// 压缩后的上下文（摘要消息 + 保留的后缀）
    pub messages: Vec<Message>,
    pub tokens_after: usize,
}

/// 上下文压缩器
pub struct ContextCompactor {
    policy: ContextBudgetPolicy,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextCompactor {
    pub fn new(policy: ContextBudgetPolicy, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { policy, summarizer }
    }

    /// 自动压缩：未超过阈值或无可丢弃前缀时返回 None
    pub async fn compact(
        &self,
        task_id: &str,
        messages: &[Message],
        current_tokens: usize,
        max_tokens: usize,
    ) -> Result<Option<CompactionOutcome>, InvokeError> {
        let plan = self
            .policy
            .plan_compression(messages, current_tokens, max_tokens);
        let drop_count = plan.drop_count(messages.len());
        // 可丢弃的只有上一次的摘要：再摘要一遍不会缩短上下文
        if drop_count == 0 || (drop_count == 1 && is_summary(&messages[0])) {
            return Ok(None);
        }

        let (dropped, preserved) = messages.split_at(drop_count);
        let dropped_tokens = current_tokens.saturating_sub(plan.preserved_tokens);
        let summary = self.summarizer.summarize(dropped).await?;
        let snapshot = new_snapshot(
            task_id,
            SnapshotKind::Automatic,
            summary,
            dropped_tokens,
            drop_count,
            None,
        );
        Ok(Some(rebuild(snapshot, preserved, plan.preserved_tokens)))
    }

    /// 手动检查点：不看阈值；若全部消息都在窗口内，仍生成整段摘要快照但不缩短上下文
    pub async fn checkpoint(
        &self,
        task_id: &str,
        messages: &[Message],
        max_tokens: usize,
        key_decisions: Option<serde_json::Value>,
    ) -> Result<Option<CompactionOutcome>, InvokeError> {
        if messages.is_empty() {
            return Ok(None);
        }

        let plan = self.policy.plan_checkpoint(messages, max_tokens);
        let drop_count = plan.drop_count(messages.len());

        if drop_count == 0 {
            let tokens = estimate_messages(messages);
            let summary = self.summarizer.summarize(messages).await?;
            let snapshot = new_snapshot(
                task_id,
                SnapshotKind::ManualCheckpoint,
                summary,
                tokens,
                messages.len(),
                key_decisions,
            );
            return Ok(Some(CompactionOutcome {
                snapshot,
                messages: messages.to_vec(),
                tokens_after: tokens,
            }));
        }

        let (dropped, preserved) = messages.split_at(drop_count);
        let summary = self.summarizer.summarize(dropped).await?;
        let snapshot = new_snapshot(
            task_id,
            SnapshotKind::ManualCheckpoint,
            summary,
            estimate_messages(dropped),
            drop_count,
            key_decisions,
        );
        Ok(Some(rebuild(snapshot, preserved, plan.preserved_tokens)))
    }
}

fn new_snapshot(
    task_id: &str,
    kind: SnapshotKind,
    summary: String,
    token_count: usize,
    summarized_messages: usize,
    key_decisions: Option<serde_json::Value>,
) -> CompactionSnapshot {
    CompactionSnapshot {
        id: format!("snap_{}", uuid::Uuid::new_v4()),
        task_id: task_id.to_string(),
        kind,
        summary,
        token_count,
        summarized_messages,
        key_decisions,
        created_at: Utc::now(),
    }
}

fn is_summary(message: &Message) -> bool {
    message.role == Role::System && message.content.starts_with(SUMMARY_HEADER)
}

fn rebuild(
    snapshot: CompactionSnapshot,
    preserved: &[Message],
    preserved_tokens: usize,
) -> CompactionOutcome {
    let summary_message = Message::system(format!("{SUMMARY_HEADER}\n\n{}", snapshot.summary));
    let tokens_after = preserved_tokens + summary_message.estimated_tokens();
    let mut messages = Vec::with_capacity(preserved.len() + 1);
    messages.push(summary_message);
    messages.extend_from_slice(preserved);
    CompactionOutcome {
        snapshot,
        messages,
        tokens_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSummarizer {
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Summarizer for RecordingSummarizer {
        async fn summarize(&self, messages: &[Message]) -> Result<String, InvokeError> {
            self.seen.lock().unwrap().push(messages.len());
            Ok(format!("{} messages summarized", messages.len()))
        }
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::assistant(format!("{i}: {}", "y".repeat(400))))
            .collect()
    }

    #[tokio::test]
    async fn test_compact_replaces_prefix_with_summary() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let compactor = ContextCompactor::new(ContextBudgetPolicy::default(), summarizer.clone());
        let msgs = history(10);

        let outcome = compactor
            .compact("task-1", &msgs, 90_000, 100_000)
            .await
            .unwrap()
            .expect("compaction should run");

        assert_eq!(outcome.snapshot.kind, SnapshotKind::Automatic);
        assert_eq!(outcome.snapshot.summarized_messages, 5);
        assert_eq!(outcome.messages.len(), 6);
        assert_eq!(outcome.messages[0].role, crate::memory::Role::System);
        assert_eq!(outcome.messages.last(), msgs.last());
        assert!(outcome.tokens_after < 85_000);
        assert_eq!(*summarizer.seen.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_compact_under_budget_is_noop() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let compactor = ContextCompactor::new(ContextBudgetPolicy::default(), summarizer.clone());

        let outcome = compactor
            .compact("task-1", &history(4), 10_000, 100_000)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(summarizer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_latest_message_compacts_once() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let compactor = ContextCompactor::new(ContextBudgetPolicy::default(), summarizer.clone());
        let msgs = history(3);

        let first = compactor
            .compact("task-1", &msgs, 95_000, 100_000)
            .await
            .unwrap()
            .expect("first pass compacts");
        assert_eq!(first.messages.len(), 2);

        // 最新一条仍占满窗口，只剩上次的摘要可丢
        let again = compactor
            .compact("task-1", &first.messages, 95_000, 100_000)
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(*summarizer.seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_checkpoint_keeps_decisions() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let compactor = ContextCompactor::new(ContextBudgetPolicy::default(), summarizer);

        let outcome = compactor
            .checkpoint(
                "task-1",
                &history(2),
                100_000,
                Some(serde_json::json!({"db": "sqlite"})),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.snapshot.kind, SnapshotKind::ManualCheckpoint);
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(
            outcome.snapshot.key_decisions,
            Some(serde_json::json!({"db": "sqlite"}))
        );
    }
}
