//! 长期记忆检索：Planner 拆解任务前可选地查询相似经验
//!
//! 向量索引不在本核心范围内；InMemoryLongTerm 以关键词重叠率近似相似度，
//! 真实部署可接入外部向量库实现同一 trait。

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// 长期记忆 trait：按用户写入与相似度检索
pub trait LongTermMemory: Send + Sync {
    /// 为用户存入一段文本
    fn add(&self, user_id: &str, text: &str);

    /// 检索最相关的 k 条，返回 (文本, 相似度 0..=1)，按相似度降序
    fn search_similar(&self, query: &str, user_id: &str, k: usize) -> Vec<(String, f32)>;

    /// 是否启用（Noop 实现返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 空实现：未启用长期记忆时使用
#[derive(Clone, Default)]
pub struct NoopLongTerm;

impl LongTermMemory for NoopLongTerm {
    fn add(&self, _user_id: &str, _text: &str) {}

    fn search_similar(&self, _query: &str, _user_id: &str, _k: usize) -> Vec<(String, f32)> {
        Vec::new()
    }

    fn enabled(&self) -> bool {
        false
    }
}

type Entry = (String, HashSet<String>);

/// 简单内存实现：按用户隔离，关键词重叠率作为相似度
pub struct InMemoryLongTerm {
    store: RwLock<HashMap<String, Vec<Entry>>>,
    max_entries_per_user: usize,
}

/// 将文本切分为小写词集合
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.chars().count() > 1)
        .collect()
}

impl InMemoryLongTerm {
    pub fn new(max_entries_per_user: usize) -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            max_entries_per_user: max_entries_per_user.max(1),
        }
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl LongTermMemory for InMemoryLongTerm {
    fn add(&self, user_id: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Ok(mut store) = self.store.write() else {
            tracing::warn!("Long-term memory lock poisoned, dropping entry");
            return;
        };
        let entries = store.entry(user_id.to_string()).or_default();
        entries.push((text.to_string(), tokenize_lower(text)));
        let n = entries.len();
        if n > self.max_entries_per_user {
            entries.drain(0..n - self.max_entries_per_user);
        }
    }

    fn search_similar(&self, query: &str, user_id: &str, k: usize) -> Vec<(String, f32)> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let Ok(store) = self.store.read() else {
            return Vec::new();
        };
        let Some(entries) = store.get(user_id) else {
            return Vec::new();
        };

        let mut scored: Vec<(String, f32)> = entries
            .iter()
            .map(|(text, doc_tokens)| {
                let overlap = query_tokens.intersection(doc_tokens).count();
                (text.clone(), overlap as f32 / query_tokens.len() as f32)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_is_scoped_by_user() {
        let memory = InMemoryLongTerm::default();
        memory.add("alice", "Deploy the service with docker compose");
        memory.add("bob", "Deploy the service with kubernetes");

        let hits = memory.search_similar("deploy service", "alice", 5);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].0.contains("docker"));
        assert!((hits[0].1 - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_search_orders_by_score() {
        let memory = InMemoryLongTerm::default();
        memory.add("u", "write unit tests");
        memory.add("u", "write unit tests for the parser module");
        memory.add("u", "unrelated gardening notes");

        let hits = memory.search_similar("parser unit tests", "u", 5);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].0.contains("parser"));
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let memory = InMemoryLongTerm::new(2);
        memory.add("u", "alpha note");
        memory.add("u", "beta note");
        memory.add("u", "gamma note");
        let hits = memory.search_similar("alpha note", "u", 5);
        assert!(hits.iter().all(|(t, _)| !t.contains("alpha")));
    }

    #[test]
    fn test_noop_is_disabled() {
        let memory = NoopLongTerm;
        memory.add("u", "anything");
        assert!(!memory.enabled());
        assert!(memory.search_similar("anything", "u", 3).is_empty());
    }
}
