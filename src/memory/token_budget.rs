//! Token 预算策略
//!
//! 由 token 计数决定是否必须压缩上下文（阈值固定为上限的 85%），
//! 以及压缩时保留多少条最近消息。如何摘要由外部 Summarizer 负责。

use crate::memory::Message;

/// 触发压缩的比例阈值（百分比）
pub const COMPRESS_THRESHOLD_PERCENT: u64 = 85;

/// 压缩后保留片段允许占用的预算比例（默认）
pub const DEFAULT_TARGET_RATIO: f64 = 0.5;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}

/// 压缩计划：保留最近 preserve_count 条消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPlan {
    pub preserve_count: usize,
    /// 保留片段按当前计数折算后的 token 数
    pub preserved_tokens: usize,
}

impl CompressionPlan {
    /// 需要被摘要的前缀条数
    pub fn drop_count(&self, total: usize) -> usize {
        total.saturating_sub(self.preserve_count)
    }
}

/// 上下文预算策略
#[derive(Debug, Clone)]
pub struct ContextBudgetPolicy {
    target_ratio: f64,
}

impl ContextBudgetPolicy {
    pub fn new(target_ratio: f64) -> Self {
        let target_ratio = if target_ratio.is_finite() {
            target_ratio.clamp(0.05, 0.8)
        } else {
            DEFAULT_TARGET_RATIO
        };
        Self { target_ratio }
    }

    pub fn target_ratio(&self) -> f64 {
        self.target_ratio
    }

    /// current / max >= 0.85 时需要压缩；max 为 0 表示未配置预算
    pub fn should_compress(current_tokens: usize, max_tokens: usize) -> bool {
        if max_tokens == 0 {
            return false;
        }
        current_tokens as u128 * 100 >= max_tokens as u128 * COMPRESS_THRESHOLD_PERCENT as u128
    }

    /// 自动压缩：未超阈值时保留全部（幂等 no-op）；否则保留最近的后缀，
    /// 使其折算权重不超过 max * target_ratio，且至少保留最新一条
    pub fn plan_compression(
        &self,
        messages: &[Message],
        current_tokens: usize,
        max_tokens: usize,
    ) -> CompressionPlan {
        if !Self::should_compress(current_tokens, max_tokens) {
            return CompressionPlan {
                preserve_count: messages.len(),
                preserved_tokens: current_tokens,
            };
        }
        self.fit_suffix(messages, current_tokens, max_tokens)
    }

    /// 手动检查点：不看阈值，直接按目标窗口计算保留后缀
    pub fn plan_checkpoint(&self, messages: &[Message], max_tokens: usize) -> CompressionPlan {
        let estimated = crate::memory::estimate_messages(messages);
        self.fit_suffix(messages, estimated, max_tokens)
    }

    fn fit_suffix(
        &self,
        messages: &[Message],
        current_tokens: usize,
        max_tokens: usize,
    ) -> CompressionPlan {
        if messages.is_empty() {
            return CompressionPlan {
                preserve_count: 0,
                preserved_tokens: 0,
            };
        }

        // 计数器是真实用量，按估算值比例分摊到每条消息
        let estimates: Vec<usize> = messages.iter().map(Message::estimated_tokens).collect();
        let estimated_total = estimates.iter().sum::<usize>().max(1);
        let scale = current_tokens as f64 / estimated_total as f64;
        let window = max_tokens as f64 * self.target_ratio;

        let mut preserved = 0.0f64;
        let mut count = 0usize;
        for estimate in estimates.iter().rev() {
            let weight = *estimate as f64 * scale;
            if count > 0 && preserved + weight > window {
                break;
            }
            preserved += weight;
            count += 1;
        }

        CompressionPlan {
            preserve_count: count,
            preserved_tokens: preserved.ceil() as usize,
        }
    }
}

impl Default for ContextBudgetPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_RATIO)
    }
}
