//! 记忆层：上下文消息、Token 预算、上下文压缩、长期记忆检索

pub mod compaction;
pub mod conversation;
pub mod long_term;
pub mod token_budget;

pub use compaction::{CompactionOutcome, CompactionSnapshot, ContextCompactor, SnapshotKind};
pub use conversation::{estimate_messages, Message, Role};
pub use long_term::{InMemoryLongTerm, LongTermMemory, NoopLongTerm};
pub use token_budget::{
    CompressionPlan, ContextBudgetPolicy, TokenEstimator, COMPRESS_THRESHOLD_PERCENT,
    DEFAULT_TARGET_RATIO,
};
