//! 运行中的对话上下文消息
//!
//! WorkflowState 中的上下文列表由这些消息组成；压缩时旧前缀被替换为一条摘要型 system 消息。

use serde::{Deserialize, Serialize};

use crate::memory::TokenEstimator;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// 估算 token 数
    pub fn estimated_tokens(&self) -> usize {
        TokenEstimator::estimate(&self.content)
    }
}

/// 整段消息的估算 token 数
pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(Message::estimated_tokens).sum()
}
