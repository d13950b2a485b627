//! 外部协作者抽象
//!
//! 核心只通过这些 trait 调用外部能力：CapabilityInvoker（按角色调用模型/工具）、
//! Summarizer（摘要被压缩的上下文）、StrategySelector（按复杂度选择执行策略并估算成本）。
//! 具体传输层不在本核心范围内。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Complexity;
use crate::memory::Message;

/// 流水线中的可替换角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRole {
    Planner,
    Executor,
    Validator,
    Summarizer,
}

impl CapabilityRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityRole::Planner => "planner",
            CapabilityRole::Executor => "executor",
            CapabilityRole::Validator => "validator",
            CapabilityRole::Summarizer => "summarizer",
        }
    }
}

/// 一次能力调用的请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityRequest {
    pub role: CapabilityRole,
    pub instruction: String,
    /// 上一步（或前置里程碑）的产出
    pub prior_output: Option<String>,
    /// 累积的审阅反馈
    pub feedback: Vec<String>,
    /// 选定的执行策略（模型 ID）
    pub strategy: Option<String>,
}

impl CapabilityRequest {
    pub fn new(role: CapabilityRole, instruction: impl Into<String>) -> Self {
        Self {
            role,
            instruction: instruction.into(),
            prior_output: None,
            feedback: Vec::new(),
            strategy: None,
        }
    }

    pub fn with_prior_output(mut self, output: Option<String>) -> Self {
        self.prior_output = output;
        self
    }

    pub fn with_feedback(mut self, feedback: Vec<String>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_strategy(mut self, strategy: Option<String>) -> Self {
        self.strategy = strategy;
        self
    }
}

/// 能力调用结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Invocation {
    pub fn new(content: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            content: content.into(),
            input_tokens,
            output_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// 外部调用的传输/运行时错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invocation timed out after {0}s")]
    Timeout(u64),
}

/// 能力调用器：invoke(role, instruction, prior_output?, feedback?)
#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
    async fn invoke(&self, request: CapabilityRequest) -> Result<Invocation, InvokeError>;
}

/// 摘要器：把一段消息压缩成一段文本
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, InvokeError>;
}

/// 执行策略选择器
pub trait StrategySelector: Send + Sync {
    /// 调用方指定的 preferred 总是优先
    fn select(&self, complexity: Complexity, preferred: Option<&str>) -> String;

    fn estimate_cost(&self, strategy: &str, input_tokens: u64, output_tokens: u64) -> f64;
}

/// 用 Summarizer 角色的能力调用实现摘要
pub struct InvokerSummarizer {
    invoker: Arc<dyn CapabilityInvoker>,
}

impl InvokerSummarizer {
    pub fn new(invoker: Arc<dyn CapabilityInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl Summarizer for InvokerSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, InvokeError> {
        let transcript = messages
            .iter()
            .map(|m| format!("[{:?}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let instruction = format!(
            "Summarize the following context. Keep decisions, produced artifacts and open problems.\n\n{}",
            transcript
        );
        let invocation = self
            .invoker
            .invoke(CapabilityRequest::new(CapabilityRole::Summarizer, instruction))
            .await?;
        Ok(invocation.content.trim().to_string())
    }
}
