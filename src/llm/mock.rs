//! Mock 能力调用器（用于测试与本地演示，无需 API）
//!
//! - EchoInvoker：确定性回显；Planner 按句子拆出里程碑，Validator 一律通过
//! - ScriptedInvoker：按角色排队的脚本化响应 + 调用记录，队列为空时回落到 EchoInvoker

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{CapabilityInvoker, CapabilityRequest, CapabilityRole, InvokeError, Invocation};

/// 最多拆出的里程碑数
const ECHO_MAX_MILESTONES: usize = 5;

/// 回显调用器
#[derive(Debug, Default, Clone)]
pub struct EchoInvoker;

impl EchoInvoker {
    fn plan_for(instruction: &str) -> String {
        let request = extract_request(instruction);
        let mut clauses: Vec<String> = request
            .split(['.', ';', '\n', '。', '；'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .take(ECHO_MAX_MILESTONES)
            .map(String::from)
            .collect();
        if clauses.is_empty() {
            clauses.push(request.trim().to_string());
        }

        let milestones: Vec<serde_json::Value> = clauses
            .iter()
            .map(|clause| {
                serde_json::json!({
                    "description": clause,
                    "complexity": if clause.len() > 80 { "moderate" } else { "simple" },
                    "acceptance_criteria": [format!("Output addresses: {clause}")],
                })
            })
            .collect();
        serde_json::json!({ "milestones": milestones }).to_string()
    }
}

/// 取出 "## Request" 段落；找不到时使用整个指令
fn extract_request(instruction: &str) -> &str {
    let Some(start) = instruction.find("## Request") else {
        return instruction;
    };
    let rest = &instruction[start + "## Request".len()..];
    let end = rest.find("\n## ").unwrap_or(rest.len());
    rest[..end].trim()
}

#[async_trait]
impl CapabilityInvoker for EchoInvoker {
    async fn invoke(&self, request: CapabilityRequest) -> Result<Invocation, InvokeError> {
        let content = match request.role {
            CapabilityRole::Planner => Self::plan_for(&request.instruction),
            CapabilityRole::Executor => {
                let first_line = request.instruction.lines().next().unwrap_or_default();
                format!("Echo from Mock: {first_line}")
            }
            CapabilityRole::Validator => r#"{"decision": "pass"}"#.to_string(),
            CapabilityRole::Summarizer => {
                let chars: String = request.instruction.chars().take(200).collect();
                format!("Summary: {chars}")
            }
        };
        let input_tokens = request.instruction.len() as u64 / 4 + 1;
        let output_tokens = content.len() as u64 / 4 + 1;
        Ok(Invocation::new(content, input_tokens, output_tokens))
    }
}

type Script = VecDeque<Result<Invocation, InvokeError>>;

/// 脚本化调用器：测试按角色预置响应序列
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<CapabilityRole, Script>>,
    calls: Mutex<Vec<CapabilityRequest>>,
    fallback: EchoInvoker,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条响应（默认 token 计数 10/10）
    pub fn push(&self, role: CapabilityRole, content: impl Into<String>) -> &Self {
        self.push_invocation(role, Invocation::new(content, 10, 10))
    }

    pub fn push_invocation(&self, role: CapabilityRole, invocation: Invocation) -> &Self {
        self.enqueue(role, Ok(invocation));
        self
    }

    pub fn push_error(&self, role: CapabilityRole, error: InvokeError) -> &Self {
        self.enqueue(role, Err(error));
        self
    }

    fn enqueue(&self, role: CapabilityRole, entry: Result<Invocation, InvokeError>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(role).or_default().push_back(entry);
        }
    }

    /// 所有调用（按发生顺序）
    pub fn calls(&self) -> Vec<CapabilityRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, role: CapabilityRole) -> Vec<CapabilityRequest> {
        self.calls()
            .into_iter()
            .filter(|c| c.role == role)
            .collect()
    }

    /// 尚未消费的脚本条数
    pub fn remaining(&self, role: CapabilityRole) -> usize {
        self.scripts
            .lock()
            .map(|s| s.get(&role).map(VecDeque::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl CapabilityInvoker for ScriptedInvoker {
    async fn invoke(&self, request: CapabilityRequest) -> Result<Invocation, InvokeError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&request.role).and_then(VecDeque::pop_front));
        match scripted {
            Some(entry) => entry,
            None => self.fallback.invoke(request).await,
        }
    }
}
