//! Executor：为里程碑生成执行指令并调用 Executor 角色

use std::sync::Arc;

use crate::core::Milestone;
use crate::llm::{CapabilityInvoker, CapabilityRequest, CapabilityRole, InvokeError, Invocation};

pub struct Executor {
    invoker: Arc<dyn CapabilityInvoker>,
}

impl Executor {
    pub fn new(invoker: Arc<dyn CapabilityInvoker>) -> Self {
        Self { invoker }
    }

    /// 描述 + 验收标准 + 审阅反馈 + 用户在断点处给出的反馈
    pub fn build_instruction(milestone: &Milestone, user_feedback: Option<&str>) -> String {
        let mut out = format!(
            "Milestone {}: {}\n",
            milestone.sequence_number, milestone.description
        );
        if !milestone.acceptance_criteria.is_empty() {
            out.push_str("\n## Acceptance criteria\n");
            for c in &milestone.acceptance_criteria {
                out.push_str(&format!("- {c}\n"));
            }
        }
        if !milestone.feedback.is_empty() {
            out.push_str("\n## Reviewer feedback from previous attempts\n");
            for (i, f) in milestone.feedback.iter().enumerate() {
                out.push_str(&format!("{}. {f}\n", i + 1));
            }
        }
        if let Some(fb) = user_feedback.filter(|f| !f.trim().is_empty()) {
            out.push_str(&format!("\n## User guidance\n{}\n", fb.trim()));
        }
        out
    }

    /// 返回 (指令, 调用结果)
    pub async fn execute(
        &self,
        milestone: &Milestone,
        prior_output: Option<String>,
        user_feedback: Option<&str>,
    ) -> Result<(String, Invocation), InvokeError> {
        let instruction = Self::build_instruction(milestone, user_feedback);
        let request = CapabilityRequest::new(CapabilityRole::Executor, instruction.clone())
            .with_prior_output(prior_output)
            .with_feedback(milestone.feedback.clone())
            .with_strategy(milestone.strategy.clone());
        let invocation = self.invoker.invoke(request).await?;
        Ok((instruction, invocation))
    }
}
