//! Validator：按验收标准审阅里程碑产出，给出 pass / retry / fail
//!
//! 优先解析 JSON 判定；否则看文本前缀（PASS / OK / RETRY / FAIL）。
//! 无法解析的输出按 retry 处理，原文作为反馈带入下一次执行。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::{Milestone, QaDecision};
use crate::llm::{CapabilityInvoker, CapabilityRequest, CapabilityRole, InvokeError, Invocation};
use crate::roles::planner::extract_json;

/// 审阅结论
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: QaDecision,
    pub feedback: Option<String>,
    /// 审阅者建议重规划时的理由
    pub replan_reason: Option<String>,
}

impl Verdict {
    fn new(decision: QaDecision, feedback: Option<String>) -> Self {
        Self {
            decision,
            feedback: feedback.filter(|f| !f.trim().is_empty()),
            replan_reason: None,
        }
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    decision: String,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    replan_reason: Option<String>,
}

fn decision_from_word(word: &str) -> Option<QaDecision> {
    match word.trim().to_lowercase().as_str() {
        "pass" | "passed" | "ok" | "approved" | "accept" => Some(QaDecision::Pass),
        "retry" | "revise" | "redo" => Some(QaDecision::Retry),
        "fail" | "failed" | "reject" | "rejected" => Some(QaDecision::Fail),
        _ => None,
    }
}

/// 解析审阅输出
pub fn parse_verdict(output: &str) -> Verdict {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Verdict::new(
            QaDecision::Retry,
            Some("Validator returned an empty verdict".to_string()),
        );
    }

    if let Some(raw) = extract_json(trimmed).and_then(|j| serde_json::from_str::<RawVerdict>(j).ok()) {
        if let Some(decision) = decision_from_word(&raw.decision) {
            let mut verdict = Verdict::new(decision, raw.feedback);
            verdict.replan_reason = raw.replan_reason.filter(|r| !r.trim().is_empty());
            return verdict;
        }
    }

    for (prefix, decision) in [
        ("PASS", QaDecision::Pass),
        ("OK", QaDecision::Pass),
        ("RETRY", QaDecision::Retry),
        ("FAIL", QaDecision::Fail),
    ] {
        let Some(head) = trimmed.get(..prefix.len()) else {
            continue;
        };
        let rest = &trimmed[prefix.len()..];
        // 前缀必须是完整的词："OKAY" / "Passable" 不算
        let bounded = rest.chars().next().map_or(true, |c| !c.is_alphanumeric());
        if bounded && head.eq_ignore_ascii_case(prefix) {
            let rest = rest.trim_start_matches([':', '-', ' ', '\n']);
            return Verdict::new(decision, Some(rest.trim().to_string()));
        }
    }

    Verdict::new(QaDecision::Retry, Some(trimmed.to_string()))
}

pub struct Validator {
    invoker: Arc<dyn CapabilityInvoker>,
}

impl Validator {
    pub fn new(invoker: Arc<dyn CapabilityInvoker>) -> Self {
        Self { invoker }
    }

    pub fn build_instruction(milestone: &Milestone, output: &str) -> String {
        let criteria = if milestone.acceptance_criteria.is_empty() {
            "- The output fully addresses the milestone".to_string()
        } else {
            milestone
                .acceptance_criteria
                .iter()
                .map(|c| format!("- {c}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "Review the output of milestone {} against its acceptance criteria.\n\n## Milestone\n{}\n\n## Acceptance criteria\n{}\n\n## Output\n{}\n\n## Verdict\nReturn only JSON: {{\"decision\": \"pass|retry|fail\", \"feedback\": \"what to fix\", \"replan_reason\": \"optional, when the approach itself is wrong\"}}",
            milestone.sequence_number, milestone.description, criteria, output
        )
    }

    pub async fn validate(&self, milestone: &Milestone, output: &str) -> Result<(Verdict, Invocation), InvokeError> {
        let request = CapabilityRequest::new(
            CapabilityRole::Validator,
            Self::build_instruction(milestone, output),
        )
        .with_prior_output(Some(output.to_string()))
        .with_strategy(milestone.strategy.clone());
        let invocation = self.invoker.invoke(request).await?;
        Ok((parse_verdict(&invocation.content), invocation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_verdict() {
        let v = parse_verdict(r#"```json
{"decision": "RETRY", "feedback": "missing tests", "replan_reason": ""}
```"#);
        assert_eq!(v.decision, QaDecision::Retry);
        assert_eq!(v.feedback.as_deref(), Some("missing tests"));
        assert!(v.replan_reason.is_none());

        let v = parse_verdict(r#"{"decision": "fail", "replan_reason": "wrong library"}"#);
        assert_eq!(v.decision, QaDecision::Fail);
        assert_eq!(v.replan_reason.as_deref(), Some("wrong library"));
    }

    #[test]
    fn test_parse_text_prefix() {
        assert_eq!(parse_verdict("PASS").decision, QaDecision::Pass);
        assert_eq!(parse_verdict("ok, looks good").decision, QaDecision::Pass);
        let v = parse_verdict("RETRY: add error handling");
        assert_eq!(v.decision, QaDecision::Retry);
        assert_eq!(v.feedback.as_deref(), Some("add error handling"));
        assert_eq!(parse_verdict("Fail - wrong output").decision, QaDecision::Fail);
    }

    #[test]
    fn test_prefix_must_be_whole_word() {
        let v = parse_verdict("OKAY, but missing tests");
        assert_eq!(v.decision, QaDecision::Retry);
        assert_eq!(v.feedback.as_deref(), Some("OKAY, but missing tests"));
        assert_eq!(parse_verdict("Passable, needs polish").decision, QaDecision::Retry);
        assert_eq!(parse_verdict("Failover handled").decision, QaDecision::Retry);
        assert_eq!(parse_verdict("ok").decision, QaDecision::Pass);
    }

    #[test]
    fn test_unparseable_becomes_retry_with_feedback() {
        let v = parse_verdict("The output is incomplete");
        assert_eq!(v.decision, QaDecision::Retry);
        assert_eq!(v.feedback.as_deref(), Some("The output is incomplete"));

        let v = parse_verdict("   ");
        assert_eq!(v.decision, QaDecision::Retry);
    }

    #[test]
    fn test_instruction_lists_criteria() {
        let m = Milestone::new("m", 2, "write docs", crate::core::Complexity::Simple)
            .with_criteria(["covers install", "covers usage"]);
        let text = Validator::build_instruction(&m, "the docs");
        assert!(text.contains("- covers install\n- covers usage"));
        assert!(text.contains("milestone 2"));
    }
}
