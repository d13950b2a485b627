//! Planner：把请求拆解为里程碑，以及失败后的策略级重规划（rethink）
//!
//! 调用 Planner 角色得到 JSON 计划；extract_json 从文本中提取 JSON（```json ... ``` 或裸 JSON），
//! materialize 把计划转为 Milestone 并校验依赖无环。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::core::{Complexity, Milestone};
use crate::llm::{CapabilityInvoker, CapabilityRequest, CapabilityRole};
use crate::memory::{LongTermMemory, NoopLongTerm};
use crate::roles::RoleError;
use crate::workflow::{WorkItem, WorkItemGraph};

/// 拆解时最多带入的长期记忆条数
pub const MAX_MEMORY_HITS: usize = 5;

const PLAN_FORMAT: &str = r#"Return only JSON of the form:
{"milestones": [{"id": "optional short id", "description": "...", "complexity": "trivial|simple|moderate|complex|context_heavy", "acceptance_criteria": ["..."], "depends_on": ["ids of earlier milestones, optional"], "group": "optional grouping"}]}"#;

/// 验收标准：字符串或字符串数组
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Criteria {
    One(String),
    Many(Vec<String>),
}

impl Default for Criteria {
    fn default() -> Self {
        Criteria::Many(Vec::new())
    }
}

impl Criteria {
    fn into_vec(self) -> Vec<String> {
        match self {
            Criteria::One(s) if s.trim().is_empty() => Vec::new(),
            Criteria::One(s) => vec![s],
            Criteria::Many(v) => v.into_iter().filter(|s| !s.trim().is_empty()).collect(),
        }
    }
}

fn default_complexity() -> Complexity {
    Complexity::Moderate
}

/// 计划中的一个里程碑（外部 JSON，在边界处校验）
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedMilestone {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default = "default_complexity")]
    pub complexity: Complexity,
    #[serde(default)]
    acceptance_criteria: Criteria,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    pub milestones: Vec<PlannedMilestone>,
}

/// 从模型输出中提取 JSON 片段
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析计划 JSON
pub fn parse_plan(output: &str) -> Result<Plan, RoleError> {
    let json = extract_json(output)
        .ok_or_else(|| RoleError::InvalidPlan(format!("no JSON object in planner output: {}", preview(output))))?;
    let plan: Plan = serde_json::from_str(json)
        .map_err(|e| RoleError::InvalidPlan(format!("{e}: {}", preview(json))))?;
    if plan.milestones.is_empty() {
        return Err(RoleError::InvalidPlan("plan has no milestones".into()));
    }
    if let Some(pos) = plan.milestones.iter().position(|m| m.description.trim().is_empty()) {
        return Err(RoleError::InvalidPlan(format!("milestone #{} has an empty description", pos + 1)));
    }
    Ok(plan)
}

/// 计划 -> Milestone：缺失的 ID 生成 `ms_<uuid>`，序号从 1 开始；
/// depends_on 可引用计划内 ID 或 1 起的序号，其余原样保留（视为已满足）
pub fn materialize(plan: Plan) -> Result<Vec<Milestone>, RoleError> {
    let ids: Vec<String> = plan
        .milestones
        .iter()
        .map(|m| match m.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("ms_{}", uuid::Uuid::new_v4()),
        })
        .collect();
    let by_planned_id: HashMap<String, String> = plan
        .milestones
        .iter()
        .zip(&ids)
        .filter_map(|(m, id)| m.id.as_deref().map(|p| (p.trim().to_string(), id.clone())))
        .collect();

    let resolve = |dep: &str| -> String {
        let dep = dep.trim();
        if let Some(id) = by_planned_id.get(dep) {
            return id.clone();
        }
        match dep.parse::<usize>() {
            Ok(n) if (1..=ids.len()).contains(&n) => ids[n - 1].clone(),
            _ => dep.to_string(),
        }
    };

    let milestones: Vec<Milestone> = plan
        .milestones
        .into_iter()
        .zip(ids.iter())
        .enumerate()
        .map(|(i, (planned, id))| {
            let deps: Vec<String> = planned.depends_on.iter().map(|d| resolve(d)).collect();
            let mut m = Milestone::new(
                id.clone(),
                i as u32 + 1,
                planned.description.trim(),
                planned.complexity,
            )
            .with_criteria(planned.acceptance_criteria.into_vec())
            .with_dependencies(deps);
            m.group = planned.group.filter(|g| !g.trim().is_empty());
            m
        })
        .collect();

    if milestones.iter().any(|m| !m.depends_on.is_empty()) {
        WorkItemGraph::new(
            milestones
                .iter()
                .map(|m| WorkItem::new(m.id.clone()).depends_on(m.depends_on.clone())),
        )?;
    }
    Ok(milestones)
}

fn preview(s: &str) -> String {
    let p: String = s.chars().take(200).collect();
    if s.chars().count() > 200 {
        format!("{p}...")
    } else {
        p
    }
}

/// Planner：持有能力调用器与可选的长期记忆
pub struct Planner {
    invoker: Arc<dyn CapabilityInvoker>,
    long_term: Arc<dyn LongTermMemory>,
}

impl Planner {
    pub fn new(invoker: Arc<dyn CapabilityInvoker>) -> Self {
        Self {
            invoker,
            long_term: Arc::new(NoopLongTerm),
        }
    }

    pub fn with_long_term(mut self, long_term: Arc<dyn LongTermMemory>) -> Self {
        self.long_term = long_term;
        self
    }

    /// 拆解请求；user_id 存在且启用长期记忆时附带相似经验
    pub async fn decompose(&self, request: &str, user_id: Option<&str>) -> Result<Vec<Milestone>, RoleError> {
        let memories = match user_id {
            Some(user) if self.long_term.enabled() => {
                self.long_term.search_similar(request, user, MAX_MEMORY_HITS)
            }
            _ => Vec::new(),
        };

        let mut instruction = format!(
            "Break the request into an ordered list of milestones. Each milestone must be independently verifiable.\n\n## Request\n{}\n",
            request.trim()
        );
        if !memories.is_empty() {
            instruction.push_str("\n## Relevant past experience\n");
            for (text, score) in &memories {
                instruction.push_str(&format!("- ({score:.2}) {text}\n"));
            }
        }
        instruction.push_str(&format!("\n## Output\n{PLAN_FORMAT}"));

        tracing::debug!(memory_hits = memories.len(), "Decomposing request");
        let invocation = self
            .invoker
            .invoke(CapabilityRequest::new(CapabilityRole::Planner, instruction))
            .await?;
        materialize(parse_plan(&invocation.content)?)
    }

    /// 策略级重规划：带上失败方案摘要与失败原因
    pub async fn rethink(
        &self,
        request: &str,
        failed_approach: &str,
        reasons: &[String],
    ) -> Result<Vec<Milestone>, RoleError> {
        let reasons_block = reasons
            .iter()
            .map(|r| format!("- {r}"))
            .collect::<Vec<_>>()
            .join("\n");
        let instruction = format!(
            "The previous plan for this request failed. Propose a different approach; do not repeat the failed one.\n\n## Request\n{}\n\n## Failed approach\n{}\n\n## Failure reasons\n{}\n\n## Output\n{}",
            request.trim(),
            failed_approach,
            reasons_block,
            PLAN_FORMAT
        );
        let invocation = self
            .invoker
            .invoke(
                CapabilityRequest::new(CapabilityRole::Planner, instruction)
                    .with_feedback(reasons.to_vec()),
            )
            .await?;
        materialize(parse_plan(&invocation.content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedInvoker;
    use crate::memory::InMemoryLongTerm;

    #[test]
    fn test_parse_fenced_plan() {
        let output = "Here is the plan:\n```json\n{\"milestones\": [{\"description\": \"Write parser\", \"complexity\": \"simple\", \"acceptance_criteria\": \"parses input\"}]}\n```";
        let plan = parse_plan(output).unwrap();
        assert_eq!(plan.milestones.len(), 1);
        assert_eq!(plan.milestones[0].complexity, Complexity::Simple);
    }

    #[test]
    fn test_parse_rejects_empty_or_garbage() {
        assert!(matches!(parse_plan("no json here"), Err(RoleError::InvalidPlan(_))));
        assert!(matches!(
            parse_plan(r#"{"milestones": []}"#),
            Err(RoleError::InvalidPlan(_))
        ));
        assert!(matches!(
            parse_plan(r#"{"milestones": [{"description": "  "}]}"#),
            Err(RoleError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_materialize_assigns_ids_and_sequence() {
        let plan = parse_plan(
            r#"{"milestones": [
                {"description": "a", "complexity": 0},
                {"id": "b", "description": "b", "complexity": "Context-Heavy", "acceptance_criteria": ["x", ""]}
            ]}"#,
        )
        .unwrap();
        let ms = materialize(plan).unwrap();
        assert!(ms[0].id.starts_with("ms_"));
        assert_eq!(ms[1].id, "b");
        assert_eq!(ms[0].sequence_number, 1);
        assert_eq!(ms[1].sequence_number, 2);
        assert_eq!(ms[0].complexity, Complexity::Trivial);
        assert_eq!(ms[1].complexity, Complexity::ContextHeavy);
        assert_eq!(ms[1].acceptance_criteria, vec!["x".to_string()]);
    }

    #[test]
    fn test_materialize_resolves_dependencies() {
        let plan = parse_plan(
            r#"{"milestones": [
                {"id": "schema", "description": "schema"},
                {"description": "api", "depends_on": ["schema"]},
                {"description": "ui", "depends_on": ["2", "external"]}
            ]}"#,
        )
        .unwrap();
        let ms = materialize(plan).unwrap();
        assert_eq!(ms[1].depends_on, vec!["schema".to_string()]);
        assert_eq!(ms[2].depends_on, vec![ms[1].id.clone(), "external".to_string()]);
    }

    #[test]
    fn test_materialize_rejects_cycles() {
        let plan = parse_plan(
            r#"{"milestones": [
                {"id": "a", "description": "a", "depends_on": ["b"]},
                {"id": "b", "description": "b", "depends_on": ["a"]}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(materialize(plan), Err(RoleError::Workflow(_))));
    }

    #[tokio::test]
    async fn test_decompose_includes_memories() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.push(
            CapabilityRole::Planner,
            r#"{"milestones": [{"description": "deploy", "complexity": "simple"}]}"#,
        );
        let memory = Arc::new(InMemoryLongTerm::default());
        memory.add("alice", "deploy with docker compose worked well");

        let planner = Planner::new(invoker.clone()).with_long_term(memory);
        let ms = planner.decompose("deploy the service", Some("alice")).await.unwrap();
        assert_eq!(ms.len(), 1);

        let call = &invoker.calls_for(CapabilityRole::Planner)[0];
        assert!(call.instruction.contains("docker compose"));
        assert!(call.instruction.contains("## Request\ndeploy the service"));
    }

    #[tokio::test]
    async fn test_rethink_passes_reasons() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.push(
            CapabilityRole::Planner,
            r#"{"milestones": [{"description": "new way"}]}"#,
        );
        let planner = Planner::new(invoker.clone());
        let ms = planner
            .rethink("req", "1. old way [failed]", &["timeout".to_string()])
            .await
            .unwrap();
        assert_eq!(ms[0].description, "new way");
        let call = &invoker.calls_for(CapabilityRole::Planner)[0];
        assert!(call.instruction.contains("1. old way [failed]"));
        assert_eq!(call.feedback, vec!["timeout".to_string()]);
    }
}
