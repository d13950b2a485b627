//! 按复杂度路由执行策略
//!
//! 每个复杂度等级映射到一个模型 ID（轻量模型跑 trivial/simple，强模型跑 complex/context_heavy），
//! 调用方传入的 preferred 覆盖总是优先。成本按模型单价估算。

use std::collections::HashMap;

use crate::config::StrategySection;
use crate::core::Complexity;
use crate::llm::StrategySelector;

/// 模型单价（每 1k token）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }
}

/// 复杂度路由器
#[derive(Debug, Clone)]
pub struct ComplexityRouter {
    routes: HashMap<Complexity, String>,
    pricing: HashMap<String, ModelPricing>,
    default_model: String,
}

impl ComplexityRouter {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            routes: HashMap::new(),
            pricing: HashMap::new(),
            default_model: default_model.into(),
        }
    }

    /// 设置复杂度等级的固定路由
    pub fn with_route(mut self, complexity: Complexity, model: impl Into<String>) -> Self {
        self.routes.insert(complexity, model.into());
        self
    }

    pub fn with_pricing(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.into(), pricing);
        self
    }

    /// 从 [strategy] 配置段构建
    pub fn from_config(section: &StrategySection) -> Self {
        let mut router = Self::new(section.default_model.clone())
            .with_route(Complexity::Trivial, section.trivial.clone())
            .with_route(Complexity::Simple, section.simple.clone())
            .with_route(Complexity::Moderate, section.moderate.clone())
            .with_route(Complexity::Complex, section.complex.clone())
            .with_route(Complexity::ContextHeavy, section.context_heavy.clone());
        for (model, price) in &section.pricing {
            router = router.with_pricing(
                model.clone(),
                ModelPricing::new(price.input_per_1k, price.output_per_1k),
            );
        }
        router
    }
}

impl Default for ComplexityRouter {
    fn default() -> Self {
        Self::from_config(&StrategySection::default())
    }
}

impl StrategySelector for ComplexityRouter {
    fn select(&self, complexity: Complexity, preferred: Option<&str>) -> String {
        if let Some(preferred) = preferred.filter(|p| !p.trim().is_empty()) {
            return preferred.to_string();
        }
        self.routes
            .get(&complexity)
            .cloned()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn estimate_cost(&self, strategy: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.pricing.get(strategy) {
            Some(price) => {
                input_tokens as f64 / 1000.0 * price.input_per_1k
                    + output_tokens as f64 / 1000.0 * price.output_per_1k
            }
            None => 0.0,
        }
    }
}
