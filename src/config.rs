//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__MAX_RETRIES=5`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub context: ContextSection,
    pub strategy: StrategySection,
    pub store: StoreSection,
}

/// [orchestrator] 段：重试上限、波次并发度、默认上下文预算
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 单个里程碑 QA retry 的上限（第 max_retries + 1 次 retry 升级为 fail）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 波次模式下同时执行的里程碑数
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_max_context_tokens")]
    pub default_max_context_tokens: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_max_context_tokens() -> usize {
    100_000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            worker_pool_size: default_worker_pool_size(),
            default_max_context_tokens: default_max_context_tokens(),
        }
    }
}

/// [context] 段：压缩后保留后缀最多占预算的比例（触发阈值 85% 固定）
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,
}

fn default_target_ratio() -> f64 {
    crate::memory::DEFAULT_TARGET_RATIO
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            target_ratio: default_target_ratio(),
        }
    }
}

/// [strategy] 段：复杂度等级 → 模型 ID，以及模型单价
#[derive(Debug, Clone, Deserialize)]
pub struct StrategySection {
    #[serde(default = "default_strategy_model")]
    pub default_model: String,
    #[serde(default = "default_light_model")]
    pub trivial: String,
    #[serde(default = "default_light_model")]
    pub simple: String,
    #[serde(default = "default_strategy_model")]
    pub moderate: String,
    #[serde(default = "default_heavy_model")]
    pub complex: String,
    #[serde(default = "default_heavy_model")]
    pub context_heavy: String,
    /// [strategy.pricing.<model>]
    #[serde(default = "default_pricing")]
    pub pricing: HashMap<String, PricingEntry>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct PricingEntry {
    #[serde(default)]
    pub input_per_1k: f64,
    #[serde(default)]
    pub output_per_1k: f64,
}

fn default_light_model() -> String {
    "deepseek-chat".to_string()
}

fn default_strategy_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_heavy_model() -> String {
    "deepseek-reasoner".to_string()
}

fn default_pricing() -> HashMap<String, PricingEntry> {
    HashMap::from([
        (
            default_light_model(),
            PricingEntry {
                input_per_1k: 0.00027,
                output_per_1k: 0.0011,
            },
        ),
        (
            default_strategy_model(),
            PricingEntry {
                input_per_1k: 0.00015,
                output_per_1k: 0.0006,
            },
        ),
        (
            default_heavy_model(),
            PricingEntry {
                input_per_1k: 0.00055,
                output_per_1k: 0.00219,
            },
        ),
    ])
}

impl Default for StrategySection {
    fn default() -> Self {
        Self {
            default_model: default_strategy_model(),
            trivial: default_light_model(),
            simple: default_light_model(),
            moderate: default_strategy_model(),
            complex: default_heavy_model(),
            context_heavy: default_heavy_model(),
            pricing: default_pricing(),
        }
    }
}

/// [store] 段：检查点 SQLite 路径，未设置时使用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub checkpoint_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时回落到默认配置并记录告警
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load config, falling back to defaults");
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.max_retries, 3);
        assert_eq!(cfg.orchestrator.worker_pool_size, 4);
        assert_eq!(cfg.orchestrator.default_max_context_tokens, 100_000);
        assert!((cfg.context.target_ratio - 0.5).abs() < f64::EPSILON);
        assert!(cfg.store.checkpoint_path.is_none());
        assert!(cfg.strategy.pricing.contains_key(&cfg.strategy.complex));
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[orchestrator]\nmax_retries = 5\n\n[strategy]\ncomplex = \"big-model\"\n\n[strategy.pricing.big-model]\ninput_per_1k = 1.0\noutput_per_1k = 2.0"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.max_retries, 5);
        assert_eq!(cfg.orchestrator.worker_pool_size, 4);
        assert_eq!(cfg.strategy.complex, "big-model");
        assert_eq!(
            cfg.strategy.pricing.get("big-model"),
            Some(&PricingEntry {
                input_per_1k: 1.0,
                output_per_1k: 2.0
            })
        );
    }
}
