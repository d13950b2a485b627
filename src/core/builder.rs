//! 编排器构建器：统一的组件装配
//!
//! 所有入口（CLI、测试、嵌入方）共用同一套装配逻辑；
//! 未显式提供的组件按 AppConfig 选择默认实现。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{Orchestrator, OrchestratorError, OrchestratorSettings, PauseController, RecoveryPolicy};
use crate::llm::{CapabilityInvoker, ComplexityRouter, InvokerSummarizer, StrategySelector, Summarizer};
use crate::memory::{ContextBudgetPolicy, ContextCompactor, LongTermMemory, NoopLongTerm};
use crate::notification::NotificationBus;
use crate::roles::{Executor, Planner, Validator};
use crate::store::{
    CheckpointStore, MemoryCheckpointStore, MemoryTaskStore, SqliteCheckpointStore, TaskStore,
};
use crate::workflow::WaveRunner;

pub struct OrchestratorBuilder {
    config: AppConfig,
    invoker: Arc<dyn CapabilityInvoker>,
    summarizer: Option<Arc<dyn Summarizer>>,
    strategy: Option<Arc<dyn StrategySelector>>,
    long_term: Option<Arc<dyn LongTermMemory>>,
    task_store: Option<Arc<dyn TaskStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    bus: Option<Arc<NotificationBus>>,
    pause: Option<Arc<PauseController>>,
}

impl OrchestratorBuilder {
    /// 所有角色共用同一个能力调用器
    pub fn new(config: AppConfig, invoker: Arc<dyn CapabilityInvoker>) -> Self {
        Self {
            config,
            invoker,
            summarizer: None,
            strategy: None,
            long_term: None,
            task_store: None,
            checkpoints: None,
            bus: None,
            pause: None,
        }
    }

    /// 默认用调用器的 Summarizer 角色
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// 默认按 [strategy] 配置构建 ComplexityRouter
    pub fn with_strategy(mut self, strategy: Arc<dyn StrategySelector>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_long_term(mut self, long_term: Arc<dyn LongTermMemory>) -> Self {
        self.long_term = Some(long_term);
        self
    }

    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    /// 默认：配置了 store.checkpoint_path 时用 SQLite，否则用内存
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_bus(mut self, bus: Arc<NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_pause_controller(mut self, pause: Arc<PauseController>) -> Self {
        self.pause = Some(pause);
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let settings = OrchestratorSettings::from(&self.config.orchestrator);

        let checkpoints: Arc<dyn CheckpointStore> = match self.checkpoints {
            Some(store) => store,
            None => match &self.config.store.checkpoint_path {
                Some(path) => Arc::new(SqliteCheckpointStore::open(path)?),
                None => Arc::new(MemoryCheckpointStore::new()),
            },
        };
        let long_term = self
            .long_term
            .unwrap_or_else(|| Arc::new(NoopLongTerm));
        let bus = self.bus.unwrap_or_else(|| Arc::new(NotificationBus::new()));
        let summarizer = self
            .summarizer
            .unwrap_or_else(|| Arc::new(InvokerSummarizer::new(self.invoker.clone())));
        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(ComplexityRouter::from_config(&self.config.strategy)));

        let planner = Arc::new(Planner::new(self.invoker.clone()).with_long_term(long_term.clone()));
        let policy = ContextBudgetPolicy::new(self.config.context.target_ratio);

        tracing::debug!(
            max_retries = settings.max_retries,
            worker_pool_size = settings.worker_pool_size,
            target_ratio = policy.target_ratio(),
            "Orchestrator assembled"
        );

        Ok(Orchestrator {
            recovery: RecoveryPolicy::new(planner.clone(), bus.clone()),
            planner,
            executor: Executor::new(self.invoker.clone()),
            validator: Validator::new(self.invoker),
            compactor: ContextCompactor::new(policy, summarizer),
            strategy,
            long_term,
            task_store: self
                .task_store
                .unwrap_or_else(|| Arc::new(MemoryTaskStore::new())),
            checkpoints,
            bus,
            pause: self.pause.unwrap_or_default(),
            waves: WaveRunner::new(settings.worker_pool_size),
            settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::EchoInvoker;

    #[test]
    fn test_defaults_follow_config() {
        let mut config = AppConfig::default();
        config.orchestrator.max_retries = 5;
        config.orchestrator.worker_pool_size = 0;
        let orchestrator = OrchestratorBuilder::new(config, Arc::new(EchoInvoker))
            .build()
            .unwrap();
        assert_eq!(orchestrator.settings().max_retries, 5);
        assert_eq!(orchestrator.settings().worker_pool_size, 1);
    }

    #[test]
    fn test_sqlite_checkpoints_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.store.checkpoint_path = Some(dir.path().join("state").join("checkpoints.db"));
        OrchestratorBuilder::new(config, Arc::new(EchoInvoker))
            .build()
            .unwrap();
        assert!(dir.path().join("state").join("checkpoints.db").exists());
    }
}
