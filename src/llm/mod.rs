//! 能力层：外部协作者抽象（能力调用 / 摘要 / 策略选择）与 Mock 实现

pub mod mock;
pub mod router;
pub mod traits;

pub use mock::{EchoInvoker, ScriptedInvoker};
pub use router::{ComplexityRouter, ModelPricing};
pub use traits::{
    CapabilityInvoker, CapabilityRequest, CapabilityRole, InvokeError, Invocation,
    InvokerSummarizer, StrategySelector, Summarizer,
};
