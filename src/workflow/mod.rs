//! 工作项依赖图与波次调度

pub mod engine;
pub mod graph;
pub mod types;

pub use engine::{WaveReport, WaveRunner};
pub use graph::{Batches, WorkItemGraph};
pub use types::*;
