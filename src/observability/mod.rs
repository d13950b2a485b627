//! 可观测性：tracing 订阅者初始化
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖（如 `RUST_LOG=hive=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局订阅者；重复调用（如多个测试）时静默忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
