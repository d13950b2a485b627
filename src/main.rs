//! Hive - 命令行演示
//!
//! 用 EchoInvoker 跑一个请求：`hive [--config <path>] [--breakpoints] <request...>`。
//! 启用断点时每次暂停都自动继续，最后输出最终状态摘要（JSON）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use hive::config::load_config_or_default;
use hive::core::{OrchestratorBuilder, TaskRequest, UserResponse};
use hive::llm::EchoInvoker;
use hive::notification::LoggingHandler;
use hive::observability;

struct CliArgs {
    config_path: Option<PathBuf>,
    breakpoints: bool,
    request: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut config_path = None;
    let mut breakpoints = false;
    let mut words = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "--breakpoints" => breakpoints = true,
            _ => words.push(arg),
        }
    }

    if words.is_empty() {
        bail!("usage: hive [--config <path>] [--breakpoints] <request...>");
    }
    Ok(CliArgs {
        config_path,
        breakpoints,
        request: words.join(" "),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = parse_args()?;

    let config = load_config_or_default(args.config_path);
    let orchestrator = OrchestratorBuilder::new(config, Arc::new(EchoInvoker))
        .build()
        .context("Failed to build orchestrator")?;
    orchestrator.bus().subscribe_all(Arc::new(LoggingHandler)).await;

    let task_id = format!("task_{}", uuid::Uuid::new_v4());
    let request = TaskRequest::new(&task_id, args.request).with_breakpoints(args.breakpoints);
    let mut state = orchestrator
        .start_task(request)
        .await
        .context("Task failed to start")?;

    while state.is_paused() {
        state = orchestrator
            .resume_task(&task_id, UserResponse::proceed())
            .await
            .context("Resume failed")?;
    }

    let summary = serde_json::json!({
        "task_id": state.task_id,
        "status": state.task_status,
        "milestones": state.milestones.len(),
        "passed": state.passed_count(),
        "total_cost": state.total_cost(),
        "steps": state.step_count,
        "final_result": state.final_result,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
