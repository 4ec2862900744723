mod agent;
mod browser;
mod cli;
mod config;
mod logging;
mod mcp;
mod session;
mod shutdown;
mod state;
#[cfg(test)]
mod test_utils;

use agent::ProcessAgentFactory;
use anyhow::Context;
use browser::ChromiumLauncher;
use clap::Parser;
use cli::Args;
use logging::{init_tracing, LogOptions};
use mcp::ProxyHandler;
use rmcp::model::{Implementation, ServerCapabilities, ServerInfo};
use rmcp::ServiceExt;
use shutdown::spawn_shutdown_handler;
use state::build_settings;
use std::sync::Arc;
use task_runtime::TaskEndpoint;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(&LogOptions::from_args(&args))?;
    let settings = build_settings(&args)?;
    tracing::info!(
        time_budget = %humantime::format_duration(settings.supervisor.time_budget),
        max_steps = settings.supervisor.max_steps,
        profile_root = %settings.supervisor.profile_root.display(),
        browser = %settings.browser.binary.display(),
        agent = %settings.agent.program,
        "browser-task-proxy starting"
    );

    let shutdown = CancellationToken::new();
    spawn_shutdown_handler(shutdown.clone());

    let endpoint = TaskEndpoint::new(
        Arc::new(settings.supervisor),
        Arc::new(ChromiumLauncher::new(settings.browser)),
        Arc::new(ProcessAgentFactory::new(settings.agent)),
    )
    .with_shutdown(shutdown.clone());

    let handler = ProxyHandler::new(endpoint.clone(), server_info());
    let running = handler
        .serve(rmcp::transport::stdio())
        .await
        .context("failed to start MCP server")?;
    let service = running.cancellation_token();

    tokio::select! {
        result = running.waiting() => {
            let reason = result.context("MCP server task failed")?;
            tracing::info!(reason = ?reason, "client session ended");
        }
        _ = shutdown.cancelled() => {
            service.cancel();
        }
    }

    if !endpoint.shutdown(args.shutdown_grace).await {
        tracing::warn!("exiting with tasks still cleaning up");
    }
    Ok(())
}

fn server_info() -> ServerInfo {
    ServerInfo {
        capabilities: ServerCapabilities::builder()
            .enable_tools()
            .enable_logging()
            .build(),
        server_info: Implementation {
            name: "browser-task-proxy".to_string(),
            title: Some("Browser Task Proxy".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        },
        instructions: Some(
            "Use perform_task to run a browser task in the background. The call returns at once; follow the logging notifications with the returned request_id until one has is_last=true. Use list_tasks to see tasks still running."
                .to_string(),
        ),
        ..Default::default()
    }
}
