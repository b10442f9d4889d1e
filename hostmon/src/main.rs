use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hostmon::config::AgentConfig;
use hostmon::scheduler::{
    LOCAL_CLIENT_ID, MAX_BUILTIN_CLIENT_ID, Manager, Request, SchedulerHandle, SchedulerService,
};
use hostmon::{logging, plugins};
use plugin_api::{ItemResult, MetricRegistry};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Requester id of the configured local items.
const CONFIGURED_ITEMS_CLIENT_ID: u64 = MAX_BUILTIN_CLIENT_ID + 1;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the agent configuration file
    #[arg(short, long, env = "HOSTMON_CONFIG")]
    config: Option<PathBuf>,

    /// Check a single item key and exit
    #[arg(short, long, value_name = "KEY", conflicts_with_all = ["print", "check_config"])]
    test: Option<String>,

    /// Print every supported metric and exit
    #[arg(short, long)]
    print: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

/// One line of agent output.
#[derive(Serialize)]
struct OutputLine<'a> {
    key: &'a str,
    #[serde(flatten)]
    result: &'a ItemResult,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    let _guard = logging::init_logging(&config.log)?;

    let mut registry = MetricRegistry::new();
    plugins::register_builtin(&mut registry).context("Failed to register built-in plugins")?;
    let registry = Arc::new(registry);

    if args.print {
        for metric in registry.metrics() {
            println!("{:<24} {}", metric.key, metric.description);
        }
        return Ok(());
    }

    let manager =
        Manager::new(registry.clone(), &config).context("Failed to initialize scheduler")?;
    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    let handle = SchedulerService::start(manager, &config.scheduler);

    if let Some(key) = args.test {
        let outcome = handle.perform_task(&key, None, LOCAL_CLIENT_ID).await;
        handle.stop().await?;
        match outcome {
            Ok(Some(value)) => println!("{:<40} [{}]", key, value),
            Ok(None) => println!("{:<40} [none]", key),
            Err(e) => println!("{:<40} [error: {}]", key, e),
        }
        return Ok(());
    }

    run_agent(handle, &config).await
}

/// Check the configured items until interrupted, printing results as JSON
/// lines.
async fn run_agent(handle: SchedulerHandle, config: &AgentConfig) -> anyhow::Result<()> {
    let (sender, mut results) = mpsc::unbounded_channel::<ItemResult>();

    let mut keys = HashMap::new();
    let mut requests = Vec::with_capacity(config.items.len());
    for (index, item) in config.items.iter().enumerate() {
        let item_id = index as u64 + 1;
        keys.insert(item_id, item.key.clone());
        requests.push(Request {
            timeout: item
                .timeout_secs
                .map(|secs| Duration::from_secs(u64::from(secs))),
            ..Request::new(item_id, item.key.clone(), item.delay.clone())
        });
    }
    if requests.is_empty() {
        warn!("No items configured, waiting for shutdown");
    }
    info!(items = requests.len(), "Agent started");
    handle
        .update_tasks(CONFIGURED_ITEMS_CLIENT_ID, Arc::new(sender), requests, None)
        .context("Failed to schedule configured items")?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal_token.cancel();
    });

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = results.recv() => {
                let Some(result) = result else { break };
                let key = keys.get(&result.item_id).map(String::as_str).unwrap_or_default();
                let line = OutputLine { key, result: &result };
                println!("{}", serde_json::to_string(&line)?);
            }
        }
    }

    handle.stop().await.context("Failed to stop scheduler")?;
    info!("Agent stopped");
    Ok(())
}
