//! Minimal binary shim: loads a profile, builds an `Orchestrator`, and
//! exposes `find`/`run` over stdin so the crate is runnable end-to-end.
//! Initialization follows `main.rs`'s `tracing_subscriber` setup
//! (`RUST_LOG`, falling back to a sensible per-crate default, `pretty()`
//! output) — the outward-facing MCP server itself is out of scope (see
//! SPEC_FULL.md's Non-goals), this just drives the core directly.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use ncp_core::cache::CapabilityCache;
use ncp_core::config_provider::OsConfigProvider;
use ncp_core::embedding::EmbeddingCache;
use ncp_core::health::HealthMonitor;
use ncp_core::profile::load_profile_from_path;
use ncp_core::Orchestrator;

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,ncp_core=debug"))
        .unwrap();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .pretty()
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cp = OsConfigProvider;
    ncp_logging::init_once_with(&cp);

    let profile_path = std::env::args().nth(1).ok_or_else(|| {
        anyhow::anyhow!("usage: ncp <profile.json>")
    })?;
    let endpoints = load_profile_from_path(std::path::Path::new(&profile_path))?;

    let health = HealthMonitor::load(&cp);
    let cache = EmbeddingCache::load(&cp, 256);
    let capability_cache = CapabilityCache::load(&cp);
    let orchestrator = Arc::new(
        Orchestrator::new(health, cache, capability_cache)
            .with_logger(Arc::new(ncp_logging::DuckDbPublisher::default())),
    );

    tracing::info!(target = "ncp_cli", endpoints = endpoints.len(), "initializing");
    orchestrator.initialize(endpoints).await?;

    run_repl(orchestrator.clone()).await?;

    orchestrator.cleanup().await?;
    ncp_logging::force_flush_and_checkpoint().await;
    Ok(())
}

/// `find <query>` / `run <endpoint:tool> <json-args>` / `resources` / `prompts` / `quit`.
async fn run_repl(orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    let stdin = io::stdin();
    print!("ncp> ");
    io::stdout().flush().ok();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            print!("ncp> ");
            io::stdout().flush().ok();
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        if let Some(query) = line.strip_prefix("find ") {
            match orchestrator.find(query, 5, false).await {
                Ok(results) => {
                    for (descriptor, score) in results {
                        println!("{:.4}  {}", score, descriptor.qualified_id());
                    }
                }
                Err(e) => eprintln!("error: {e}"),
            }
        } else if line == "resources" {
            for r in orchestrator.list_resources().await {
                println!("{}:{} ({})", r.endpoint_name, r.uri, r.name);
            }
        } else if line == "prompts" {
            for p in orchestrator.list_prompts().await {
                println!("{}:{}", p.endpoint_name, p.prompt_name);
            }
        } else if let Some(rest) = line.strip_prefix("run ") {
            let mut parts = rest.splitn(2, ' ');
            let qualified = parts.next().unwrap_or_default();
            let args = parts
                .next()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()
                .unwrap_or(None);
            match orchestrator.run(qualified, args).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default()),
                Err(e) => eprintln!("error: {e}"),
            }
        } else {
            eprintln!("unrecognized command: {line}");
        }

        print!("ncp> ");
        io::stdout().flush().ok();
    }
    Ok(())
}
