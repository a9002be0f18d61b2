mod cache;
mod cli;
mod fetcher;
mod http;
mod mirror;
mod parser;
mod ports;
mod probe;
mod refresh;
mod scheduler;
mod settings;
mod xray;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{Generator, generate};
use colored::*;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use cache::Cache;
use cli::{Args, Commands};
use fetcher::SourceFetcher;
use http::AppState;
use mirror::{GitMirror, PublishHook};
use ports::PortAllocator;
use probe::ProbeRunner;
use refresh::{RefreshEngine, spawn_refresh_loop};
use scheduler::{Scheduler, SchedulerConfig};
use settings::Settings;
use xray::ConfigStore;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(cmd) = args.cmd {
        match cmd {
            Commands::Completions { shell } => {
                print_completions(shell, &mut Args::command());
                return Ok(());
            }
        }
    }

    let log_level = match (args.debug, args.verbose) {
        (true, _) => "debug",
        (false, true) => "info",
        _ => "warn",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();
    args.validate().context("Invalid command line arguments")?;

    print_banner();

    let settings = Settings::from_env().context("Failed to load configuration")?;
    settings.validate().context("Invalid configuration")?;

    log::info!(
        "Configured with {} sources, engine {}, refresh every {}s, probe {}",
        settings.sub_urls.len(),
        settings.xray_path.display(),
        settings.cache_interval.as_secs(),
        settings.probe_url
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ports = Arc::new(PortAllocator::new(
        settings.port_range_start,
        settings.port_range_end,
    ));
    let configs = Arc::new(ConfigStore::new().context("Failed to initialize config store")?);
    let runner = Arc::new(ProbeRunner::new(
        settings.xray_path.clone(),
        Arc::clone(&configs),
        Arc::clone(&ports),
        settings.test_timeout,
        settings.max_delay,
    ));
    let scheduler = Scheduler::new(
        runner,
        SchedulerConfig {
            max_concurrent: settings.max_concurrent,
            batch_size: settings.batch_size,
        },
        shutdown_rx.clone(),
    );

    let cache = Arc::new(Cache::new(settings.top_k, settings.site_cache_ttl));

    let mut hooks: Vec<Arc<dyn PublishHook>> = Vec::new();
    if settings.github_push_enabled {
        let repo_url = settings.github_repo_url.clone().unwrap_or_default();
        let token = settings.github_token.clone().unwrap_or_default();
        log::info!("Mirror push enabled for {repo_url}");
        hooks.push(Arc::new(GitMirror::new(repo_url, token)));
    }

    let fetcher = SourceFetcher::new().context("Failed to initialize source fetcher")?;
    let engine = Arc::new(RefreshEngine::new(
        fetcher,
        scheduler,
        Arc::clone(&cache),
        hooks,
        settings.sub_urls.clone(),
        settings.probe_url.clone(),
        settings.low_bandwidth_cap_opt(),
    ));

    let (refresh_handle, refresh_task) = spawn_refresh_loop(
        Arc::clone(&engine),
        settings.cache_interval,
        shutdown_rx.clone(),
    );

    let state = AppState {
        cache,
        engine,
        refresh: refresh_handle,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;

    println!(
        "{} Serving on {} ({} sources, top {} of the working set)",
        "[subpool]".cyan().bold(),
        args.listen.green(),
        settings.sub_urls.len().to_string().green(),
        settings.top_k.to_string().green(),
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    // Stop launching probe jobs, let the in-flight cycle drain (bounded by
    // the per-job deadline plus kill grace), then clear the scratch dir.
    let _ = shutdown_tx.send(true);
    let drain = settings.test_timeout + probe::SHUTDOWN_GRACE + std::time::Duration::from_secs(5);
    match tokio::time::timeout(drain, refresh_task).await {
        Ok(Err(e)) => log::error!("Refresh loop ended abnormally: {e}"),
        Ok(Ok(())) => {}
        Err(_) => log::warn!("Refresh loop did not stop within {drain:?}, abandoning it"),
    }

    let leaked = ports.allocated_count();
    if leaked > 0 {
        log::warn!("{leaked} probe ports still marked allocated at shutdown");
    }

    configs
        .cleanup_all()
        .context("Failed to clean up scratch configs")?;

    println!("{} Shutdown complete", "[subpool]".cyan().bold());
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => {
            println!(
                "\n{}",
                "Received Ctrl+C, shutting down gracefully...".yellow()
            );
        }
        Err(err) => {
            log::error!("Unable to listen for shutdown signal: {err}");
        }
    }
}

fn print_completions<G: Generator>(generator: G, cmd: &mut clap::Command) {
    generate(
        generator,
        cmd,
        cmd.get_name().to_string(),
        &mut std::io::stdout(),
    );
}

fn print_banner() {
    let art = r#"
                    _                       _
          ___ _   _| |__  _ __   ___   ___ | |
         / __| | | | '_ \| '_ \ / _ \ / _ \| |
         \__ \ |_| | |_) | |_) | (_) | (_) | |
         |___/\__,_|_.__/| .__/ \___/ \___/|_|
                         |_|
    "#;

    println!("{}", art.cyan().bold());
    println!(
        "{} {}",
        "subpool".cyan().bold(),
        "- Aggregate, live-test and serve proxy subscriptions".white()
    );
    println!(
        "{} {}",
        "Note:".yellow().bold(),
        "Requires an xray-core binary; see XRAY_PATH.".yellow()
    );
}
