mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use event_log::{EventSink, SecurityEvent, SecurityEventKind};
use message_sanitizer::FilterSet;
use rate_guard::RateLimiter;
use secret_vault::VaultCipher;
use ws_proxy::ProxyCoordinator;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref listen) = cli.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .context("--listen must be host:port")?;
        cfg.proxy.host = host.to_string();
        cfg.proxy.port = port.parse().context("invalid --listen port")?;
    }
    if let Some(ref upstream) = cli.upstream {
        cfg.proxy.mcp_server_url = upstream.clone();
    }
    if let Some(ref path) = cli.event_log {
        cfg.logging.event_log_path = path.clone();
    }
    if cli.strict {
        cfg.sanitization.strict_mode = true;
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.listen_addr()?,
        upstream = %cfg.proxy.mcp_server_url,
        strict_mode = cfg.sanitization.strict_mode,
        "mcproxy starting"
    );

    // 4. Start the security-event sink.
    let (events, _events_handle) = EventSink::start(&cfg.logging.event_log_path)
        .await
        .context("failed to start event log")?;

    events
        .log(SecurityEvent::new(
            SecurityEventKind::ProxyStarted,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "config_file": cli.config.display().to_string(),
            }),
        ))
        .await;

    // 5. Compile the shared filters. An invalid rule or pattern refuses to
    //    start here rather than running with a hole in the pipeline.
    let filters = Arc::new(
        FilterSet::build(
            &cfg.sanitization,
            cfg.api_key_protection.detection.clone(),
        )
        .context("failed to build sanitization filters")?,
    );

    info!(
        pattern_rules = filters.matcher.rule_count(),
        secret_patterns = filters.detector.pattern_count(),
        "sanitization filters compiled"
    );

    // 6. Derive the process-wide vault key.
    let cipher = if cfg.api_key_protection.enabled && cfg.api_key_protection.storage.encryption {
        Some(VaultCipher::from_env().context("failed to derive vault master key")?)
    } else {
        None
    };

    // 7. Shared rate limiter, with a periodic sweep for idle buckets.
    let limiter = Arc::new(RateLimiter::new(cfg.rate_limiting.clone()));
    {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(120));
            interval.tick().await;
            loop {
                interval.tick().await;
                limiter.gc();
            }
        });
    }

    // 8. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (ctrl-c)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT (ctrl-c)");
        }

        let _ = shutdown_tx_signal.send(());
    });

    // 9. Run the coordinator until shutdown.
    let coordinator = ProxyCoordinator::new(
        cfg.proxy_config()?,
        filters,
        cfg.api_key_protection.storage.clone(),
        cipher,
        limiter,
        events.clone(),
        shutdown_tx.clone(),
    );

    let result = coordinator.run().await;

    // 10. Log shutdown; the vault key and per-connection records dropped
    //     with the coordinator.
    info!("mcproxy shutting down");

    events
        .log(SecurityEvent::new(
            SecurityEventKind::ProxyStopped,
            serde_json::json!({
                "result": format!("{result:?}"),
            }),
        ))
        .await;

    drop(events);

    result
}
