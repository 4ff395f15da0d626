//! `gatekeeper serve`: wire store, processor, ingress, engine and HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gatekeeper::config::{GatekeeperConfig, StoreBackend};
use gatekeeper::engine::{EngineDispatcher, ProcessEngine, engine_queue};
use gatekeeper::gatekeeper::Gatekeeper;
use gatekeeper::models::{RunMessage, StatusUpdate};
use gatekeeper::processor::StreamMergeProcessor;
use gatekeeper::server::{self, AppState};
use gatekeeper::store;
use gatekeeper::telemetry;
use gatekeeper::transport::sink::{FanoutSink, JsonlSink};
use gatekeeper::transport::{channel, tcp};

/// CLI values layered over the file and environment.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub command_addr: Option<String>,
    pub status_addr: Option<String>,
    pub db_path: Option<PathBuf>,
    pub verbose: bool,
}

fn resolve_config(config_path: &Path, overrides: ServeOverrides) -> Result<GatekeeperConfig> {
    let mut config = GatekeeperConfig::load_or_default(config_path)?;
    config.apply_env();

    if let Some(addr) = overrides.command_addr {
        config.ingress.command_addr = addr;
    }
    if let Some(addr) = overrides.status_addr {
        config.ingress.status_addr = addr;
    }
    if let Some(path) = overrides.db_path {
        config.store.backend = StoreBackend::Sqlite;
        config.store.path = path;
    }
    if overrides.verbose {
        config.logging.level = "debug".to_string();
    }
    Ok(config)
}

async fn bind(addr: &str, what: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} ingress to {}", what, addr))
}

pub async fn cmd_serve(config_path: &Path, overrides: ServeOverrides) -> Result<()> {
    let config = resolve_config(config_path, overrides)?;
    telemetry::init_tracing(&config.logging);
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let store = store::from_config(&config.store)?;
    info!(backend = ?config.store.backend, "run store ready");
    let gatekeeper =
        Gatekeeper::new(Arc::clone(&store)).with_conflict_retries(config.conflict_retries());

    let capacity = config.processor.channel_capacity;
    let (commands, command_stream) = channel::channel::<RunMessage>(capacity);
    let (statuses, status_stream) = channel::channel::<StatusUpdate>(capacity);

    let mut sink = FanoutSink::new();
    if let Some(path) = &config.output.path {
        let jsonl = JsonlSink::open(path)
            .await
            .with_context(|| format!("Failed to open output file {}", path.display()))?;
        sink = sink.with(Arc::new(jsonl));
    }

    // The dispatcher outlives the processor so queued engine work drains.
    let engine_stop = CancellationToken::new();
    let dispatcher = match &config.engine.command {
        Some(command) => {
            let (engine_sink, engine_rx) = engine_queue(capacity);
            sink = sink.with(Arc::new(engine_sink));
            let engine = Arc::new(ProcessEngine::new(command.clone(), statuses.clone()));
            info!(command = %command, "process engine enabled");
            Some(EngineDispatcher::new(engine, statuses.clone()).spawn(engine_rx, engine_stop.clone()))
        }
        None => None,
    };

    let processor =
        StreamMergeProcessor::new(gatekeeper, Arc::new(sink), config.processor.max_in_flight);
    let handle = Arc::new(processor.spawn(command_stream, status_stream));

    let shutdown = CancellationToken::new();
    let command_listener = bind(&config.ingress.command_addr, "command").await?;
    let status_listener = bind(&config.ingress.status_addr, "status").await?;
    let mut background = vec![
        tokio::spawn(tcp::serve_ingress(
            command_listener,
            commands.sender(),
            shutdown.child_token(),
        )),
        tokio::spawn(tcp::serve_ingress(
            status_listener,
            statuses.sender(),
            shutdown.child_token(),
        )),
    ];

    let state = Arc::new(AppState {
        store,
        processor: Arc::clone(&handle),
    });
    let mut http = tokio::spawn({
        let addr = config.server.addr.clone();
        let token = shutdown.child_token();
        async move { server::start_server(&addr, state, token).await }
    });

    let http_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("shutting down");
            None
        }
        result = &mut http => Some(result),
    };

    shutdown.cancel();
    for task in background.drain(..) {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "ingress stopped with an error"),
            Err(e) => warn!(error = %e, "ingress task panicked"),
            Ok(Ok(())) => {}
        }
    }
    let http_result = match http_result {
        Some(result) => result,
        None => http.await,
    };
    drop(commands);
    drop(statuses);

    match Arc::try_unwrap(handle) {
        Ok(handle) => handle.shutdown().await,
        Err(handle) => handle.cancellation().cancel(),
    }
    engine_stop.cancel();
    if let Some(dispatcher) = dispatcher {
        let _ = dispatcher.await;
    }

    http_result.context("HTTP server task panicked")?
}
