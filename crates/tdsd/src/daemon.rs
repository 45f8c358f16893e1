//! Daemon lifecycle: secret, key server, solver task, TCP sessions, metrics

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tds_core::config::TdsConfig;
use tds_core::types::KEY_SIZE;
use tds_core::TdsError;
use tds_crypto::ServerSecret;
use tds_keys::{FramedChannel, KeyServer};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{KeyServerMetrics, MetricsState};

pub async fn run(config: TdsConfig) -> Result<()> {
    info!("daemon starting");

    let secret_file = config.key_server.secret_file.clone();
    let secret = tokio::task::spawn_blocking(move || ServerSecret::load_or_create(&secret_file))
        .await
        .context("loading server secret")??;

    let server = KeyServer::new(&config.key_server, secret);
    let cancel = CancellationToken::new();

    let solver = tokio::spawn(server.solver().run(cancel.clone()));

    let mut registry = Registry::default();
    let metrics = KeyServerMetrics::new(&mut registry);
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = MetricsState {
            registry: Arc::new(registry),
            metrics: metrics.clone(),
            server: server.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let listener = TcpListener::bind(&config.daemon.listen)
        .await
        .with_context(|| format!("binding key server on {}", config.daemon.listen))?;
    info!(addr = %config.daemon.listen, "key server listening");
    warn!("key exchange runs over plain length-framed TCP; terminate TLS in front of tdsd");

    // responses carry 32-byte keys, so they bound the frame size
    let max_frame = config.key_server.max_batch_keys * KEY_SIZE;
    let accept = tokio::spawn(serve(
        listener,
        server.clone(),
        metrics,
        max_frame,
        cancel.clone(),
    ));

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    cancel.cancel();
    log_join("accept loop", accept.await);
    log_join("threshold solver", solver.await);

    info!(threshold = server.threshold(), "tdsd exiting cleanly");
    Ok(())
}

/// Report a background task that panicked or was aborted. True on a clean exit.
fn log_join(task: &str, joined: Result<(), JoinError>) -> bool {
    match joined {
        Ok(()) => true,
        Err(e) if e.is_panic() => {
            error!(task, "task panicked: {e}");
            false
        }
        Err(e) => {
            error!(task, "task failed to complete: {e}");
            false
        }
    }
}

/// Accept connections until cancelled, one session task per client.
pub async fn serve(
    listener: TcpListener,
    server: KeyServer,
    metrics: KeyServerMetrics,
    max_frame: usize,
    cancel: CancellationToken,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, "set_nodelay failed: {e}");
                }

                let server = server.clone();
                let metrics = metrics.clone();
                sessions.spawn(async move {
                    metrics.sessions.inc();
                    metrics.active_sessions.inc();
                    debug!(%peer, "session opened");

                    let channel = FramedChannel::with_max_frame(stream, max_frame);
                    match server.serve_session(channel).await {
                        Ok(stats) => {
                            metrics.record_session(&stats);
                            info!(
                                %peer,
                                batches = stats.batches,
                                popular = stats.popular,
                                unpopular = stats.unpopular,
                                "session closed"
                            );
                        }
                        Err(TdsError::Protocol(msg)) => {
                            metrics.rejected_batches.inc();
                            warn!(%peer, "session terminated: {msg}");
                        }
                        Err(e) => {
                            metrics.session_errors.inc();
                            warn!(%peer, "session failed: {e}");
                        }
                    }
                    metrics.active_sessions.dec();
                });
            }
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    error!("session task panicked: {e}");
                }
            }
        }
    }

    if !sessions.is_empty() {
        info!(open = sessions.len(), "closing open sessions");
    }
    sessions.shutdown().await;
}
