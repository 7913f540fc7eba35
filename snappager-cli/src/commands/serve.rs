// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `snappager serve` command - Serve page faults for one VM.
//!
//! The page server itself is synchronous. It runs on a dedicated thread while
//! the async side waits for it or for a shutdown signal. That thread is never
//! joined after a signal, since it may be blocked in `accept` or `poll`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use snappager_core::config::RawChunkStoreConfig;
use snappager_core::{
    start_uffd_handler_with_peer, ChunkStore, ConfigLoader, PagerConfig, PagerError, PeerProcess,
    RawPagerConfig,
};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

use crate::ServeArgs;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Pager(#[from] PagerError),

    #[error("Failed to spawn page server thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Page server thread exited without a result")]
    ThreadLost,

    #[error("Failed to listen for shutdown signals: {0}")]
    Signal(#[source] std::io::Error),
}

/// How a serve session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The hypervisor closed the handshake socket.
    Disconnected,
    /// A shutdown signal arrived first.
    Interrupted,
}

/// Resolve the flags into a validated configuration.
pub fn resolve_config(args: ServeArgs) -> Result<PagerConfig, PagerError> {
    if let Some(path) = &args.config {
        return ConfigLoader::load_file(path);
    }

    let chunk_store = args.chunk_dir.map(|root| RawChunkStoreConfig {
        root,
        chunk_size: args.chunk_size,
    });

    ConfigLoader::validate(RawPagerConfig {
        socket_path: args.socket.unwrap_or_default(),
        memory_file: args.memory_file.unwrap_or_default(),
        trace_file: args.trace_file,
        working_set_file: args.working_set_file,
        threads: args.threads,
        lazy: args.lazy,
        chunk_store,
    })
}

/// Remove the handshake socket and SIGTERM the hypervisor, if one connected.
pub fn shutdown_peer(socket_path: &Path, peer: &PeerProcess) {
    if let Err(e) = std::fs::remove_file(socket_path) {
        tracing::debug!(error = %e, "Handshake socket already gone");
    }
    match peer.terminate() {
        Ok(true) => {}
        Ok(false) => tracing::debug!("No hypervisor connected"),
        Err(e) => tracing::warn!(error = %e, "Failed to terminate hypervisor"),
    }
}

/// Run the page server until it returns or `shutdown` resolves.
pub async fn serve_until<S>(
    config: PagerConfig,
    chunk_store: Option<Arc<dyn ChunkStore>>,
    peer: Arc<PeerProcess>,
    shutdown: S,
) -> Result<Outcome, ServeError>
where
    S: Future<Output = std::io::Result<()>>,
{
    let socket_path = config.socket_path.clone();
    let server_peer = Arc::clone(&peer);
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("page-server".to_string())
        .spawn(move || {
            let result = start_uffd_handler_with_peer(&config, chunk_store, &server_peer);
            // Nobody is listening once a shutdown signal won.
            let _ = done_tx.send(result);
        })
        .map_err(ServeError::Spawn)?;

    tokio::select! {
        result = done_rx => {
            result.map_err(|_| ServeError::ThreadLost)??;
            Ok(Outcome::Disconnected)
        }
        signalled = shutdown => {
            signalled.map_err(ServeError::Signal)?;
            shutdown_peer(&socket_path, &peer);
            Ok(Outcome::Interrupted)
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn wait_for_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

pub async fn execute(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Fail fast on invalid config before binding anything
    let config = resolve_config(args)?;
    let chunk_store = config.open_chunk_store()?;

    tracing::info!(
        socket = %config.socket_path.display(),
        memory_file = %config.memory_file.display(),
        lazy = config.lazy,
        threads = config.threads,
        "Starting page server"
    );

    let peer = Arc::new(PeerProcess::new());
    match serve_until(config, chunk_store, peer, wait_for_signal()).await {
        Ok(Outcome::Disconnected) => {
            tracing::info!("Hypervisor disconnected, page server stopped");
            Ok(())
        }
        Ok(Outcome::Interrupted) => {
            println!();
            println!("Shutting down...");
            tracing::info!("Shutting down page server");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Page server failed");
            Err(e.into())
        }
    }
}
