//! Authoritative TCP server for networked two-player Othello.
//!
//! [`rules`] is the pure game engine, [`codec`] is the wire format, and
//! [`registry`]/[`session`] are the concurrent core that [`server`]'s
//! per-connection tasks drive. [`config`] is the only place the process
//! environment is read.

pub mod codec;
pub mod config;
pub mod registry;
pub mod rules;
pub mod server;
pub mod session;

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::session::SessionManager;

/// Process-level failures that are not a client's fault and have no wire
/// representation: a bind failure is fatal to the whole process, not a
/// per-connection status code.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Binds the listener and serves connections until the process is killed.
/// Each accepted connection is handed to its own task; the listener itself
/// never stops accepting because one connection misbehaves.
pub async fn run(config: Config) -> Result<(), ServerError> {
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;
    info!(addr = %config.bind_addr, "listening");

    let sessions = Arc::new(SessionManager::new());

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(%err, "accept failed");
                continue;
            }
        };
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            server::handle_connection(stream, peer_addr, sessions).await;
        });
    }
}
