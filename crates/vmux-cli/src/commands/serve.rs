//! Serve command implementation
//!
//! Every accepted TCP connection carries one multiplexer on the
//! non-originating side. Each virtual connection the peer opens is echoed
//! back until the peer closes it.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use vmux::{MuxConfig, Multiplexer, VirtualConnection};

/// Bind `bind_addr` and serve until `cancel` fires
pub async fn serve_command(
    bind_addr: &str,
    config: MuxConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    serve(listener, config, cancel).await
}

/// Accept loop over an already bound listener
pub async fn serve(
    listener: TcpListener,
    config: MuxConfig,
    cancel: CancellationToken,
) -> Result<()> {
    config.validate().context("Invalid multiplexer configuration")?;

    let local_addr = listener.local_addr()?;
    tracing::info!("Echo server listening on {}", local_addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Echo server shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((socket, peer_addr)) => {
                        handle_connection(socket, peer_addr, config.clone(), cancel.clone());
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    Ok(())
}

fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: MuxConfig,
    cancel: CancellationToken,
) {
    tracing::info!("New connection from {}", peer_addr);

    if let Err(e) = socket.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let mux = match Multiplexer::with_config(socket, false, config, |conn: VirtualConnection| {
        tokio::spawn(echo(conn));
    }) {
        Ok(mux) => mux,
        Err(e) => {
            tracing::error!("Failed to start multiplexer for {}: {}", peer_addr, e);
            return;
        }
    };

    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                mux.shutdown();
                tracing::debug!("Multiplexer for {} cancelled", peer_addr);
                return;
            }
            result = mux.run() => result
        };

        match result {
            Ok(()) => {
                tracing::info!("Connection from {} closed normally", peer_addr);
            }
            Err(e) => {
                tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
            }
        }
    });
}

/// Write back everything read until the peer closes the stream
async fn echo(conn: VirtualConnection) {
    let id = conn.id();
    let mut buf = vec![0u8; 4096];
    let mut total = 0usize;

    let result = async {
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            conn.write(&buf[..n]).await?;
            conn.flush().await?;
            total += n;
        }
        conn.close().await
    }
    .await;

    match result {
        Ok(()) => tracing::debug!("{}: echoed {} bytes", id, total),
        Err(e) => tracing::debug!("{}: echo ended after {} bytes: {}", id, total, e),
    }
}
