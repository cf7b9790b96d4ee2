//! Send command implementation

use anyhow::{bail, Context, Result};
use futures::future::try_join_all;
use tokio::net::TcpStream;
use vmux::{MuxConfig, Multiplexer, StreamId, VirtualConnection};

/// Connect to `connect_addr`, echo `message` over `streams` virtual
/// connections and print each reply
pub async fn send_command(
    connect_addr: &str,
    config: MuxConfig,
    streams: usize,
    message: &str,
) -> Result<()> {
    let replies = exchange(connect_addr, config, streams, message.as_bytes()).await?;

    for (id, reply) in replies {
        println!("{}: {}", id, String::from_utf8_lossy(&reply));
    }
    Ok(())
}

/// Send `message` on `streams` concurrent virtual connections and collect
/// the echoes in open order
pub async fn exchange(
    connect_addr: &str,
    config: MuxConfig,
    streams: usize,
    message: &[u8],
) -> Result<Vec<(StreamId, Vec<u8>)>> {
    let socket = TcpStream::connect(connect_addr)
        .await
        .with_context(|| format!("Failed to connect to {}", connect_addr))?;
    socket.set_nodelay(true)?;
    tracing::info!("Connected to {}", connect_addr);

    let mux = Multiplexer::with_config(socket, true, config, |conn: VirtualConnection| {
        tracing::warn!("{}: refusing connection opened by the server", conn.id());
    })?;
    let run = tokio::spawn({
        let mux = mux.clone();
        async move { mux.run().await }
    });

    let result = try_join_all((0..streams).map(|_| round_trip(&mux, message))).await;

    mux.shutdown();
    match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Multiplexer stopped with error: {}", e),
        Err(e) => tracing::warn!("Multiplexer task failed: {}", e),
    }

    result
}

async fn round_trip(mux: &Multiplexer, message: &[u8]) -> Result<(StreamId, Vec<u8>)> {
    let conn = mux
        .open_connection()
        .await
        .context("Failed to open virtual connection")?;
    let id = conn.id();

    // Read while writing: the echo only flows once this side grants credit
    let send = async {
        conn.write(message).await?;
        conn.flush().await
    };
    let (sent, reply) = tokio::join!(send, read_reply(&conn, message.len()));
    sent?;
    let reply = reply?;

    conn.close().await?;
    tracing::debug!("{}: received {} byte echo", id, reply.len());
    Ok((id, reply))
}

async fn read_reply(conn: &VirtualConnection, len: usize) -> Result<Vec<u8>> {
    let mut reply = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = conn.read(&mut reply[filled..]).await?;
        if n == 0 {
            bail!("{} closed after {} of {} bytes", conn.id(), filled, len);
        }
        filled += n;
    }
    Ok(reply)
}
