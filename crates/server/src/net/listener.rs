//! TCP listener
//!
//! Binds the USB/IP port and feeds accepted connections into sessions.
//! One importer at a time: while a session is active, further connections
//! are rejected immediately (closed without a byte of protocol), rather
//! than queued, so a stuck importer cannot starve the next one silently.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::session::run_session;
use crate::usb::Registry;

/// IANA-assigned USB/IP port.
pub const USBIP_PORT: u16 = 3240;

/// Bind `bind_addr:port` and serve sessions until the task is cancelled.
pub async fn run(registry: Arc<Registry>, bind_addr: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind((bind_addr, port))
        .await
        .with_context(|| format!("could not bind {bind_addr}:{port}"))?;
    info!("listening on {}", listener.local_addr()?);
    serve(listener, registry).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>) -> Result<()> {
    let active = Arc::new(AtomicBool::new(false));

    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;

        if active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            info!(%peer, "rejecting connection, a session is already active");
            continue;
        }

        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer, "could not disable Nagle: {e}");
        }
        info!(%peer, "importer connected");

        let registry = registry.clone();
        let active = active.clone();
        tokio::spawn(async move {
            match run_session(stream, registry).await {
                Ok(()) => info!(%peer, "session closed"),
                Err(e) => warn!(%peer, "session failed: {e:#}"),
            }
            active.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const OP_REQ_DEVLIST: [u8; 8] = [0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00];

    async fn start() -> std::net::SocketAddr {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(Registry::new());
        tokio::spawn(async move {
            let _ = serve(listener, registry).await;
        });
        addr
    }

    #[tokio::test]
    async fn serves_one_session_and_rejects_a_second() {
        let addr = start().await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(&OP_REQ_DEVLIST).await.unwrap();
        let mut reply = [0u8; 12];
        timeout(Duration::from_secs(2), first.read_exact(&mut reply)).await.unwrap().unwrap();
        assert_eq!(&reply[0..4], &[0x01, 0x11, 0x00, 0x05]);

        // A concurrent connection is closed without any protocol bytes.
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(&OP_REQ_DEVLIST).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("reject should close the socket promptly")
            .unwrap_or(0);
        assert_eq!(n, 0);

        // Once the first session ends, the next importer gets through.
        drop(first);
        let mut third = timeout(Duration::from_secs(2), async {
            loop {
                let mut candidate = TcpStream::connect(addr).await.unwrap();
                candidate.write_all(&OP_REQ_DEVLIST).await.unwrap();
                let mut reply = [0u8; 12];
                match candidate.read_exact(&mut reply).await {
                    Ok(_) => break candidate,
                    Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await
        .expect("listener did not recover after session close");
        third.shutdown().await.unwrap();
    }
}
