//! PING/PONG health probing: the dialing side used by the supervision loop
//! and the listening side that makes this replica probeable by its peers.

use std::time::Duration;

use anyhow::{Context, Result};
use common::log_error;
use common::wire::{PING, PONG};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Dial-side health checker. Stateless; a probe either completes within its
/// deadlines or the target counts as dead.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    dial_timeout: Duration,
    read_timeout: Duration,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(2))
    }
}

impl HealthProbe {
    pub fn new(dial_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            read_timeout,
        }
    }

    /// Connect, send PING, expect PONG. Every failure mode is `false`; the
    /// caller treats the absence of PONG as the signal, never as an error.
    pub async fn is_alive(&self, host: &str, port: u16) -> bool {
        let addr = format!("{host}:{port}");
        let Ok(Ok(mut stream)) = timeout(self.dial_timeout, TcpStream::connect(&addr)).await
        else {
            debug!(addr, "health dial failed");
            return false;
        };
        if !matches!(
            timeout(self.read_timeout, stream.write_all(PING)).await,
            Ok(Ok(()))
        ) {
            debug!(addr, "failed to send PING");
            return false;
        }
        let mut buf = [0u8; 4];
        match timeout(self.read_timeout, stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) if buf == PONG => true,
            Ok(Ok(_)) => {
                debug!(addr, "unexpected health reply");
                false
            }
            _ => {
                debug!(addr, "no health reply within the deadline");
                false
            }
        }
    }
}

/// Binds the health listener. Failure here is fatal at startup.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health server on {addr}"))?;
    info!(addr, "health server listening");
    Ok(listener)
}

/// Accept loop: one task per connection, PONG for PING, silence for
/// everything else. The server has no shared state.
pub async fn serve(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    log_error!(handle(stream).await);
                });
            }
            Err(e) => warn!("health accept failed: {e}"),
        }
    }
}

async fn handle(mut stream: TcpStream) -> Result<()> {
    let mut buf = [0u8; 4];
    let n = timeout(SERVER_READ_TIMEOUT, stream.read(&mut buf))
        .await
        .context("health read deadline expired")?
        .context("failed to read health request")?;
    if &buf[..n] == PING {
        stream
            .write_all(PONG)
            .await
            .context("failed to reply PONG")?;
    }
    Ok(())
}
