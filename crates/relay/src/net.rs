//! Listener and dialer shared by both relay roles

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::{RelayError, Result};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| RelayError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Dial `addr` over TCP, optionally bounded by `timeout`.
pub async fn connect(addr: &str, timeout: Option<Duration>) -> Result<TcpStream> {
    let attempt = TcpStream::connect(addr);
    let connected = match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| RelayError::ConnectTimeout(addr.to_string()))?,
        None => attempt.await,
    };

    let stream = connected.map_err(|source| RelayError::ConnectFailed {
        addr: addr.to_string(),
        source,
    })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    Ok(stream)
}

/// Accept connections until `shutdown` is cancelled, running `handler` for
/// each one in its own task.
///
/// Accept errors are logged and the loop keeps going. Cancellation drops the
/// listener; connections already handed to `handler` are left to finish on
/// their own.
pub async fn serve<H, Fut>(listener: TcpListener, shutdown: CancellationToken, handler: H) -> Result<()>
where
    H: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("accept loop cancelled");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "set_nodelay failed");
                    }
                    tokio::spawn(handler(stream, peer).instrument(info_span!("conn", peer = %peer)));
                }
                Err(e) => {
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}
