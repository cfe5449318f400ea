//! Two-task splice between a plaintext socket and a secure stream.
//!
//! One task seals plaintext into the tunnel, the other opens tunnel frames
//! back into plaintext. When either finishes (EOF or error) the other is
//! aborted and both transports are dropped.

use std::sync::Arc;

use stealthwire_core::{Direction, TrafficCounter};
use stealthwire_crypto::{FrameReader, FrameWriter, SecureStream, MAX_PAYLOAD_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::{RelayError, Result};

/// Read buffer for each copy direction
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Where the client sits relative to the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSide {
    /// Plaintext side is the client (transit)
    Plain,
    /// Tunnel side is the client (exit)
    Tunnel,
}

impl ClientSide {
    fn into_tunnel(self) -> Direction {
        match self {
            Self::Plain => Direction::Upload,
            Self::Tunnel => Direction::Download,
        }
    }

    fn out_of_tunnel(self) -> Direction {
        match self {
            Self::Plain => Direction::Download,
            Self::Tunnel => Direction::Upload,
        }
    }
}

/// Plaintext bytes moved over one spliced connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub upload: u64,
    pub download: u64,
}

/// Counts into the session counter and this connection's own counter.
#[derive(Clone)]
struct Meter {
    session: Arc<TrafficCounter>,
    connection: Arc<TrafficCounter>,
}

impl Meter {
    fn record(&self, direction: Direction, bytes: u64) {
        if bytes > 0 {
            self.session.record(direction, bytes);
            self.connection.record(direction, bytes);
        }
    }
}

/// Copy bytes both ways until either direction ends.
///
/// Byte counts are plaintext bytes, added to `counter` as they are copied, so
/// a long-lived connection is visible to metering before it closes.
pub async fn splice<PR, PW, SR, SW>(
    plain_reader: PR,
    plain_writer: PW,
    tunnel: SecureStream<SR, SW>,
    counter: Arc<TrafficCounter>,
    client: ClientSide,
) -> SpliceStats
where
    PR: AsyncRead + Unpin + Send + 'static,
    PW: AsyncWrite + Unpin + Send + 'static,
    SR: AsyncRead + Unpin + Send + 'static,
    SW: AsyncWrite + Unpin + Send + 'static,
{
    let meter = Meter {
        session: counter,
        connection: Arc::new(TrafficCounter::new()),
    };
    let (tunnel_reader, tunnel_writer) = tunnel.into_split();

    let mut sealing = tokio::spawn(seal_into(
        plain_reader,
        tunnel_writer,
        meter.clone(),
        client.into_tunnel(),
    ));
    let mut opening = tokio::spawn(open_into(
        tunnel_reader,
        plain_writer,
        meter.clone(),
        client.out_of_tunnel(),
    ));

    let (finished, remaining, label) = tokio::select! {
        result = &mut sealing => (result, opening, "plain->tunnel"),
        result = &mut opening => (result, sealing, "tunnel->plain"),
    };

    match finished {
        Ok(Ok(())) => debug!(direction = label, "direction reached EOF"),
        Ok(Err(e)) => debug!(direction = label, error = %e, "direction ended with error"),
        Err(e) => error!(direction = label, error = %e, "copy task failed"),
    }

    remaining.abort();
    // Wait for the aborted task so its half of each transport is dropped.
    let _ = remaining.await;

    SpliceStats {
        upload: meter.connection.upload(),
        download: meter.connection.download(),
    }
}

async fn seal_into<R, W>(mut reader: R, mut tunnel: FrameWriter<W>, meter: Meter, direction: Direction) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = tunnel.shutdown().await;
            return Ok(());
        }

        match tunnel.write(&buf[..n]).await {
            Ok(written) => meter.record(direction, written as u64),
            Err(e) => {
                meter.record(direction, e.bytes_written() as u64);
                return Err(RelayError::Cipher(e));
            }
        }
    }
}

async fn open_into<R, W>(mut tunnel: FrameReader<R>, mut writer: W, meter: Meter, direction: Direction) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = tunnel.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }

        writer.write_all(&buf[..n]).await?;
        meter.record(direction, n as u64);
    }
}
