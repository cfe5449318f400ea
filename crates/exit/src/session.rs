//! Exit relay session

use std::sync::Arc;
use std::time::Duration;

use stealthwire_core::{CipherMode, Task, TaskId, TrafficCounter};
use stealthwire_crypto::{SecureStream, StreamConfig};
use stealthwire_relay::{bind, connect, serve, splice, ClientSide, SpliceStats};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ExitError, Result};

/// One exit listener and the state its connections share.
pub struct ExitSession {
    task_id: TaskId,
    listen_addr: String,
    local_addr: String,
    stream: StreamConfig,
    counter: Arc<TrafficCounter>,
    connect_timeout: Option<Duration>,
}

impl ExitSession {
    pub fn new(
        task_id: TaskId,
        listen_addr: impl Into<String>,
        local_addr: impl Into<String>,
        stream: StreamConfig,
        counter: Arc<TrafficCounter>,
    ) -> Self {
        Self {
            task_id,
            listen_addr: listen_addr.into(),
            local_addr: local_addr.into(),
            stream,
            counter,
            connect_timeout: None,
        }
    }

    /// Build a session for an `exit` task; `target_addr` is the local
    /// destination.
    pub fn from_task(task: &Task, counter: Arc<TrafficCounter>) -> Result<Self> {
        let stream = StreamConfig::new(&task.key, task.cipher).map_err(ExitError::Config)?;
        Ok(Self::new(
            task.id,
            task.listen_addr.clone(),
            task.target_addr.clone(),
            stream,
            counter,
        ))
    }

    /// Bound on dialing the local destination. Unbounded by default.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn counter(&self) -> &Arc<TrafficCounter> {
        &self.counter
    }

    /// Bind the listen address and serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let listener = bind(&self.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let listen = listener
            .local_addr()
            .map_err(|e| ExitError::Relay(e.into()))?;
        info!(
            task_id = self.task_id,
            listen = %listen,
            local = %self.local_addr,
            cipher = ?self.stream.mode(),
            key = %self.stream.keys().fingerprint(),
            "exit listening"
        );

        if self.stream.mode() == CipherMode::Legacy {
            warn!(
                task_id = self.task_id,
                "legacy cipher shares one key across both directions; use directional where peers allow"
            );
        }

        let task_id = self.task_id;
        let session = Arc::new(self);
        serve(listener, shutdown, move |conn, _peer| {
            let session = session.clone();
            async move { session.handle(conn).await }
        })
        .await?;

        info!(task_id, "exit stopped");
        Ok(())
    }

    async fn handle(&self, conn: TcpStream) {
        match self.relay(conn).await {
            Ok(stats) => debug!(
                task_id = self.task_id,
                upload = stats.upload,
                download = stats.download,
                "exit connection closed"
            ),
            Err(e) if e.is_probe() => warn!(
                task_id = self.task_id,
                "handshake rejected, closing (suspicious probe)"
            ),
            Err(e) => warn!(task_id = self.task_id, error = %e, "exit connection aborted"),
        }
    }

    async fn relay(&self, conn: TcpStream) -> Result<SpliceStats> {
        let (reader, writer) = conn.into_split();
        // On failure the raw connection is dropped here, which closes it.
        let tunnel = SecureStream::responder(reader, writer, &self.stream)
            .await
            .map_err(ExitError::Handshake)?;

        let local = connect(&self.local_addr, self.connect_timeout).await?;
        let (local_reader, local_writer) = local.into_split();

        Ok(splice(
            local_reader,
            local_writer,
            tunnel,
            self.counter.clone(),
            ClientSide::Tunnel,
        )
        .await)
    }
}
