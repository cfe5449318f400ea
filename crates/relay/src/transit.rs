//! Transit relay session
//!
//! Accepts plaintext client connections and forwards each one, encrypted,
//! to a fixed downstream peer (normally an exit session).

use std::sync::Arc;
use std::time::Duration;

use stealthwire_core::{CipherMode, Task, TaskId, TrafficCounter};
use stealthwire_crypto::{SecureStream, StreamConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{bind, connect, serve, splice, ClientSide, Result, SpliceStats};

/// One transit listener and the state its connections share.
pub struct TransitSession {
    task_id: TaskId,
    listen_addr: String,
    target_addr: String,
    stream: StreamConfig,
    counter: Arc<TrafficCounter>,
    connect_timeout: Option<Duration>,
}

impl TransitSession {
    pub fn new(
        task_id: TaskId,
        listen_addr: impl Into<String>,
        target_addr: impl Into<String>,
        stream: StreamConfig,
        counter: Arc<TrafficCounter>,
    ) -> Self {
        Self {
            task_id,
            listen_addr: listen_addr.into(),
            target_addr: target_addr.into(),
            stream,
            counter,
            connect_timeout: None,
        }
    }

    /// Build a session for a `transit` task.
    pub fn from_task(task: &Task, counter: Arc<TrafficCounter>) -> Result<Self> {
        let stream = StreamConfig::new(&task.key, task.cipher)?;
        Ok(Self::new(
            task.id,
            task.listen_addr.clone(),
            task.target_addr.clone(),
            stream,
            counter,
        ))
    }

    /// Bound on dialing the downstream peer. Unbounded by default.
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
        info!(
            task_id = self.task_id,
            listen = %listener.local_addr()?,
            target = %self.target_addr,
            cipher = ?self.stream.mode(),
            key = %self.stream.keys().fingerprint(),
            "transit listening"
        );

        if self.stream.mode() == CipherMode::Legacy {
            warn!(
                task_id = self.task_id,
                "legacy cipher shares one key across both directions; use directional where peers allow"
            );
        }

        let task_id = self.task_id;
        let session = Arc::new(self);
        serve(listener, shutdown, move |client, _peer| {
            let session = session.clone();
            async move { session.handle(client).await }
        })
        .await?;

        info!(task_id, "transit stopped");
        Ok(())
    }

    async fn handle(&self, client: TcpStream) {
        match self.relay(client).await {
            Ok(stats) => debug!(
                task_id = self.task_id,
                upload = stats.upload,
                download = stats.download,
                "transit connection closed"
            ),
            Err(e) => warn!(
                task_id = self.task_id,
                target = %self.target_addr,
                error = %e,
                "transit connection aborted"
            ),
        }
    }

    async fn relay(&self, client: TcpStream) -> Result<SpliceStats> {
        let remote = connect(&self.target_addr, self.connect_timeout).await?;
        let (remote_reader, remote_writer) = remote.into_split();
        let tunnel = SecureStream::initiator(remote_reader, remote_writer, &self.stream).await?;

        let (client_reader, client_writer) = client.into_split();
        Ok(splice(
            client_reader,
            client_writer,
            tunnel,
            self.counter.clone(),
            ClientSide::Plain,
        )
        .await)
    }
}
