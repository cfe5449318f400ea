//! Secure stream: a frame reader and writer pair plus the handshake.

use std::sync::Arc;
use std::time::Duration;

use stealthwire_core::CipherMode;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::{
    CipherError, FrameReader, FrameWriter, JitterSource, NoJitter, Result, Role, SessionKeys,
    MAX_JITTER_LEN,
};

/// Everything a relay session needs to open secure streams for one task.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    keys: SessionKeys,
    jitter: Arc<dyn JitterSource>,
    prefix_skip: usize,
    handshake_timeout: Option<Duration>,
}

impl StreamConfig {
    pub fn new(secret: &str, mode: CipherMode) -> Result<Self> {
        Ok(Self {
            keys: SessionKeys::derive(secret, mode)?,
            jitter: Arc::new(NoJitter),
            prefix_skip: 0,
            handshake_timeout: None,
        })
    }

    /// Raw bytes an initiator sends before its handshake frame.
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Raw bytes a responder discards before reading the handshake frame.
    /// `len` is capped at [`MAX_JITTER_LEN`], like the jitter it matches.
    pub fn with_prefix_skip(mut self, len: usize) -> Self {
        self.prefix_skip = len.min(MAX_JITTER_LEN);
        self
    }

    /// Bound on how long a responder waits for the handshake frame.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn mode(&self) -> CipherMode {
        self.keys.mode()
    }
}

/// Authenticated, length-concealing duplex stream over a split transport.
///
/// The reader and writer halves are independent: one task may read while
/// another writes. Use [`into_split`](Self::into_split) to move them into
/// separate tasks.
pub struct SecureStream<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    role: Role,
}

impl<R, W> std::fmt::Debug for SecureStream<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl<R, W> SecureStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap a transport without performing the handshake.
    pub fn new(reader: R, writer: W, config: &StreamConfig, role: Role) -> Self {
        let keys = config.keys();
        let layout = keys.nonce_layout();
        Self {
            reader: FrameReader::new(reader, keys.recv_key(role), layout),
            writer: FrameWriter::new(writer, keys.send_key(role), layout),
            role,
        }
    }

    /// Open the dialing side: send the optional jitter prefix, then one
    /// zero-length frame.
    pub async fn initiator(reader: R, writer: W, config: &StreamConfig) -> Result<Self> {
        let mut stream = Self::new(reader, writer, config, Role::Initiator);

        let prefix = config.jitter.prefix();
        if !prefix.is_empty() {
            trace!(len = prefix.len(), "sending jitter prefix");
            stream.writer.write_raw(&prefix).await?;
        }
        stream.writer.send_keepalive().await?;

        Ok(stream)
    }

    /// Open the accepting side: consume exactly one frame before returning.
    ///
    /// A frame that fails to authenticate yields
    /// [`CipherError::SuspiciousProbe`]. A close before any frame arrives is a
    /// handshake failure. Payload carried by the first frame is kept for the
    /// first read.
    pub async fn responder(reader: R, writer: W, config: &StreamConfig) -> Result<Self> {
        let mut stream = Self::new(reader, writer, config, Role::Responder);

        let handshake = async {
            if config.prefix_skip > 0 {
                stream.reader.skip_raw(config.prefix_skip).await?;
            }
            let payload = stream.reader.read_frame().await?.ok_or_else(|| {
                CipherError::Handshake("connection closed before handshake".to_string())
            })?;
            if !payload.is_empty() {
                stream.reader.stash(payload);
            }
            Ok::<(), CipherError>(())
        };

        match config.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| CipherError::HandshakeTimeout)??,
            None => handshake.await?,
        }

        Ok(stream)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.writer.write(data).await
    }

    pub async fn send_keepalive(&mut self) -> Result<()> {
        self.writer.send_keepalive().await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn reader(&self) -> &FrameReader<R> {
        &self.reader
    }

    pub fn writer(&self) -> &FrameWriter<W> {
        &self.writer
    }

    pub fn into_split(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RandomJitter, HEADER_SIZE};
    use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};

    type Half = SecureStream<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn config(secret: &str, mode: CipherMode) -> StreamConfig {
        StreamConfig::new(secret, mode).unwrap()
    }

    async fn pair(initiator_cfg: &StreamConfig, responder_cfg: &StreamConfig) -> (Result<Half>, Result<Half>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        tokio::join!(
            SecureStream::initiator(ar, aw, initiator_cfg),
            SecureStream::responder(br, bw, responder_cfg),
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    async fn transfer(data: Vec<u8>, slice: usize, mode: CipherMode) -> Vec<u8> {
        let cfg = config("round-trip", mode);
        let (init, resp) = pair(&cfg, &cfg).await;
        let (mut init, mut resp) = (init.unwrap(), resp.unwrap());

        let writer = tokio::spawn(async move {
            init.write(&data).await.unwrap();
            init.shutdown().await.unwrap();
            init
        });

        let mut out = Vec::new();
        let mut buf = vec![0u8; slice];
        loop {
            let n = resp.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        writer.await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        for len in [0usize, 1, 16383, 16384, 200_000] {
            for slice in [5usize, 4096, 70_000] {
                let data = pattern(len);
                let out = transfer(data.clone(), slice, CipherMode::Directional).await;
                assert_eq!(out, data, "len={} slice={}", len, slice);
            }
        }
    }

    #[tokio::test]
    async fn test_legacy_round_trip() {
        let data = pattern(40_000);
        assert_eq!(transfer(data.clone(), 1024, CipherMode::Legacy).await, data);
    }

    #[tokio::test]
    async fn test_both_directions() {
        let cfg = config("duplex", CipherMode::Directional);
        let (init, resp) = pair(&cfg, &cfg).await;
        let (mut init, mut resp) = (init.unwrap(), resp.unwrap());

        init.write(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = resp.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        resp.write(b"pong").await.unwrap();
        let n = init.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        assert_eq!(init.role(), Role::Initiator);
        assert_eq!(resp.role(), Role::Responder);
    }

    #[tokio::test]
    async fn test_initiator_sends_one_empty_frame() {
        let cfg = config("handshake", CipherMode::Directional);
        let (a, mut b) = tokio::io::duplex(1024);
        let (ar, aw) = split(a);

        let init = SecureStream::initiator(ar, aw, &cfg).await.unwrap();
        assert_eq!(init.writer().nonce().consumed(), 1);
        drop(init);

        let mut wire = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut b, &mut wire).await.unwrap();
        assert_eq!(wire.len(), HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_responder_blocks_without_handshake() {
        let cfg = config("asym", CipherMode::Directional);
        let (_a, b) = tokio::io::duplex(1024);
        let (br, bw) = split(b);

        let pending = tokio::time::timeout(
            Duration::from_millis(100),
            SecureStream::responder(br, bw, &cfg),
        )
        .await;
        assert!(pending.is_err(), "responder must wait for the handshake frame");
    }

    #[tokio::test]
    async fn test_responder_fails_on_close_before_handshake() {
        let cfg = config("asym", CipherMode::Directional);
        let (a, b) = tokio::io::duplex(1024);
        drop(a);
        let (br, bw) = split(b);

        let result = SecureStream::responder(br, bw, &cfg).await;
        assert!(matches!(result, Err(CipherError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let cfg = config("asym", CipherMode::Directional)
            .with_handshake_timeout(Duration::from_millis(50));
        let (_a, b) = tokio::io::duplex(1024);
        let (br, bw) = split(b);

        let result = SecureStream::responder(br, bw, &cfg).await;
        assert!(matches!(result, Err(CipherError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_wrong_key_rejected_at_handshake() {
        let (init, resp) = pair(
            &config("alpha", CipherMode::Directional),
            &config("bravo", CipherMode::Directional),
        )
        .await;
        assert!(init.is_ok());
        assert!(matches!(resp, Err(CipherError::SuspiciousProbe)));
    }

    #[tokio::test]
    async fn test_mode_mismatch_rejected() {
        let (_init, resp) = pair(
            &config("same", CipherMode::Legacy),
            &config("same", CipherMode::Directional),
        )
        .await;
        assert!(resp.unwrap_err().is_probe());
    }

    #[tokio::test]
    async fn test_random_bytes_look_like_probe() {
        let cfg = config("probe", CipherMode::Directional);
        let (mut a, b) = tokio::io::duplex(1024);
        let (br, bw) = split(b);

        tokio::io::AsyncWriteExt::write_all(&mut a, &[0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc, 0x03, 0x03, 0, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let result = SecureStream::responder(br, bw, &cfg).await;
        assert!(matches!(result, Err(CipherError::SuspiciousProbe)));
    }

    #[tokio::test]
    async fn test_first_frame_payload_is_kept() {
        let cfg = config("payload-first", CipherMode::Directional);
        let (a, b) = tokio::io::duplex(1024);
        let (_ar, aw) = split(a);
        let (br, bw) = split(b);

        // A peer that skips the empty handshake frame and sends data at once.
        let keys = cfg.keys();
        let mut raw = FrameWriter::new(aw, keys.send_key(Role::Initiator), keys.nonce_layout());
        raw.write(b"early data").await.unwrap();

        let mut resp = SecureStream::responder(br, bw, &cfg).await.unwrap();
        assert_eq!(resp.reader().buffered(), 10);
        let mut buf = [0u8; 32];
        let n = resp.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"early data");
        assert_eq!(resp.reader().buffered(), 0);
    }

    #[tokio::test]
    async fn test_directional_first_frames_differ() {
        // Same plaintext (the empty handshake frame) from both sides must not
        // produce the same ciphertext, or the two directions share a nonce.
        async fn first_frame(role: Role, mode: CipherMode) -> Vec<u8> {
            let cfg = config("reuse", mode);
            let keys = cfg.keys();
            let mut writer = FrameWriter::new(Vec::new(), keys.send_key(role), keys.nonce_layout());
            writer.send_keepalive().await.unwrap();
            writer.into_inner()
        }

        assert_ne!(
            first_frame(Role::Initiator, CipherMode::Directional).await,
            first_frame(Role::Responder, CipherMode::Directional).await
        );
        assert_eq!(
            first_frame(Role::Initiator, CipherMode::Legacy).await,
            first_frame(Role::Responder, CipherMode::Legacy).await
        );
    }

    #[tokio::test]
    async fn test_jitter_prefix_with_matching_skip() {
        let init_cfg = config("jitter", CipherMode::Directional)
            .with_jitter(Arc::new(RandomJitter::new(32)));
        let resp_cfg = config("jitter", CipherMode::Directional).with_prefix_skip(32);

        let (init, resp) = pair(&init_cfg, &resp_cfg).await;
        let (mut init, mut resp) = (init.unwrap(), resp.unwrap());

        init.write(b"after jitter").await.unwrap();
        let mut buf = [0u8; 32];
        let n = resp.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after jitter");
    }

    #[tokio::test]
    async fn test_oversized_jitter_and_skip_are_capped_together() {
        let init_cfg = config("jitter", CipherMode::Directional)
            .with_jitter(Arc::new(RandomJitter::new(200)));
        let resp_cfg = config("jitter", CipherMode::Directional).with_prefix_skip(200);
        assert_eq!(resp_cfg.prefix_skip, MAX_JITTER_LEN);

        let (init, resp) = pair(&init_cfg, &resp_cfg).await;
        let (mut init, mut resp) = (init.unwrap(), resp.unwrap());

        init.write(b"capped").await.unwrap();
        let mut buf = [0u8; 32];
        let n = resp.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"capped");
    }

    #[tokio::test]
    async fn test_jitter_prefix_without_skip_fails() {
        let init_cfg = config("jitter", CipherMode::Directional)
            .with_jitter(Arc::new(RandomJitter::new(32)));
        let resp_cfg = config("jitter", CipherMode::Directional);

        let (_init, resp) = pair(&init_cfg, &resp_cfg).await;
        assert!(resp.is_err());
    }

    #[tokio::test]
    async fn test_split_halves_work_concurrently() {
        let cfg = config("split", CipherMode::Directional);
        let (init, resp) = pair(&cfg, &cfg).await;
        let (mut init_r, mut init_w) = init.unwrap().into_split();
        let (mut resp_r, mut resp_w) = resp.unwrap().into_split();

        let up = tokio::spawn(async move {
            init_w.write(&pattern(100_000)).await.unwrap();
        });
        let down = tokio::spawn(async move {
            resp_w.write(&pattern(100_000)).await.unwrap();
        });

        let mut got_up = Vec::new();
        let mut got_down = Vec::new();
        let mut buf = vec![0u8; 8192];
        while got_up.len() < 100_000 {
            let n = resp_r.read(&mut buf).await.unwrap();
            got_up.extend_from_slice(&buf[..n]);
        }
        while got_down.len() < 100_000 {
            let n = init_r.read(&mut buf).await.unwrap();
            got_down.extend_from_slice(&buf[..n]);
        }

        up.await.unwrap();
        down.await.unwrap();
        assert_eq!(got_up, pattern(100_000));
        assert_eq!(got_down, pattern(100_000));
    }
}
