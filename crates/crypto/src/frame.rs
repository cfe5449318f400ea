//! Frame codec: sealing and opening of length-prefixed frames
//!
//! [`FrameWriter`] and [`FrameReader`] each own one direction of a secure
//! stream together with that direction's nonce counter. Frames must be opened
//! in exactly the order they were sealed; a reordered, replayed or dropped
//! frame fails authentication because it is opened under the wrong nonce.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key as AeadKey, Nonce,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{CipherError, NonceLayout, NonceSequence, Result, SymmetricKey};

/// Largest payload carried by a single frame
pub const MAX_PAYLOAD_SIZE: usize = 16383;

/// Poly1305 authentication tag length
pub const TAG_SIZE: usize = 16;

/// Plaintext length prefix
pub const LENGTH_SIZE: usize = 2;

/// Sealed length prefix on the wire
pub const HEADER_SIZE: usize = LENGTH_SIZE + TAG_SIZE;

/// Bytes a frame carrying `payload_len` bytes occupies on the wire.
pub fn wire_len(payload_len: usize) -> usize {
    if payload_len == 0 {
        HEADER_SIZE
    } else {
        HEADER_SIZE + payload_len + TAG_SIZE
    }
}

/// Sealing half of a secure stream.
pub struct FrameWriter<W> {
    inner: W,
    cipher: ChaCha20Poly1305,
    nonce: NonceSequence,
    failed: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, key: &SymmetricKey, layout: NonceLayout) -> Self {
        Self {
            inner,
            cipher: ChaCha20Poly1305::new(AeadKey::from_slice(key)),
            nonce: NonceSequence::new(layout),
            failed: false,
        }
    }

    /// Seal and send `data`, split into frames of at most
    /// [`MAX_PAYLOAD_SIZE`] bytes.
    ///
    /// Returns once every chunk is on the transport. An empty `data` sends a
    /// single keepalive frame and returns 0. On failure after some chunks were
    /// sent the error is [`CipherError::PartialWrite`] with the plaintext
    /// byte count already delivered.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            self.send_keepalive().await?;
            return Ok(0);
        }

        let mut written = 0;
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            if let Err(e) = self.write_frame(chunk).await {
                return Err(CipherError::after(written, e));
            }
            written += chunk.len();
        }
        Ok(written)
    }

    /// Send a zero-length frame. Readers skip it.
    pub async fn send_keepalive(&mut self) -> Result<()> {
        self.write_frame(&[]).await
    }

    /// Write bytes to the transport without sealing them.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if self.failed {
            return Err(CipherError::Failed);
        }
        let result = async {
            self.inner.write_all(bytes).await?;
            self.inner.flush().await
        }
        .await;
        self.failed = result.is_err();
        Ok(result?)
    }

    /// Shut down the write side of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn nonce(&self) -> &NonceSequence {
        &self.nonce
    }

    /// True once a write has failed; every later write fails too.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    async fn write_frame(&mut self, chunk: &[u8]) -> Result<()> {
        if self.failed {
            return Err(CipherError::Failed);
        }
        // A frame that was partly written leaves the peer mid-frame.
        let result = self.seal_and_send(chunk).await;
        self.failed = result.is_err();
        result
    }

    async fn seal_and_send(&mut self, chunk: &[u8]) -> Result<()> {
        let wire = self.seal_frame(chunk)?;
        self.inner.write_all(&wire).await?;
        self.inner.flush().await?;
        Ok(())
    }

    fn seal_frame(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        debug_assert!(chunk.len() <= MAX_PAYLOAD_SIZE);
        let length = (chunk.len() as u16).to_be_bytes();

        let mut wire = Vec::with_capacity(wire_len(chunk.len()));

        let header_nonce = self.nonce.advance()?;
        let header = self
            .cipher
            .encrypt(Nonce::from_slice(&header_nonce), &length[..])
            .map_err(|_| CipherError::EncryptionFailed)?;
        wire.extend_from_slice(&header);

        if !chunk.is_empty() {
            let body_nonce = self.nonce.advance()?;
            let body = self
                .cipher
                .encrypt(Nonce::from_slice(&body_nonce), chunk)
                .map_err(|_| CipherError::EncryptionFailed)?;
            wire.extend_from_slice(&body);
        }

        Ok(wire)
    }
}

/// Opening half of a secure stream.
///
/// Presents the decrypted frames as a plain ordered byte stream: payload that
/// does not fit the caller's buffer is kept and returned by the next read.
pub struct FrameReader<R> {
    inner: R,
    cipher: ChaCha20Poly1305,
    nonce: NonceSequence,
    residual: Vec<u8>,
    offset: usize,
    failed: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, key: &SymmetricKey, layout: NonceLayout) -> Self {
        Self {
            inner,
            cipher: ChaCha20Poly1305::new(AeadKey::from_slice(key)),
            nonce: NonceSequence::new(layout),
            residual: Vec::new(),
            offset: 0,
            failed: false,
        }
    }

    /// Read decrypted bytes into `buf`.
    ///
    /// Returns `Ok(0)` once the transport closes on a frame boundary.
    /// Keepalive frames are skipped.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.buffered() > 0 {
                let n = buf.len().min(self.buffered());
                buf[..n].copy_from_slice(&self.residual[self.offset..self.offset + n]);
                self.offset += n;
                if self.offset == self.residual.len() {
                    self.residual.clear();
                    self.offset = 0;
                }
                return Ok(n);
            }

            match self.read_frame().await? {
                None => return Ok(0),
                Some(payload) if payload.is_empty() => continue,
                Some(payload) => {
                    let n = buf.len().min(payload.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    if n < payload.len() {
                        self.residual = payload;
                        self.offset = n;
                    }
                    return Ok(n);
                }
            }
        }
    }

    /// Read and open exactly one frame.
    ///
    /// `None` means the transport closed cleanly before a new frame started;
    /// an empty payload is a keepalive frame. Any error is terminal: later
    /// calls return [`CipherError::Failed`].
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.failed {
            return Err(CipherError::Failed);
        }
        let result = self.open_frame().await;
        self.failed = result.is_err();
        result
    }

    async fn open_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; HEADER_SIZE];
        if !self.read_header(&mut header).await? {
            return Ok(None);
        }

        let header_nonce = self.nonce.advance()?;
        let length = self
            .cipher
            .decrypt(Nonce::from_slice(&header_nonce), &header[..])
            .map_err(|_| CipherError::SuspiciousProbe)?;
        let length = u16::from_be_bytes([length[0], length[1]]) as usize;

        if length == 0 {
            return Ok(Some(Vec::new()));
        }

        let mut body = vec![0u8; length + TAG_SIZE];
        self.inner.read_exact(&mut body).await?;

        let body_nonce = self.nonce.advance()?;
        let payload = self
            .cipher
            .decrypt(Nonce::from_slice(&body_nonce), &body[..])
            .map_err(|_| CipherError::BodyDecrypt)?;

        Ok(Some(payload))
    }

    /// Discard `len` raw bytes from the transport.
    pub async fn skip_raw(&mut self, len: usize) -> Result<()> {
        if self.failed {
            return Err(CipherError::Failed);
        }
        let mut scratch = vec![0u8; len];
        let result = self.inner.read_exact(&mut scratch).await;
        self.failed = result.is_err();
        result?;
        Ok(())
    }

    /// Decrypted bytes waiting to be returned
    pub fn buffered(&self) -> usize {
        self.residual.len() - self.offset
    }

    pub fn nonce(&self) -> &NonceSequence {
        &self.nonce
    }

    /// True once a read has failed; the stream cannot be resumed.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn stash(&mut self, payload: Vec<u8>) {
        debug_assert_eq!(self.buffered(), 0);
        self.residual = payload;
        self.offset = 0;
    }

    /// Fill `header`, distinguishing a clean close (nothing read) from a
    /// close in the middle of a header.
    async fn read_header(&mut self, header: &mut [u8; HEADER_SIZE]) -> Result<bool> {
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(CipherError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }
        Ok(true)
    }
}
