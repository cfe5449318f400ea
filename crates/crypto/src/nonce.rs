use crate::{CipherError, Result};

/// ChaCha20-Poly1305 nonce length
pub const NONCE_SIZE: usize = 12;

/// Number of distinct 96-bit nonces
const NONCE_SPACE: u128 = 1 << 96;

/// Byte order a nonce counter is serialised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceLayout {
    /// 96-bit big-endian integer
    #[default]
    BigEndian,
    /// Counter incremented from byte 0 upwards (deployed legacy nodes)
    LowByteFirst,
}

/// Per-direction nonce counter, starting at zero.
///
/// Each call to [`advance`](Self::advance) hands out the current value and
/// moves to the next one. The sequence refuses to wrap.
#[derive(Debug, Clone)]
pub struct NonceSequence {
    counter: u128,
    layout: NonceLayout,
}

impl NonceSequence {
    pub fn new(layout: NonceLayout) -> Self {
        Self { counter: 0, layout }
    }

    /// Nonce the next [`advance`](Self::advance) will return.
    pub fn current(&self) -> [u8; NONCE_SIZE] {
        encode(self.counter, self.layout)
    }

    /// Number of nonces consumed so far
    pub fn consumed(&self) -> u128 {
        self.counter
    }

    pub fn layout(&self) -> NonceLayout {
        self.layout
    }

    /// Take the current nonce and increment the counter.
    pub fn advance(&mut self) -> Result<[u8; NONCE_SIZE]> {
        if self.counter >= NONCE_SPACE {
            return Err(CipherError::NonceExhausted);
        }
        let nonce = encode(self.counter, self.layout);
        self.counter += 1;
        Ok(nonce)
    }
}

fn encode(counter: u128, layout: NonceLayout) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    match layout {
        NonceLayout::BigEndian => nonce.copy_from_slice(&counter.to_be_bytes()[16 - NONCE_SIZE..]),
        NonceLayout::LowByteFirst => nonce.copy_from_slice(&counter.to_le_bytes()[..NONCE_SIZE]),
    }
    nonce
}
