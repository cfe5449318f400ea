//! Raw prefix written ahead of the initiator's handshake frame.
//!
//! Nothing is sent by default. A responder only understands a prefix whose
//! length it has been told in advance (see
//! [`StreamConfig::with_prefix_skip`](crate::StreamConfig::with_prefix_skip)).

use std::fmt;

use rand::RngCore;

/// Upper bound for a random prefix
pub const MAX_JITTER_LEN: usize = 128;

/// Source of unsealed bytes sent before the first frame.
pub trait JitterSource: Send + Sync + fmt::Debug {
    fn prefix(&self) -> Vec<u8>;
}

/// Sends no prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn prefix(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Fixed-length prefix of random bytes
#[derive(Debug, Clone, Copy)]
pub struct RandomJitter {
    len: usize,
}

impl RandomJitter {
    /// `len` is capped at [`MAX_JITTER_LEN`].
    pub fn new(len: usize) -> Self {
        Self {
            len: len.min(MAX_JITTER_LEN),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl JitterSource for RandomJitter {
    fn prefix(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.len];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }
}
