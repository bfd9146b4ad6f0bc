//! Encrypted packet envelopes.
//!
//! An envelope is an `EnvelopeHeader` followed by the payload encrypted with
//! ChaCha20-Poly1305 in `BLOCK_SIZE` plaintext blocks, then optional random
//! padding. The payload key is derived from an ephemeral X25519 agreement
//! with the recipient's exchange key, so only the recipient can open it; the
//! header is signed by the sender, so only known senders are accepted.
//!
//! Both directions are `Read` adapters. `SealingReader` turns a plaintext
//! reader into envelope bytes, which lets a Trns layer seal a reader that is
//! itself a `SealingReader`. `EnvelopeReader` authenticates each block
//! before handing out its plaintext.

use std::io::{self, Read};
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use thiserror::Error;
use zerocopy::byteorder::U64;
use zerocopy::{AsBytes, FromZeroes};

use crate::crypto::{self, CryptoError};
use crate::identity::{LocalNode, Neighbours, Node, NodeId};
use crate::wire::{EnvelopeHeader, WireError, ENVELOPE_HEADER_SIZE, ENVELOPE_MAGIC};

/// Plaintext bytes per encrypted block.
pub const BLOCK_SIZE: usize = 128 * 1024;

const TAG_SIZE: usize = 16;

/// Envelope length on disk for a plaintext of `size` bytes, before padding.
pub fn sealed_size(size: u64) -> u64 {
    let blocks = size.div_ceil(BLOCK_SIZE as u64).max(1);
    ENVELOPE_HEADER_SIZE as u64 + size + blocks * TAG_SIZE as u64
}

fn block_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn block_count(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64).max(1)
}

// ── Sealing ───────────────────────────────────────────────────────────────────

/// Reads as the envelope of `size` plaintext bytes taken from `inner`.
pub struct SealingReader<R> {
    inner: R,
    header: EnvelopeHeader,
    cipher: ChaCha20Poly1305,
    blocks: u64,
    counter: u64,
    plain_left: u64,
    pad_left: u64,
    out: Vec<u8>,
    out_pos: usize,
}

impl<R: Read> SealingReader<R> {
    /// `inner` must yield exactly `size` bytes. The envelope is padded with
    /// random bytes up to `min_size` total.
    pub fn new(
        local: &LocalNode,
        recipient: &Node,
        nice: u8,
        size: u64,
        min_size: u64,
        inner: R,
    ) -> Result<Self, EnvelopeError> {
        let (ephemeral, shared) = crypto::ephemeral_agreement(&recipient.exch_pub)?;
        let key = crypto::derive_envelope_key(&shared, &ephemeral, &recipient.exch_pub);

        let mut header = EnvelopeHeader::new_zeroed();
        header.magic = ENVELOPE_MAGIC;
        header.nice = nice;
        header.sender = *local.id.as_bytes();
        header.recipient = *recipient.id.as_bytes();
        header.ephemeral = ephemeral;
        header.size = U64::new(size);
        header.signature = local.sign.sign(header.signed_bytes());

        let out = header.as_bytes().to_vec();
        Ok(Self {
            inner,
            header,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&*key)),
            blocks: block_count(size),
            counter: 0,
            plain_left: size,
            pad_left: min_size.saturating_sub(sealed_size(size)),
            out,
            out_pos: 0,
        })
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// Total bytes this reader will yield, padding included.
    pub fn total_size(&self) -> u64 {
        sealed_size(self.header.size.get()) + self.pad_left
    }

    fn next_block(&mut self) -> io::Result<bool> {
        if self.counter < self.blocks {
            let len = self.plain_left.min(BLOCK_SIZE as u64) as usize;
            let mut plain = vec![0u8; len];
            self.inner.read_exact(&mut plain).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "payload shorter than declared envelope size",
                    )
                } else {
                    e
                }
            })?;
            self.plain_left -= len as u64;
            let nonce = block_nonce(self.counter);
            let sealed = self
                .cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &plain,
                        aad: self.header.as_bytes(),
                    },
                )
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "block encryption failed"))?;
            self.counter += 1;
            self.out = sealed;
            self.out_pos = 0;
            return Ok(true);
        }
        if self.pad_left > 0 {
            let len = self.pad_left.min(BLOCK_SIZE as u64) as usize;
            let mut pad = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut pad);
            self.pad_left -= len as u64;
            self.out = pad;
            self.out_pos = 0;
            return Ok(true);
        }
        Ok(false)
    }
}

impl<R: Read> Read for SealingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.out_pos == self.out.len() {
            if !self.next_block()? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.out.len() - self.out_pos);
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

// ── Opening ───────────────────────────────────────────────────────────────────

/// Reads the authenticated plaintext of an envelope addressed to us.
pub struct EnvelopeReader<R> {
    inner: R,
    header: EnvelopeHeader,
    sender: Arc<Node>,
    cipher: ChaCha20Poly1305,
    blocks: u64,
    counter: u64,
    plain_left: u64,
    out: Vec<u8>,
    out_pos: usize,
}

impl<R: Read> EnvelopeReader<R> {
    /// Read and authenticate the header. Payload blocks are authenticated as
    /// they are read.
    pub fn open(mut inner: R, local: &LocalNode, neighbours: &Neighbours) -> Result<Self, EnvelopeError> {
        let mut raw = [0u8; ENVELOPE_HEADER_SIZE];
        inner.read_exact(&mut raw).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => EnvelopeError::Truncated,
            _ => EnvelopeError::Io(e),
        })?;
        let header = EnvelopeHeader::parse(&raw)?;

        let recipient = header.recipient_id();
        if recipient != local.id {
            return Err(EnvelopeError::NotForUs(recipient));
        }
        let sender_id = header.sender_id();
        let sender = neighbours
            .get(&sender_id)
            .cloned()
            .ok_or(EnvelopeError::UnknownSender(sender_id))?;
        let signature = header.signature;
        crypto::verify(&sender.sign_pub, header.signed_bytes(), &signature)?;

        let ephemeral = header.ephemeral;
        let shared = local.exch.diffie_hellman(&ephemeral)?;
        let key = crypto::derive_envelope_key(&shared, &ephemeral, &local.exch.public);
        let size = header.size.get();

        Ok(Self {
            inner,
            header,
            sender,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&*key)),
            blocks: block_count(size),
            counter: 0,
            plain_left: size,
            out: Vec::new(),
            out_pos: 0,
        })
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    pub fn sender(&self) -> &Arc<Node> {
        &self.sender
    }

    pub fn nice(&self) -> u8 {
        self.header.nice
    }

    /// Declared plaintext size.
    pub fn size(&self) -> u64 {
        self.header.size.get()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn next_block(&mut self) -> Result<bool, EnvelopeError> {
        if self.counter == self.blocks {
            return Ok(false);
        }
        let len = self.plain_left.min(BLOCK_SIZE as u64) as usize;
        let mut sealed = vec![0u8; len + TAG_SIZE];
        self.inner.read_exact(&mut sealed).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => EnvelopeError::Truncated,
            _ => EnvelopeError::Io(e),
        })?;
        let nonce = block_nonce(self.counter);
        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: self.header.as_bytes(),
                },
            )
            .map_err(|_| EnvelopeError::BadBlock(self.counter))?;
        self.counter += 1;
        self.plain_left -= len as u64;
        self.out = plain;
        self.out_pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for EnvelopeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.out_pos == self.out.len() {
            match self.next_block() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
        let n = buf.len().min(self.out.len() - self.out_pos);
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("envelope addressed to {0}")]
    NotForUs(NodeId),
    #[error("unknown sender {0}")]
    UnknownSender(NodeId),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("payload block {0} failed authentication")]
    BadBlock(u64),
    #[error("envelope truncated")]
    Truncated,
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for EnvelopeError {
    /// Recover an envelope error that travelled through `Read`.
    fn from(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<EnvelopeError>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(err) = inner.downcast::<EnvelopeError>() {
                    return *err;
                }
            }
            return EnvelopeError::Truncated;
        }
        EnvelopeError::Io(e)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
