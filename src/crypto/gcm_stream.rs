//! `AES256/GCM-STREAM`: segmented AES-256-GCM
//!
//! **Format**:
//! - Plaintext is cut into 64 KiB segments, each sealed separately with a
//!   16-byte tag
//! - Nonce = 7-byte random prefix ‖ 32-bit BE segment counter ‖ last flag
//! - The object always ends with one final segment of `L mod 64 KiB` bytes
//!   (possibly empty), so truncation and reordering are detected
//!
//! Ciphertext length is `L + 16 × (⌊L / 64 Ki⌋ + 1)`, which is invertible.

use super::{CipherConstruction, EncryptedStream, SecretKey};
use crate::error::{Error, Result};
use crate::source::ByteStream;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use std::io;

/// Cipher name carried in `m-encrypt-cipher`
pub const NAME: &str = "AES256/GCM-STREAM";

/// Plaintext bytes per segment
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Authentication tag size
pub const TAG_SIZE: usize = 16;

/// Random part of every segment nonce
pub const PREFIX_SIZE: usize = 7;

/// One-shot nonce size used for metadata
pub const NONCE_SIZE: usize = 12;

/// Segmented streaming construction
#[derive(Debug, Clone, Copy, Default)]
pub struct GcmStream;

fn segment_nonce(prefix: &[u8; PREFIX_SIZE], counter: u32, last: bool) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..PREFIX_SIZE].copy_from_slice(prefix);
    nonce[PREFIX_SIZE..PREFIX_SIZE + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[NONCE_SIZE - 1] = u8::from(last);
    nonce
}

fn cipher_for(key: &SecretKey) -> Aes256Gcm {
    Aes256Gcm::new(key.as_bytes().into())
}

fn authentication_failed(_: aes_gcm::Error) -> Error {
    Error::Encryption("Authentication failed: ciphertext or key is wrong".into())
}

impl CipherConstruction for GcmStream {
    fn name(&self) -> &'static str {
        NAME
    }

    fn ciphertext_length(&self, plaintext: u64) -> Option<u64> {
        let segments = plaintext / SEGMENT_SIZE as u64 + 1;
        segments
            .checked_mul(TAG_SIZE as u64)
            .and_then(|overhead| plaintext.checked_add(overhead))
    }

    fn plaintext_length(&self, ciphertext: u64) -> Option<u64> {
        let body = ciphertext.checked_sub(TAG_SIZE as u64)?;
        let stride = (SEGMENT_SIZE + TAG_SIZE) as u64;
        let full = body / stride;
        let rest = body % stride;
        (rest < SEGMENT_SIZE as u64).then(|| full * SEGMENT_SIZE as u64 + rest)
    }

    fn seal(&self, key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let sealed = cipher_for(key)
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Encryption(format!("Sealing failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(&self, key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Encryption("Sealed data too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        cipher_for(key)
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(authentication_failed)
    }

    fn encrypt_stream(&self, key: &SecretKey, plaintext: ByteStream) -> EncryptedStream {
        let mut prefix = [0u8; PREFIX_SIZE];
        OsRng.fill_bytes(&mut prefix);

        let state = Segmenter {
            input: plaintext,
            pending: BytesMut::new(),
            input_done: false,
            finished: false,
            counter: 0,
            prefix,
            cipher: cipher_for(key),
        };

        EncryptedStream {
            iv: prefix.to_vec(),
            stream: stream::unfold(state, Segmenter::next_segment).boxed(),
        }
    }

    fn decrypt(&self, key: &SecretKey, iv: &[u8], ciphertext: &[u8]) -> Result<Bytes> {
        let prefix: [u8; PREFIX_SIZE] = iv
            .try_into()
            .map_err(|_| Error::Encryption(format!("IV must be {} bytes", PREFIX_SIZE)))?;
        let length = self
            .plaintext_length(ciphertext.len() as u64)
            .ok_or_else(|| Error::Encryption("Ciphertext length is not valid".into()))?;

        let cipher = cipher_for(key);
        let mut out = BytesMut::with_capacity(length as usize);
        let mut remaining = ciphertext;
        let mut counter: u32 = 0;

        while remaining.len() >= SEGMENT_SIZE + TAG_SIZE {
            let (segment, rest) = remaining.split_at(SEGMENT_SIZE + TAG_SIZE);
            let nonce = segment_nonce(&prefix, counter, false);
            let plain = cipher
                .decrypt(Nonce::from_slice(&nonce), segment)
                .map_err(authentication_failed)?;
            out.extend_from_slice(&plain);
            remaining = rest;
            counter = counter
                .checked_add(1)
                .ok_or_else(|| Error::Encryption("Too many segments".into()))?;
        }

        let nonce = segment_nonce(&prefix, counter, true);
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), remaining)
            .map_err(authentication_failed)?;
        out.extend_from_slice(&plain);

        Ok(out.freeze())
    }
}

struct Segmenter {
    input: ByteStream,
    pending: BytesMut,
    input_done: bool,
    finished: bool,
    counter: u32,
    prefix: [u8; PREFIX_SIZE],
    cipher: Aes256Gcm,
}

impl Segmenter {
    async fn next_segment(mut self) -> Option<(io::Result<Bytes>, Self)> {
        if self.finished {
            return None;
        }

        loop {
            if self.pending.len() >= SEGMENT_SIZE {
                let segment = self.pending.split_to(SEGMENT_SIZE);
                let item = self.seal_segment(&segment, false);
                return Some((item, self));
            }

            if self.input_done {
                let segment = std::mem::take(&mut self.pending);
                let item = self.seal_segment(&segment, true);
                self.finished = true;
                return Some((item, self));
            }

            match self.input.next().await {
                Some(Ok(chunk)) => self.pending.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some((Err(e), self));
                }
                None => self.input_done = true,
            }
        }
    }

    fn seal_segment(&mut self, segment: &[u8], last: bool) -> io::Result<Bytes> {
        let nonce = segment_nonce(&self.prefix, self.counter, last);
        let sealed = match self.cipher.encrypt(Nonce::from_slice(&nonce), segment) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.finished = true;
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Encryption failed: {}", e),
                ));
            }
        };

        match self.counter.checked_add(1) {
            Some(next) => self.counter = next,
            None if !last => {
                self.finished = true;
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "Encryption failed: segment counter exhausted",
                ));
            }
            None => {}
        }

        Ok(Bytes::from(sealed))
    }
}
