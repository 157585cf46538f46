//! Scrubbing discipline for plaintext, imported key bytes and the token PIN.
//!
//! Every buffer that holds secret material lives in one of these types. Wiping runs from
//! `Drop`, so it happens on every exit path including early returns and unwinding, and it goes
//! through [`zeroize`], whose volatile writes cannot be optimized away.

use std::{
    fmt,
    ops::{Deref, DerefMut},
};

use serde::{Deserialize, Deserializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const REDACTED: &str = "[REDACTED]";

/// Owned secret bytes, zeroed on drop.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes {
    inner: Vec<u8>,
}

impl SecretBytes {
    pub fn new(inner: Vec<u8>) -> Self {
        Self { inner }
    }

    pub fn copy_from(bytes: &[u8]) -> Self {
        Self {
            inner: bytes.to_vec(),
        }
    }

    pub fn expose(&self) -> &[u8] {
        &self.inner
    }

    pub fn expose_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(inner: Vec<u8>) -> Self {
        Self::new(inner)
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes({REDACTED}, {} bytes)", self.inner.len())
    }
}

/// Secret text such as the user PIN. Redacted in `Debug`/`Display`.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    pub fn new(inner: impl Into<String>) -> Self {
        Self {
            inner: inner.into(),
        }
    }

    pub fn expose(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({REDACTED:?})")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Borrowed plaintext that is wiped in place when the guard goes out of scope.
///
/// Used for caller-owned buffers: the caller keeps the allocation, the contents are zero once
/// the operation returns, whatever the outcome.
pub struct Scrubbed<'a> {
    buf: &'a mut [u8],
}

impl<'a> Scrubbed<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }
}

impl Deref for Scrubbed<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf
    }
}

impl DerefMut for Scrubbed<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf
    }
}

impl Drop for Scrubbed<'_> {
    fn drop(&mut self) {
        self.buf.zeroize();
    }
}

/// Zero `buf` in place.
pub fn scrub(buf: &mut [u8]) {
    buf.zeroize();
}
