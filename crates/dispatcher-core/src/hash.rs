//! Hash keys and the rolling hash used by the hashing algorithms
//!
//! Keys are read four bytes at a time as big-endian words; every word (and the
//! trailing partial word) is mixed in with `v ^ (v >> 3)`. The high bits are
//! folded into the low ones at the end. Zero is reserved for "no hash", so a
//! zero result is reported as 1.

use crate::error::{DispatcherError, Result};
use crate::uri::SipUri;

fn accumulate(h: u32, key: &[u8]) -> u32 {
    let mut h = h;
    let mut chunks = key.chunks_exact(4);
    for word in &mut chunks {
        let v = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        h = h.wrapping_add(v ^ (v >> 3));
    }
    let v = chunks
        .remainder()
        .iter()
        .fold(0u32, |v, b| (v << 8).wrapping_add(u32::from(*b)));
    h.wrapping_add(v ^ (v >> 3))
}

/// Hash one or two key parts. Returns 0 only when both parts are absent.
pub fn ds_hash(first: Option<&str>, second: Option<&str>) -> u32 {
    if first.is_none() && second.is_none() {
        return 0;
    }
    let mut h = 0u32;
    if let Some(key) = first {
        h = accumulate(h, key.as_bytes());
    }
    if let Some(key) = second {
        h = accumulate(h, key.as_bytes());
    }
    h = h
        .wrapping_add(h >> 11)
        .wrapping_add((h >> 13).wrapping_add(h >> 23));
    if h == 0 {
        1
    } else {
        h
    }
}

/// Key material extracted from a URI: user and `host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriHashKeys {
    pub user: String,
    pub host: Option<String>,
}

impl UriHashKeys {
    /// Build the keys from a URI string. With `user_only` the host part is
    /// left out.
    pub fn from_uri(uri: &str, user_only: bool) -> Result<Self> {
        let parsed: SipUri = uri
            .parse()
            .map_err(|_| DispatcherError::invalid_uri(uri, "cannot extract hash keys"))?;
        if parsed.user.is_none() {
            tracing::warn!("empty username in: {}", uri);
        }
        Ok(Self {
            user: parsed.user.clone().unwrap_or_default(),
            host: if user_only {
                None
            } else {
                Some(parsed.hash_host_key())
            },
        })
    }

    pub fn hash(&self) -> u32 {
        ds_hash(Some(&self.user), self.host.as_deref())
    }
}

/// Hash a single free-form value such as a Call-ID, trimming whitespace first.
pub fn hash_value(value: &str) -> Result<u32> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DispatcherError::MissingKey("empty hash value".into()));
    }
    Ok(ds_hash(Some(value), None))
}
