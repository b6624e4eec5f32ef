/// Key handling helpers: namespace prefixing, validation and hashing
use crate::error::{AlacenaError, AlacenaResult};
use crate::protocol::MAX_KEY_LENGTH;
use bytes::{BufMut, Bytes, BytesMut};

/// Prefix prepended to every key so client instances can share servers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    prefix: Bytes,
}

impl Namespace {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: Bytes::from(prefix.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.prefix
    }

    /// Prefixed wire key
    pub fn apply(&self, key: &[u8]) -> Bytes {
        if self.prefix.is_empty() {
            return Bytes::copy_from_slice(key);
        }
        let mut buf = BytesMut::with_capacity(self.prefix.len() + key.len());
        buf.put_slice(&self.prefix);
        buf.put_slice(key);
        buf.freeze()
    }

    /// Caller-facing key for a wire key; keys without the prefix are returned as-is
    pub fn strip<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        key.strip_prefix(self.prefix.as_ref()).unwrap_or(key)
    }
}

/// Reject keys the text protocol cannot frame.
///
/// Applied to the prefixed key for both protocols so a key set over one protocol can
/// always be read back over the other.
pub fn validate_key(key: &[u8]) -> AlacenaResult<()> {
    if key.is_empty() {
        return Err(AlacenaError::invalid_key("key is empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(AlacenaError::invalid_key(format!(
            "key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }
    if let Some(pos) = key.iter().position(|b| *b <= b' ' || *b == 0x7f) {
        return Err(AlacenaError::invalid_key(format!(
            "whitespace or control byte at offset {}",
            pos
        )));
    }
    Ok(())
}

/// Stable 32-bit hash of a key, taken from its MD5 digest
pub fn key_hash(key: &[u8]) -> u32 {
    let digest = md5::compute(key);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Format duration for human-readable output
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else if secs < 86_400 {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{}d{}h{}m", secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60)
    }
}

/// Format byte size for human-readable output
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_apply_and_strip() {
        let ns = Namespace::new("mytest.");
        let key = ns.apply(b"foo");
        assert_eq!(&key[..], b"mytest.foo");
        assert_eq!(ns.strip(&key), b"foo");
        assert_eq!(ns.strip(b"other"), b"other");

        let empty = Namespace::default();
        assert!(empty.is_empty());
        assert_eq!(&empty.apply(b"foo")[..], b"foo");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key(b"CMAETest.42").is_ok());
        assert!(validate_key(b"").is_err());
        assert!(validate_key(b"has space").is_err());
        assert!(validate_key(b"line\r\nbreak").is_err());
        assert!(validate_key(&[b'k'; MAX_KEY_LENGTH]).is_ok());
        assert!(validate_key(&[b'k'; MAX_KEY_LENGTH + 1]).is_err());
    }

    #[test]
    fn test_key_hash_is_stable() {
        assert_eq!(key_hash(b"foo"), key_hash(b"foo"));
        assert_ne!(key_hash(b"foo"), key_hash(b"bar"));
        // md5("") = d41d8cd9...
        assert_eq!(key_hash(b""), 0xd41d_8cd9);
    }

    #[test]
    fn test_format_duration() {
        use std::time::Duration;

        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1d1h1m");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
