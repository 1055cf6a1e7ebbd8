use sha2::{Digest, Sha256};
use std::fmt::Write;

pub(crate) fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

/// Stable fingerprint of a log message; whitespace at the edges is ignored.
pub fn message_fingerprint(text: &str) -> String {
    sha256_hex(text.trim())
}

/// Short label used for clusters formed from identical text.
pub(crate) fn cluster_label(text: &str) -> String {
    let mut fingerprint = message_fingerprint(text);
    fingerprint.truncate(12);
    fingerprint
}

/// Key for `pg_advisory_xact_lock`, stable across processes.
pub(crate) fn advisory_lock_key(namespace: &str, value: &str) -> i64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in format!("{namespace}:{value}").as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_edge_whitespace() {
        assert_eq!(
            message_fingerprint("  disk full\n"),
            message_fingerprint("disk full")
        );
        assert_ne!(message_fingerprint("disk full"), message_fingerprint("disk ok"));
    }

    #[test]
    fn sha256_hex_is_lowercase_hex() {
        let hash = sha256_hex("abc");
        assert_eq!(hash.len(), 64);
        assert!(hash.starts_with("ba7816bf"));
        assert_eq!(cluster_label("abc").len(), 12);
    }

    #[test]
    fn advisory_keys_separate_namespaces() {
        assert_eq!(
            advisory_lock_key("cv_alerts", "cfg:109"),
            advisory_lock_key("cv_alerts", "cfg:109")
        );
        assert_ne!(
            advisory_lock_key("cv_alerts", "cfg:109"),
            advisory_lock_key("cv_alerts", "cfg:110")
        );
    }
}
