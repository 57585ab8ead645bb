//! Hashing System - SHA-256 for Unit Identity
//!
//! Compiled units are cached under a deterministic key derived from
//! their source and the engine that compiled them.

use sha2::{Sha256, Digest};

use crate::unit::RenderUnit;

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    to_hex(&hasher.finalize())
}

/// cache_key = sha256(len(name) name len(code) code len(engine_version) engine_version)
///
/// Every field is preceded by its byte length as a little-endian u64, so
/// no choice of field contents can make two distinct triples collide.
pub fn compute_unit_key(name: &str, code: &str, engine_version: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [name, code, engine_version] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    to_hex(&hasher.finalize())
}

pub fn unit_cache_key(unit: &RenderUnit) -> String {
    compute_unit_key(
        unit.source().name(),
        unit.source().code(),
        crate::ENGINE_VERSION,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceUnit;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_unit_key_changes_with_code() {
        let a = compute_unit_key("page", "<p>a</p>", "1.0.0");
        let b = compute_unit_key("page", "<p>b</p>", "1.0.0");
        assert_ne!(a, b);
        assert_eq!(a, compute_unit_key("page", "<p>a</p>", "1.0.0"));
    }

    #[test]
    fn test_unit_key_changes_with_engine() {
        let a = compute_unit_key("page", "x", "1.0.0");
        let b = compute_unit_key("page", "x", "1.1.0");
        assert_ne!(a, b);
    }

    #[test]
    fn test_unit_key_separator_in_fields_does_not_collide() {
        assert_ne!(
            compute_unit_key("a:b", "c", "1.0.0"),
            compute_unit_key("a", "b:c", "1.0.0")
        );
        assert_ne!(
            compute_unit_key("page", "x:1.0.0", ""),
            compute_unit_key("page", "x", "1.0.0")
        );
    }

    #[test]
    fn test_cache_key_distinguishes_units_with_colons() {
        let a = RenderUnit::new(SourceUnit::new("a:b", "c"), vec![], vec![]);
        let b = RenderUnit::new(SourceUnit::new("a", "b:c"), vec![], vec![]);
        assert_ne!(unit_cache_key(&a), unit_cache_key(&b));
    }

    #[test]
    fn test_unit_key_is_hex_sha256() {
        let key = compute_unit_key("page", "x", "1.0.0");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
