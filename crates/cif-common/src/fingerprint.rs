//! Fingerprint utilities for observable deduplication

use crate::types::Observable;
use sha2::{Digest, Sha256};

/// Compute the journal fingerprint of an observable.
///
/// Hex SHA-256 over the type tag, a NUL separator and the value, so the
/// fingerprint depends on identity only and never on enrichment fields.
pub fn fingerprint(observable: &Observable) -> String {
    let (otype, value) = observable.identity();
    let mut hasher = Sha256::new();
    hasher.update(otype.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::ObservableType;

    #[test]
    fn test_fingerprint_is_identity_only() {
        let a = Observable::new(ObservableType::Fqdn, "example.com");
        let mut b = Observable::new(ObservableType::Fqdn, "example.com");
        b.tags = vec!["malware".to_string()];
        b.confidence = Some(50);

        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_fingerprint_separates_types() {
        let fqdn = Observable::new(ObservableType::Fqdn, "example.com");
        let url = Observable::new(ObservableType::Url, "example.com");
        assert_ne!(fingerprint(&fqdn), fingerprint(&url));
    }

    #[test]
    fn test_fingerprint_known_value() {
        let observable = Observable::new(ObservableType::Ipv4, "192.0.2.1");
        let mut hasher = Sha256::new();
        hasher.update(b"ipv4\x00192.0.2.1");
        assert_eq!(fingerprint(&observable), hex::encode(hasher.finalize()));
    }
}
