//! Deterministic identity helpers shared by the graph adapter and the ingest pipeline.

use sha2::{Digest, Sha256};

/// Service identity: SHA-256 of `lowercase(name) || '|' || lowercase(product) || '|' || lowercase(version)`.
///
/// Case-insensitive by construction, so `fp("HTTP","NGINX","1.24") == fp("http","nginx","1.24")`.
pub fn service_fingerprint(name: &str, product: &str, version: &str) -> String {
    let canonical = format!(
        "{}|{}|{}",
        name.to_lowercase(),
        product.to_lowercase(),
        version.to_lowercase()
    );
    hex_sha256(canonical.as_bytes())
}

/// Banner identity: SHA-256 of the canonical (UTF-8, untrimmed) sample bytes.
pub fn banner_hash(sample: &str) -> String {
    hex_sha256(sample.as_bytes())
}

/// Certificate identity: SHA-256 of the DER-encoded certificate bytes.
pub fn cert_hash(der: &[u8]) -> String {
    hex_sha256(der)
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_case_insensitive() {
        assert_eq!(
            service_fingerprint("HTTP", "NGINX", "1.24"),
            service_fingerprint("http", "nginx", "1.24")
        );
    }

    #[test]
    fn fingerprint_is_deterministic_and_distinguishes_inputs() {
        let a = service_fingerprint("http", "nginx", "1.24");
        let b = service_fingerprint("http", "nginx", "1.25");
        assert_ne!(a, b);
        assert_eq!(a, service_fingerprint("http", "nginx", "1.24"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn banner_hash_is_stable() {
        assert_eq!(banner_hash("SSH-2.0-OpenSSH_8.2"), banner_hash("SSH-2.0-OpenSSH_8.2"));
        assert_ne!(banner_hash("a"), banner_hash("b"));
    }
}
