pub mod resolver;
pub mod server;
pub mod session;
pub mod term;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Canonical fingerprint of a public key wire form:
/// `"SHA256:" + Base64(SHA-256(bytes))`, unpadded like OpenSSH prints it.
pub fn fingerprint(wire: &[u8]) -> String {
    let digest = Sha256::digest(wire);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_has_the_canonical_shape() {
        let fp = fingerprint(b"some key material");
        assert!(fp.starts_with("SHA256:"));
        // 32 bytes of digest encode to 43 unpadded base64 characters.
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        assert_eq!(fingerprint(b"a"), fingerprint(b"a"));
        assert_ne!(fingerprint(b"a"), fingerprint(b"b"));
    }
}
