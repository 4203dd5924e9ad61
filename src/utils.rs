//! Utility functions for hashing and encoding

/// Digest arbitrary bytes down to the raw 32-byte sha256 output.
pub(crate) fn sha256_bytes(input: &[u8]) -> [u8; 32] {
    let hex_digest = sha256::digest(input);
    let raw = hex::decode(hex_digest).expect("sha256 digest is valid hex");
    raw.try_into().expect("sha256 digest is 32 bytes")
}
