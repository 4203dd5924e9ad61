//! Custodial key vault: encryption-at-rest and controlled use of per-user
//! signing keys.
//!
//! Users never hold their own key material. The vault seals each ed25519
//! seed under a process-wide master key and signs on a user's behalf; the
//! plaintext seed exists only inside [`KeyVault::sign_with_sealed_key`] and
//! is zeroized before the call returns.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::VaultError;
use crate::utils::sha256_bytes;

const IV_LEN: usize = 12;
const SEED_LEN: usize = 32;

/// Process-wide vault. The master key is derived once from an operator
/// supplied secret at startup and is read-only afterwards, so the vault is
/// freely shared across tasks. No key rotation.
pub struct KeyVault {
    master: [u8; 32],
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("master", &"[REDACTED]")
            .finish()
    }
}

impl KeyVault {
    pub fn new(operator_secret: &str) -> Self {
        Self {
            master: sha256_bytes(operator_secret.as_bytes()),
        }
    }

    /// Encrypt key material for storage. A fresh random IV is drawn inside
    /// every call; callers cannot supply one, so IV reuse under the master
    /// key cannot happen. Output is the persisted `ivHex:cipherHex` record.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.master));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| VaultError::EncryptionFailed)?;

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Decrypt a record produced by [`KeyVault::seal`]. The AEAD tag makes
    /// tampered or truncated ciphertext fail authentication rather than
    /// decrypt to garbage.
    pub fn unseal(&self, record: &str) -> Result<Vec<u8>, VaultError> {
        let (iv, ciphertext) = parse_record(record)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.master));
        cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| VaultError::DecryptionFailed)
    }

    /// Unseal a signing key, sign `message` with it and discard the
    /// plaintext. The unsealed material must be exactly the 32-byte ed25519
    /// seed; anything else is rejected before it can reach a signer.
    pub fn sign_with_sealed_key(
        &self,
        record: &str,
        message: &[u8],
    ) -> Result<[u8; 64], VaultError> {
        let mut plaintext = self.unseal(record)?;

        if plaintext.len() != SEED_LEN {
            plaintext.zeroize();
            return Err(VaultError::InvalidKeyFormat);
        }
        let mut seed = [0u8; SEED_LEN];
        seed.copy_from_slice(&plaintext);
        plaintext.zeroize();

        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        let signature = signing_key.sign(message);
        Ok(signature.to_bytes())
    }
}

fn parse_record(record: &str) -> Result<([u8; IV_LEN], Vec<u8>), VaultError> {
    let (iv_hex, ciphertext_hex) = record.split_once(':').ok_or(VaultError::Malformed)?;

    let iv_bytes = hex::decode(iv_hex).map_err(|_| VaultError::Malformed)?;
    let iv: [u8; IV_LEN] = iv_bytes.try_into().map_err(|_| VaultError::Malformed)?;
    let ciphertext = hex::decode(ciphertext_hex).map_err(|_| VaultError::Malformed)?;

    Ok((iv, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    #[test]
    fn seal_unseal_roundtrip() {
        let vault = KeyVault::new("operator secret");
        let secret = b"some signing seed material";

        let record = vault.seal(secret).unwrap();
        assert_eq!(record.split(':').count(), 2);

        let plaintext = vault.unseal(&record).unwrap();
        assert_eq!(plaintext, secret);
    }

    #[test]
    fn sealing_twice_uses_distinct_ivs() {
        let vault = KeyVault::new("operator secret");

        let a = vault.seal(b"same plaintext").unwrap();
        let b = vault.seal(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_record_fails_authentication() {
        let vault = KeyVault::new("operator secret");
        let record = vault.seal(b"seed").unwrap();

        // Flip the last ciphertext nibble.
        let mut tampered = record.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });

        assert_eq!(vault.unseal(&tampered), Err(VaultError::DecryptionFailed));
    }

    #[test]
    fn truncated_and_garbled_records_are_malformed() {
        let vault = KeyVault::new("operator secret");

        assert_eq!(vault.unseal("no-separator"), Err(VaultError::Malformed));
        assert_eq!(vault.unseal("abcd:nothex!"), Err(VaultError::Malformed));
        // IV of the wrong length
        assert_eq!(vault.unseal("abcd:deadbeef"), Err(VaultError::Malformed));
    }

    #[test]
    fn different_master_secret_cannot_unseal() {
        let vault = KeyVault::new("operator secret");
        let other = KeyVault::new("another secret");

        let record = vault.seal(b"seed").unwrap();
        assert_eq!(other.unseal(&record), Err(VaultError::DecryptionFailed));
    }

    #[test]
    fn signs_with_sealed_seed() {
        let vault = KeyVault::new("operator secret");
        let signing_key = SigningKey::from_bytes(&[42u8; 32]);
        let record = vault.seal(&signing_key.to_bytes()).unwrap();

        let message = b"instruction bytes";
        let signature = vault.sign_with_sealed_key(&record, message).unwrap();

        let verifying_key = VerifyingKey::from_bytes(&signing_key.verifying_key().to_bytes()).unwrap();
        assert!(
            verifying_key
                .verify(message, &Signature::from_bytes(&signature))
                .is_ok()
        );
    }

    #[test]
    fn wrong_length_key_material_is_rejected() {
        let vault = KeyVault::new("operator secret");
        let record = vault.seal(b"way too short").unwrap();

        let err = vault.sign_with_sealed_key(&record, b"msg").unwrap_err();
        assert_eq!(err, VaultError::InvalidKeyFormat);
    }
}
