//! Key manager — per-block symmetric keys wrapped by a 32-byte master key.
//!
//! # Lifecycle
//! The vault is a `{Locked, Unlocked}` state machine.  `unlock` proves the
//! master key against `SHA256(master_key ‖ salt)` — the only master-key
//! oracle ever persisted — then unwraps every stored per-block key.  `lock`
//! drops all plaintext material; every secret buffer is `Zeroizing`, so
//! memory is cleared on lock and on key overwrite.
//!
//! # Wrapping
//! Key material is wrapped with AES-256-GCM under the master key using a
//! random 12-byte wrap IV stored beside the ciphertext.  (Block payload
//! nonces are deterministic; wrap IVs are not, because a rotated key re-wraps
//! under the same master key.)
//!
//! # Revocation
//! A revoked key is retained for decrypting historical blocks but is never
//! issued for new writes; `key_for_write` surfaces the revocation as a
//! policy error.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::content::{KeyManagerContent, WrappedKey};
use crate::crypto::{sha256, CryptoError, EncryptionAlgorithm};
use crate::error::{Error, Result};

const WRAP_IV_LEN: usize = 12;
const WRAP_TAG_LEN: usize = 16;
const SALT_LEN: usize = 16;

struct KeyEntry {
    material: Zeroizing<Vec<u8>>,
    algorithm: EncryptionAlgorithm,
    wrap_iv: [u8; WRAP_IV_LEN],
    wrapped: Vec<u8>,
    created_at: i64,
    active: bool,
}

struct Vault {
    master_key: Zeroizing<[u8; 32]>,
    salt: [u8; SALT_LEN],
    verification_hash: [u8; 32],
    keys: HashMap<i64, KeyEntry>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("master_key", &"<redacted>")
            .field("salt", &"<redacted>")
            .field("verification_hash", &"<redacted>")
            .field("keys", &self.keys.len())
            .finish()
    }
}

#[derive(Debug)]
enum VaultState {
    Locked,
    Unlocked(Vault),
}

#[derive(Debug)]
pub struct KeyManager {
    state: Mutex<VaultState>,
}

impl KeyManager {
    /// A locked, empty manager.  `unlock` or `initialize` before use.
    pub fn new() -> Self {
        Self { state: Mutex::new(VaultState::Locked) }
    }

    /// Create a fresh unlocked vault for a new file: random salt, no keys.
    pub fn initialize(&self, master_key: [u8; 32]) {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let verification_hash = sha256(&[&master_key, &salt]);
        *self.state.lock() = VaultState::Unlocked(Vault {
            master_key: Zeroizing::new(master_key),
            salt,
            verification_hash,
            keys: HashMap::new(),
        });
    }

    /// Unlock against a persisted vault.
    ///
    /// Fails with an authentication error when the master key does not
    /// reproduce the stored verification hash, and when any stored key fails
    /// to unwrap (tampered vault).
    pub fn unlock(&self, master_key: &[u8; 32], content: &KeyManagerContent) -> Result<()> {
        let salt: [u8; SALT_LEN] = content
            .salt
            .as_slice()
            .try_into()
            .map_err(|_| Error::Internal("vault salt has wrong length".into()))?;
        let verification_hash = sha256(&[master_key, &salt]);
        if verification_hash.as_slice() != content.verification_hash.as_slice() {
            return Err(Error::Crypto(CryptoError::AuthenticationFailed));
        }

        let mut keys = HashMap::with_capacity(content.keys.len());
        for wk in &content.keys {
            let algorithm = EncryptionAlgorithm::from_u8(wk.algorithm as u8)
                .ok_or_else(|| Error::Internal(format!("unknown key algorithm {}", wk.algorithm)))?;
            let wrap_iv: [u8; WRAP_IV_LEN] = wk
                .wrap_iv
                .as_slice()
                .try_into()
                .map_err(|_| Error::Internal("wrap IV has wrong length".into()))?;
            let material = unwrap_key(master_key, &wrap_iv, &wk.wrapped)?;
            if material.len() != algorithm.key_len() {
                return Err(Error::Crypto(CryptoError::KeyLength {
                    expected: algorithm.key_len(),
                    got: material.len(),
                }));
            }
            keys.insert(
                wk.block_id,
                KeyEntry {
                    material,
                    algorithm,
                    wrap_iv,
                    wrapped: wk.wrapped.clone(),
                    created_at: wk.created_at,
                    active: wk.active,
                },
            );
        }

        *self.state.lock() = VaultState::Unlocked(Vault {
            master_key: Zeroizing::new(*master_key),
            salt,
            verification_hash,
            keys,
        });
        Ok(())
    }

    /// Generate (or rotate) the key for `block_id`, returning the material.
    /// An existing entry is overwritten; its plaintext is zeroized on drop.
    pub fn generate_key(
        &self,
        block_id: i64,
        algorithm: EncryptionAlgorithm,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let mut st = self.state.lock();
        let vault = unlocked(&mut st)?;

        let mut material = Zeroizing::new(vec![0u8; algorithm.key_len()]);
        OsRng.fill_bytes(&mut material);

        let mut wrap_iv = [0u8; WRAP_IV_LEN];
        OsRng.fill_bytes(&mut wrap_iv);
        let wrapped = wrap_key(&vault.master_key, &wrap_iv, &material)?;

        vault.keys.insert(
            block_id,
            KeyEntry {
                material: material.clone(),
                algorithm,
                wrap_iv,
                wrapped,
                created_at: chrono::Utc::now().timestamp(),
                active: true,
            },
        );
        Ok(material)
    }

    /// Key material for decrypting `block_id` — revoked keys included, so
    /// historical blocks stay readable.
    pub fn get_key(&self, block_id: i64) -> Result<Zeroizing<Vec<u8>>> {
        let mut st = self.state.lock();
        let vault = unlocked(&mut st)?;
        vault
            .keys
            .get(&block_id)
            .map(|e| e.material.clone())
            .ok_or(Error::NotFound(block_id))
    }

    /// Key material for a new write.  Revoked entries are refused.
    pub fn key_for_write(&self, block_id: i64) -> Result<Zeroizing<Vec<u8>>> {
        let mut st = self.state.lock();
        let vault = unlocked(&mut st)?;
        let entry = vault.keys.get(&block_id).ok_or(Error::NotFound(block_id))?;
        if !entry.active {
            return Err(Error::RevokedKey(block_id));
        }
        Ok(entry.material.clone())
    }

    /// Mark the key inactive.  Idempotent.
    pub fn revoke(&self, block_id: i64) -> Result<()> {
        let mut st = self.state.lock();
        let vault = unlocked(&mut st)?;
        let entry = vault.keys.get_mut(&block_id).ok_or(Error::NotFound(block_id))?;
        entry.active = false;
        Ok(())
    }

    /// Serialize the vault for persistence.  Only wrapped material leaves
    /// this module.
    pub fn to_content(&self) -> Result<KeyManagerContent> {
        let mut st = self.state.lock();
        let vault = unlocked(&mut st)?;
        let mut keys: Vec<WrappedKey> = vault
            .keys
            .iter()
            .map(|(block_id, e)| WrappedKey {
                block_id: *block_id,
                algorithm: e.algorithm as u8 as u32,
                wrap_iv: e.wrap_iv.to_vec(),
                wrapped: e.wrapped.clone(),
                created_at: e.created_at,
                active: e.active,
            })
            .collect();
        keys.sort_by_key(|k| k.block_id);
        Ok(KeyManagerContent {
            salt: vault.salt.to_vec(),
            verification_hash: vault.verification_hash.to_vec(),
            keys,
        })
    }

    /// Drop all plaintext material and return to `Locked`.
    pub fn lock(&self) {
        // Zeroizing buffers clear themselves as the vault drops.
        *self.state.lock() = VaultState::Locked;
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(&*self.state.lock(), VaultState::Unlocked(_))
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

fn unlocked(state: &mut VaultState) -> Result<&mut Vault> {
    match state {
        VaultState::Unlocked(v) => Ok(v),
        VaultState::Locked => Err(Error::VaultLocked),
    }
}

// ── Master-key wrapping ──────────────────────────────────────────────────────

fn wrap_key(master: &[u8; 32], iv: &[u8; WRAP_IV_LEN], material: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(master)
        .map_err(|_| Error::Crypto(CryptoError::EncryptionFailed))?;
    cipher
        .encrypt(Nonce::from_slice(iv), material)
        .map_err(|_| Error::Crypto(CryptoError::EncryptionFailed))
}

fn unwrap_key(
    master: &[u8; 32],
    iv: &[u8; WRAP_IV_LEN],
    wrapped: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if wrapped.len() < WRAP_TAG_LEN {
        return Err(Error::Crypto(CryptoError::TooShort));
    }
    let cipher = Aes256Gcm::new_from_slice(master)
        .map_err(|_| Error::Crypto(CryptoError::AuthenticationFailed))?;
    cipher
        .decrypt(Nonce::from_slice(iv), wrapped)
        .map(Zeroizing::new)
        .map_err(|_| Error::Crypto(CryptoError::AuthenticationFailed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_round_trip() {
        let master = [0xAAu8; 32];
        let km = KeyManager::new();
        km.initialize(master);
        let k1 = km.generate_key(100, EncryptionAlgorithm::Aes256Gcm).unwrap();
        let k2 = km
            .generate_key(200, EncryptionAlgorithm::Aes256CbcHmac)
            .unwrap();
        assert_eq!(k1.len(), 32);
        assert_eq!(k2.len(), 64);

        let content = km.to_content().unwrap();
        let km2 = KeyManager::new();
        km2.unlock(&master, &content).unwrap();
        assert_eq!(*km2.get_key(100).unwrap(), *k1);
        assert_eq!(*km2.get_key(200).unwrap(), *k2);
    }

    #[test]
    fn wrong_master_key_is_rejected() {
        let km = KeyManager::new();
        km.initialize([1u8; 32]);
        km.generate_key(7, EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
        let content = km.to_content().unwrap();

        let km2 = KeyManager::new();
        let err = km2.unlock(&[2u8; 32], &content).unwrap_err();
        assert!(matches!(err, Error::Crypto(CryptoError::AuthenticationFailed)));
        assert!(!km2.is_unlocked());
    }

    #[test]
    fn revoked_key_decrypts_but_never_writes() {
        let km = KeyManager::new();
        km.initialize([3u8; 32]);
        km.generate_key(9, EncryptionAlgorithm::Aes256Gcm).unwrap();
        km.revoke(9).unwrap();
        assert!(km.get_key(9).is_ok());
        assert!(matches!(km.key_for_write(9), Err(Error::RevokedKey(9))));
    }

    #[test]
    fn locked_manager_refuses_everything() {
        let km = KeyManager::new();
        assert!(matches!(km.get_key(1), Err(Error::VaultLocked)));
        km.initialize([0u8; 32]);
        km.lock();
        assert!(matches!(
            km.generate_key(1, EncryptionAlgorithm::Aes256Gcm),
            Err(Error::VaultLocked)
        ));
    }
}
