//! Encrypted at-rest identity persistence
//!
//! The identity file is a versioned bincode record. Public halves are stored
//! in the clear; both secret keys are wrapped with AES-256-GCM under a key
//! derived from the caller's passphrase via Argon2id. Schema changes are
//! forward-only; readers tolerate unknown trailing bytes.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroizing;

use lib_crypto::{
    fill_random, AgreementPublic, AgreementSecret, KeyPair, PrivateKey, PublicKey,
};

use crate::identity::WeftIdentity;

/// Current identity file schema version
pub const IDENTITY_SCHEMA_VERSION: u32 = 1;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const WRAP_AAD: &[u8] = b"weft-identity-wrap-v1";

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    version: u32,
    long_term_pub: PublicKey,
    agreement_pub: AgreementPublic,
    kdf_salt: Vec<u8>,
    wrap_nonce: Vec<u8>,
    /// AES-256-GCM over ed25519_sk (32) || x25519_sk (32)
    wrapped_secrets: Vec<u8>,
    created_at_ms: u64,
}

/// Durable storage for the local identity
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        IdentityStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the identity, or create and persist a fresh one on first launch
    pub fn load_or_create(&self, passphrase: &str) -> Result<WeftIdentity> {
        if self.path.exists() {
            self.load(passphrase)
        } else {
            let identity = WeftIdentity::generate()?;
            self.save(&identity, passphrase)?;
            info!(fingerprint = %identity.fingerprint(), "created new identity");
            Ok(identity)
        }
    }

    /// Read and unwrap the identity file
    pub fn load(&self, passphrase: &str) -> Result<WeftIdentity> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("reading identity file {}", self.path.display()))?;
        let record: IdentityRecord =
            bincode::deserialize(&bytes).context("identity file schema mismatch")?;
        if record.version > IDENTITY_SCHEMA_VERSION {
            return Err(anyhow!(
                "identity file version {} is newer than supported {}",
                record.version,
                IDENTITY_SCHEMA_VERSION
            ));
        }
        if record.kdf_salt.len() != SALT_LEN || record.wrap_nonce.len() != NONCE_LEN {
            return Err(anyhow!("identity file has malformed wrap parameters"));
        }

        let wrap_key = derive_wrap_key(passphrase, &record.kdf_salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrap_key.as_ref()));
        let plain = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&record.wrap_nonce),
                    Payload {
                        msg: &record.wrapped_secrets,
                        aad: WRAP_AAD,
                    },
                )
                .map_err(|_| anyhow!("identity unwrap failed: wrong passphrase or corrupt file"))?,
        );
        if plain.len() != 64 {
            return Err(anyhow!("identity file has malformed secret block"));
        }

        let mut signing = [0u8; 32];
        let mut agreement = [0u8; 32];
        signing.copy_from_slice(&plain[..32]);
        agreement.copy_from_slice(&plain[32..64]);

        let keypair = KeyPair::from_parts(
            PrivateKey::from_bytes(signing),
            AgreementSecret::from_bytes(agreement),
        );

        // The stored public halves are advisory; the secrets are the truth.
        if keypair.public != record.long_term_pub {
            return Err(anyhow!("identity file public key does not match secrets"));
        }

        Ok(WeftIdentity::from_parts(keypair, record.created_at_ms))
    }

    /// Wrap and write the identity. A fresh salt and nonce are drawn on
    /// every save, so rewrapping never reuses an AEAD nonce.
    pub fn save(&self, identity: &WeftIdentity, passphrase: &str) -> Result<()> {
        let mut salt = vec![0u8; SALT_LEN];
        fill_random(&mut salt)?;
        let mut nonce = vec![0u8; NONCE_LEN];
        fill_random(&mut nonce)?;

        let (signing, agreement) = identity.keypair().secret_parts();
        let mut plain = Zeroizing::new([0u8; 64]);
        plain[..32].copy_from_slice(signing.expose_bytes());
        plain[32..].copy_from_slice(agreement.expose_bytes());

        let wrap_key = derive_wrap_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrap_key.as_ref()));
        let wrapped = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plain.as_ref(),
                    aad: WRAP_AAD,
                },
            )
            .map_err(|_| anyhow!("identity wrap failed"))?;

        let record = IdentityRecord {
            version: IDENTITY_SCHEMA_VERSION,
            long_term_pub: identity.peer_id(),
            agreement_pub: identity.agreement_public(),
            kdf_salt: salt,
            wrap_nonce: nonce,
            wrapped_secrets: wrapped,
            created_at_ms: if identity.created_at_ms() == 0 {
                Utc::now().timestamp_millis() as u64
            } else {
                identity.created_at_ms()
            },
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(&record)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Replace the stored identity with freshly rotated keys
    pub fn rotate(&self, current: &WeftIdentity, passphrase: &str) -> Result<WeftIdentity> {
        let rotated = current.rotate()?;
        self.save(&rotated, passphrase)?;
        info!(
            old = %current.fingerprint(),
            new = %rotated.fingerprint(),
            "rotated identity"
        );
        Ok(rotated)
    }
}

fn derive_wrap_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    argon2::Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|e| anyhow!("passphrase derivation failed: {}", e))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_then_load() -> Result<()> {
        let dir = tempdir()?;
        let store = IdentityStore::new(dir.path().join("identity.bin"));

        let created = store.load_or_create("correct horse")?;
        let loaded = store.load_or_create("correct horse")?;
        assert_eq!(created.peer_id(), loaded.peer_id());
        assert_eq!(created.agreement_public(), loaded.agreement_public());
        Ok(())
    }

    #[test]
    fn test_wrong_passphrase_fails() -> Result<()> {
        let dir = tempdir()?;
        let store = IdentityStore::new(dir.path().join("identity.bin"));
        store.load_or_create("correct horse")?;
        assert!(store.load("battery staple").is_err());
        Ok(())
    }

    #[test]
    fn test_rotate_persists_new_keys() -> Result<()> {
        let dir = tempdir()?;
        let store = IdentityStore::new(dir.path().join("identity.bin"));
        let original = store.load_or_create("pw")?;
        let rotated = store.rotate(&original, "pw")?;

        let loaded = store.load("pw")?;
        assert_eq!(loaded.peer_id(), rotated.peer_id());
        assert_ne!(loaded.peer_id(), original.peer_id());
        Ok(())
    }

    #[test]
    fn test_signing_survives_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let store = IdentityStore::new(dir.path().join("identity.bin"));
        let created = store.load_or_create("pw")?;
        let loaded = store.load("pw")?;

        let sig = loaded.sign(b"after restart");
        assert!(created.peer_id().verify(b"after restart", &sig));
        Ok(())
    }
}
