//! Witness signing seam.
//!
//! Key material handling (mnemonic decryption, derivation) lives outside the
//! core; the engine only needs "give me a vkey witness over this body hash".
//! Keys are resolved on demand and never cached - the decrypted material
//! lives exactly as long as one signing call.

use anyhow::{Context, Result};
use ed25519_dalek::{Signer as _, SigningKey};

use crate::models::hot_wallet::HotWallet;
use masumi_codec::tx::VkeyWitness;

/// Produces vkey witnesses for transactions the engine authors.
pub trait WalletSigner: Send + Sync {
    /// Witness for a hot wallet over a transaction body hash.
    fn sign(&self, wallet: &HotWallet, body_hash: &[u8; 32]) -> Result<VkeyWitness>;

    /// Witness for an admin wallet, addressed by its bech32 address.
    /// Used by the multi-sig dispatchers; returns an error when this
    /// coordinator does not hold that admin's key.
    fn sign_admin(&self, address: &str, body_hash: &[u8; 32]) -> Result<VkeyWitness>;

    /// Whether this instance holds the admin key for `address`. The
    /// multi-sig dispatchers select co-signers before the body is built, so
    /// only admins that will actually witness end up as required signers.
    fn has_admin_key(&self, address: &str) -> bool;
}

/// Resolves an encrypted mnemonic blob to a signing key. Implemented by the
/// operations layer (encryption-at-rest is outside the core).
pub type KeyResolver = dyn Fn(&[u8]) -> Result<SigningKey> + Send + Sync;

/// Ed25519 signer over resolved keys.
pub struct Ed25519Signer {
    resolver: Box<KeyResolver>,
    /// Admin signing keys held by this instance, by bech32 address.
    admin_keys: std::collections::HashMap<String, SigningKey>,
}

impl Ed25519Signer {
    pub fn new(resolver: Box<KeyResolver>) -> Self {
        Self {
            resolver,
            admin_keys: std::collections::HashMap::new(),
        }
    }

    pub fn with_admin_key(mut self, address: &str, key: SigningKey) -> Self {
        self.admin_keys.insert(address.to_string(), key);
        self
    }

    fn witness(key: &SigningKey, body_hash: &[u8; 32]) -> VkeyWitness {
        let signature = key.sign(body_hash);
        VkeyWitness {
            vkey: key.verifying_key().to_bytes(),
            signature: signature.to_bytes(),
        }
    }
}

impl WalletSigner for Ed25519Signer {
    fn sign(&self, wallet: &HotWallet, body_hash: &[u8; 32]) -> Result<VkeyWitness> {
        let key = (self.resolver)(&wallet.encrypted_mnemonic)
            .with_context(|| format!("Failed to resolve signing key for wallet {}", wallet.id))?;
        Ok(Self::witness(&key, body_hash))
    }

    fn sign_admin(&self, address: &str, body_hash: &[u8; 32]) -> Result<VkeyWitness> {
        let key = self
            .admin_keys
            .get(address)
            .with_context(|| format!("No admin key held for {address}"))?;
        Ok(Self::witness(key, body_hash))
    }

    fn has_admin_key(&self, address: &str) -> bool {
        self.admin_keys.contains_key(address)
    }
}
