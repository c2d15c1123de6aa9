//! Device identity keys.
//!
//! An identity is a pair of long-term keys generated once per device: an
//! Ed25519 key for signatures and an X25519 key for Diffie-Hellman. Both
//! halves serialize as signing || dh, 64 bytes total.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::Rng;
use rusqlite::Connection;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::primitives::{self, KEY_LEN};
use crate::storage::{with_transaction, CryptoStore};

pub const IDENTITY_KEY_LEN: usize = KEY_LEN * 2;

const CONFIG_REGISTRATION_ID: &str = "registration_id";
const MAX_REGISTRATION_ID: u32 = 16380;

/// Long-term device identity keypair.
pub struct IdentityKeyPair {
    signing: SigningKey,
    dh: StaticSecret,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let (signing, _) = primitives::generate_signing_keypair();
        let (dh, _) = primitives::generate_dh_keypair();
        Self { signing, dh }
    }

    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            signing: self.signing.verifying_key(),
            dh: PublicKey::from(&self.dh),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        primitives::sign(&self.signing, message)
    }

    pub fn dh_secret(&self) -> &StaticSecret {
        &self.dh
    }

    pub fn to_private_bytes(&self) -> [u8; IDENTITY_KEY_LEN] {
        let mut out = [0u8; IDENTITY_KEY_LEN];
        out[..KEY_LEN].copy_from_slice(&self.signing.to_bytes());
        out[KEY_LEN..].copy_from_slice(&self.dh.to_bytes());
        out
    }

    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != IDENTITY_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "identity private key must be {IDENTITY_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let signing = SigningKey::from_bytes(&primitives::key_bytes(&bytes[..KEY_LEN])?);
        let dh = StaticSecret::from(primitives::key_bytes(&bytes[KEY_LEN..])?);
        Ok(Self { signing, dh })
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKeyPair([REDACTED])")
    }
}

/// Public half of an identity.
#[derive(Clone)]
pub struct IdentityPublicKey {
    pub signing: VerifyingKey,
    pub dh: PublicKey,
}

impl IdentityPublicKey {
    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_LEN] {
        let mut out = [0u8; IDENTITY_KEY_LEN];
        out[..KEY_LEN].copy_from_slice(self.signing.as_bytes());
        out[KEY_LEN..].copy_from_slice(self.dh.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != IDENTITY_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "identity public key must be {IDENTITY_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let signing = VerifyingKey::from_bytes(&primitives::key_bytes(&bytes[..KEY_LEN])?)
            .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 point".into()))?;
        let dh = PublicKey::from(primitives::key_bytes(&bytes[KEY_LEN..])?);
        Ok(Self { signing, dh })
    }
}

/// Generate and persist the device identity. Fails if one already exists.
pub fn generate_identity(conn: &Connection) -> Result<IdentityKeyPair, CryptoError> {
    with_transaction(conn, |store| {
        if store.load_identity()?.is_some() {
            return Err(CryptoError::AlreadyInitialized);
        }

        let identity = IdentityKeyPair::generate();
        store.save_identity(
            &identity.public().to_bytes(),
            &identity.to_private_bytes(),
        )?;

        let registration_id: u32 = rand::rng().random_range(1..=MAX_REGISTRATION_ID);
        store.set_config(CONFIG_REGISTRATION_ID, registration_id.to_string().as_bytes())?;

        info!(registration_id, "generated device identity");
        Ok(identity)
    })
}

/// Load the device identity from storage.
pub fn get_identity(conn: &Connection) -> Result<IdentityKeyPair, CryptoError> {
    let store = CryptoStore::new(conn);
    let (_, private) = store
        .load_identity()?
        .ok_or(CryptoError::IdentityNotInitialized)?;
    IdentityKeyPair::from_private_bytes(&private)
}

pub fn get_registration_id(conn: &Connection) -> Result<u32, CryptoError> {
    let store = CryptoStore::new(conn);
    let raw = store
        .get_config(CONFIG_REGISTRATION_ID)?
        .ok_or(CryptoError::IdentityNotInitialized)?;
    String::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CryptoError::StorageError("corrupt registration id".into()))
}

/// Base64-encoded public identity key for display and transport.
pub fn get_public_key_string(conn: &Connection) -> Result<String, CryptoError> {
    let store = CryptoStore::new(conn);
    let (public, _) = store
        .load_identity()?
        .ok_or(CryptoError::IdentityNotInitialized)?;
    Ok(BASE64.encode(public))
}
