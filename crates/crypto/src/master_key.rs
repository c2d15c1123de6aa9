//! Master key derivation and recovery.
//!
//! The 32-byte master key is derived from the user's password with Argon2id
//! and held only in memory. It is exportable exactly once as a 24-word
//! recovery phrase, and everything else (database encryption key,
//! verification hash) is derived from it with HKDF.

use argon2::{Algorithm, Argon2, Params, Version};
use bip39::Mnemonic;
use hkdf::Hkdf;
use rusqlite::Connection;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::primitives::{random_array, KEY_LEN};
use crate::storage::CryptoStore;

const DEFAULT_M_COST_KIB: u32 = 65536;
const DEFAULT_T_COST: u32 = 3;
const DEFAULT_P_COST: u32 = 4;
const SALT_LEN: usize = 16;

const CONFIG_KDF_SALT: &str = "kdf_salt";
const CONFIG_KDF_M_COST: &str = "kdf_m_cost";
const CONFIG_KDF_T_COST: &str = "kdf_t_cost";
const CONFIG_KDF_P_COST: &str = "kdf_p_cost";
const CONFIG_MASTER_VERIFY: &str = "master_verify";
const CONFIG_PHRASE_AVAILABLE: &str = "recovery_phrase_available";

const VERIFY_INFO: &[u8] = b"murmur-master-verify-v1";
const DB_KEY_INFO: &[u8] = b"murmur-db-encryption-v1";

/// The in-memory master key. Wiped on drop, never logged.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Hex-encoded raw key for SQLCipher's `PRAGMA key`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DbEncryptionKey {
    key_hex: String,
}

impl std::fmt::Debug for DbEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbEncryptionKey([REDACTED])")
    }
}

fn argon2_derive(
    password: &str,
    salt: &[u8],
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
) -> Result<MasterKey, CryptoError> {
    let params = Params::new(m_cost, t_cost, p_cost, Some(KEY_LEN))
        .map_err(|e| CryptoError::InvalidKey(format!("invalid Argon2 parameters: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::InvalidKey(format!("key derivation failed: {e}")))?;
    Ok(MasterKey(out))
}

fn verification_hash(master: &MasterKey) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut out = [0u8; KEY_LEN];
    hk.expand(VERIFY_INFO, &mut out)
        .expect("32 bytes is a valid HKDF output length");
    out
}

fn read_u32_config(store: &CryptoStore, key: &str) -> Result<u32, CryptoError> {
    let raw = store
        .get_config(key)?
        .ok_or(CryptoError::IdentityNotInitialized)?;
    String::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CryptoError::StorageError(format!("corrupt config value for {key}")))
}

/// Set up the master key for a fresh device: generates a salt, stores the
/// KDF parameters and a verification hash, and marks the recovery phrase
/// available for one-time export.
pub fn initialize_master_key(conn: &Connection, password: &str) -> Result<MasterKey, CryptoError> {
    let store = CryptoStore::new(conn);
    if store.get_config(CONFIG_MASTER_VERIFY)?.is_some() {
        return Err(CryptoError::AlreadyInitialized);
    }

    let salt = random_array::<SALT_LEN>();
    let master = argon2_derive(
        password,
        &salt,
        DEFAULT_M_COST_KIB,
        DEFAULT_T_COST,
        DEFAULT_P_COST,
    )?;

    store.set_config(CONFIG_KDF_SALT, &salt)?;
    store.set_config(CONFIG_KDF_M_COST, DEFAULT_M_COST_KIB.to_string().as_bytes())?;
    store.set_config(CONFIG_KDF_T_COST, DEFAULT_T_COST.to_string().as_bytes())?;
    store.set_config(CONFIG_KDF_P_COST, DEFAULT_P_COST.to_string().as_bytes())?;
    store.set_config(CONFIG_MASTER_VERIFY, &verification_hash(&master))?;
    store.set_config(CONFIG_PHRASE_AVAILABLE, b"1")?;

    debug!("master key initialized");
    Ok(master)
}

/// Re-derive the master key from the password using the stored KDF
/// parameters and check it against the verification hash.
pub fn unlock_master_key(conn: &Connection, password: &str) -> Result<MasterKey, CryptoError> {
    let store = CryptoStore::new(conn);
    let salt = store
        .get_config(CONFIG_KDF_SALT)?
        .ok_or(CryptoError::IdentityNotInitialized)?;
    let m_cost = read_u32_config(&store, CONFIG_KDF_M_COST)?;
    let t_cost = read_u32_config(&store, CONFIG_KDF_T_COST)?;
    let p_cost = read_u32_config(&store, CONFIG_KDF_P_COST)?;

    let master = argon2_derive(password, &salt, m_cost, t_cost, p_cost)?;

    let stored = store
        .get_config(CONFIG_MASTER_VERIFY)?
        .ok_or(CryptoError::IdentityNotInitialized)?;
    if !bool::from(verification_hash(&master).ct_eq(stored.as_slice())) {
        return Err(CryptoError::InvalidKey("password verification failed".into()));
    }
    Ok(master)
}

/// Export the master key as a 24-word recovery phrase. Available exactly
/// once per initialization; later calls fail.
pub fn take_recovery_phrase(
    conn: &Connection,
    master: &MasterKey,
) -> Result<Vec<String>, CryptoError> {
    let store = CryptoStore::new(conn);
    let available = store
        .get_config(CONFIG_PHRASE_AVAILABLE)?
        .ok_or(CryptoError::IdentityNotInitialized)?;
    if available != b"1" {
        return Err(CryptoError::RecoveryPhraseUnavailable);
    }

    let mnemonic = Mnemonic::from_entropy(master.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(format!("entropy rejected: {e}")))?;
    store.set_config(CONFIG_PHRASE_AVAILABLE, b"0")?;

    Ok(mnemonic.words().map(str::to_owned).collect())
}

/// Reconstruct the master key from a 24-word recovery phrase.
///
/// On a device that already holds a verification hash the reconstructed
/// key must match it. On a fresh device the hash is recorded so later
/// recoveries are checked.
pub fn recover_master_key(conn: &Connection, phrase: &str) -> Result<MasterKey, CryptoError> {
    let mnemonic = Mnemonic::parse(phrase).map_err(|_| CryptoError::InvalidRecoveryPhrase)?;
    let entropy = mnemonic.to_entropy();
    if entropy.len() != KEY_LEN {
        return Err(CryptoError::InvalidRecoveryPhrase);
    }
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&entropy);
    let master = MasterKey(bytes);

    let store = CryptoStore::new(conn);
    match store.get_config(CONFIG_MASTER_VERIFY)? {
        Some(stored) => {
            if !bool::from(verification_hash(&master).ct_eq(stored.as_slice())) {
                return Err(CryptoError::InvalidRecoveryPhrase);
            }
        }
        None => {
            store.set_config(CONFIG_MASTER_VERIFY, &verification_hash(&master))?;
            store.set_config(CONFIG_PHRASE_AVAILABLE, b"0")?;
        }
    }
    Ok(master)
}

/// Derive the SQLCipher database key from the master key.
pub fn derive_db_encryption_key(master: &MasterKey) -> DbEncryptionKey {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut out = [0u8; KEY_LEN];
    hk.expand(DB_KEY_INFO, &mut out)
        .expect("32 bytes is a valid HKDF output length");
    let key = DbEncryptionKey {
        key_hex: hex_encode(&out),
    };
    out.zeroize();
    key
}

/// Key a SQLCipher connection and confirm the database is readable.
pub fn apply_encryption_key(conn: &Connection, key: &DbEncryptionKey) -> Result<(), CryptoError> {
    conn.execute_batch(&format!("PRAGMA key = \"x'{}'\";", key.key_hex))?;

    let cipher_version: String = conn
        .query_row("PRAGMA cipher_version", [], |row| row.get(0))
        .map_err(|_| {
            CryptoError::StorageError("SQLCipher is not available in this build".into())
        })?;
    debug!(%cipher_version, "applied database encryption key");

    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|_| CryptoError::InvalidKey("database key verification failed".into()))?;
    Ok(())
}

/// Whether the database file at `path` is encrypted. An unreadable header
/// (SQLITE_NOTADB) means SQLCipher encryption is in place.
pub fn detect_encryption_status(path: &std::path::Path) -> Result<bool, CryptoError> {
    let conn = Connection::open(path)?;
    match conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    }) {
        Ok(_) => Ok(false),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.extended_code == 26 => Ok(true),
        Err(e) => Err(e.into()),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
