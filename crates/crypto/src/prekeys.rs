//! Signed pre-keys and one-time pre-keys.
//!
//! The signed pre-key is a medium-term X25519 key signed by the identity
//! key and rotated periodically. Retired signed pre-keys stay decryptable
//! for a grace window so handshakes in flight still complete. One-time
//! pre-keys are single-use keys consumed on first handshake; consumed rows
//! are tombstoned so replays are detectable.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use x25519_dalek::StaticSecret;

use crate::error::CryptoError;
use crate::identity;
use crate::primitives::{self, KEY_LEN};
use crate::storage::{with_transaction, CryptoStore};

/// Rotate the signed pre-key after this many days.
pub const SIGNED_PRE_KEY_MAX_AGE_DAYS: u32 = 7;
/// Keep retired signed pre-keys decryptable for this long.
pub const SIGNED_PRE_KEY_GRACE_SECS: i64 = 7 * 86_400;
/// Replenish one-time pre-keys when fewer than this remain.
pub const REPLENISH_THRESHOLD: u32 = 20;
/// One-time pre-keys generated per batch.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    pub public_key: [u8; KEY_LEN],
    pub signature: Vec<u8>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    pub public_key: [u8; KEY_LEN],
}

/// Everything a device uploads to the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedBundle {
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyPublic,
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// What a sender receives when fetching a peer's bundle: at most one
/// one-time pre-key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedBundle {
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyPublic,
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
}

/// Generate a new signed pre-key, retire the previous one, and prune
/// retired keys past the grace window.
pub fn rotate_signed_pre_key(conn: &Connection) -> Result<SignedPreKeyPublic, CryptoError> {
    let identity = identity::get_identity(conn)?;

    with_transaction(conn, |store| {
        let key_id = store.next_signed_pre_key_id()?;
        let (secret, public) = primitives::generate_dh_keypair();
        let signature = identity.sign(public.as_bytes());

        store.insert_signed_pre_key(
            key_id,
            public.as_bytes(),
            &secret.to_bytes(),
            &signature,
        )?;
        store.retire_signed_pre_keys_except(key_id)?;
        let pruned = store.prune_retired_signed_pre_keys(SIGNED_PRE_KEY_GRACE_SECS)?;
        if pruned > 0 {
            info!(pruned, "pruned retired signed pre-keys");
        }

        let (_, _, _, created_at) = store
            .active_signed_pre_key()?
            .ok_or_else(|| CryptoError::StorageError("signed pre-key vanished".into()))?;

        info!(key_id, "rotated signed pre-key");
        Ok(SignedPreKeyPublic {
            key_id,
            public_key: *public.as_bytes(),
            signature: signature.to_vec(),
            created_at,
        })
    })
}

/// Private half of a signed pre-key, including retired keys still inside
/// the grace window. Runs without its own transaction so handshake
/// processing can call it mid-transaction.
pub fn get_signed_pre_key_secret(
    conn: &Connection,
    key_id: u32,
) -> Result<StaticSecret, CryptoError> {
    let store = CryptoStore::new(conn);
    let private = store
        .signed_pre_key_private(key_id)?
        .ok_or(CryptoError::PreKeyNotFound { key_id })?;
    Ok(StaticSecret::from(primitives::key_bytes(&private)?))
}

/// Generate a batch of one-time pre-keys with sequential ids.
pub fn generate_one_time_pre_keys(
    conn: &Connection,
    count: u32,
) -> Result<Vec<OneTimePreKeyPublic>, CryptoError> {
    with_transaction(conn, |store| {
        let start = store.next_pre_key_id()?;
        let mut generated = Vec::with_capacity(count as usize);
        for key_id in start..start + count {
            let (secret, public) = primitives::generate_dh_keypair();
            store.insert_pre_key(key_id, public.as_bytes(), &secret.to_bytes())?;
            generated.push(OneTimePreKeyPublic {
                key_id,
                public_key: *public.as_bytes(),
            });
        }
        info!(count, start, "generated one-time pre-keys");
        Ok(generated)
    })
}

pub fn mark_pre_keys_uploaded(conn: &Connection, key_ids: &[u32]) -> Result<(), CryptoError> {
    let store = CryptoStore::new(conn);
    store.mark_pre_keys_uploaded(key_ids)
}

/// Consume a one-time pre-key: returns its secret and tombstones the row.
/// A second consumption of the same id is an error, as is an unknown id.
/// Runs without its own transaction; callers wrap it.
pub fn consume_one_time_pre_key(
    conn: &Connection,
    key_id: u32,
) -> Result<StaticSecret, CryptoError> {
    let store = CryptoStore::new(conn);
    let (private, consumed) = store
        .get_pre_key(key_id)?
        .ok_or(CryptoError::PreKeyNotFound { key_id })?;
    if consumed {
        warn!(key_id, "one-time pre-key replay detected");
        return Err(CryptoError::PreKeyAlreadyConsumed { key_id });
    }
    let secret = StaticSecret::from(primitives::key_bytes(&private)?);
    store.mark_pre_key_consumed(key_id)?;
    Ok(secret)
}

pub fn needs_replenishment(conn: &Connection, threshold: u32) -> Result<bool, CryptoError> {
    let store = CryptoStore::new(conn);
    Ok(store.count_available_pre_keys()? < threshold)
}

/// Whether the active signed pre-key is older than `max_age_days`. A
/// missing signed pre-key counts as stale.
pub fn is_signed_pre_key_stale(conn: &Connection, max_age_days: u32) -> Result<bool, CryptoError> {
    let store = CryptoStore::new(conn);
    match store.active_signed_pre_key()? {
        Some((_, _, _, created_at)) => {
            let age = crate::storage::now_secs() - created_at;
            Ok(age > i64::from(max_age_days) * 86_400)
        }
        None => Ok(true),
    }
}

/// Assemble the full bundle to publish to the directory.
pub fn local_bundle(conn: &Connection) -> Result<PublishedBundle, CryptoError> {
    let store = CryptoStore::new(conn);
    let (identity_key, _) = store
        .load_identity()?
        .ok_or(CryptoError::IdentityNotInitialized)?;
    let registration_id = identity::get_registration_id(conn)?;

    let (key_id, public_key, signature, created_at) = store
        .active_signed_pre_key()?
        .ok_or_else(|| CryptoError::StorageError("no active signed pre-key".into()))?;

    let one_time_pre_keys = store
        .list_unconsumed_pre_keys()?
        .into_iter()
        .map(|(key_id, public)| {
            Ok(OneTimePreKeyPublic {
                key_id,
                public_key: primitives::key_bytes(&public)?,
            })
        })
        .collect::<Result<Vec<_>, CryptoError>>()?;

    Ok(PublishedBundle {
        identity_key,
        registration_id,
        signed_pre_key: SignedPreKeyPublic {
            key_id,
            public_key: primitives::key_bytes(&public_key)?,
            signature,
            created_at,
        },
        one_time_pre_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{generate_identity, IdentityPublicKey};
    use crate::storage::init_test_db;

    fn setup() -> Connection {
        let conn = init_test_db();
        generate_identity(&conn).unwrap();
        conn
    }

    #[test]
    fn rotated_key_signature_verifies() {
        let conn = setup();
        let spk = rotate_signed_pre_key(&conn).unwrap();

        let (public, _) = CryptoStore::new(&conn).load_identity().unwrap().unwrap();
        let identity = IdentityPublicKey::from_bytes(&public).unwrap();
        primitives::verify_signature(&identity.signing, &spk.public_key, &spk.signature).unwrap();
    }

    #[test]
    fn rotation_retires_previous_key_but_keeps_secret() {
        let conn = setup();
        let first = rotate_signed_pre_key(&conn).unwrap();
        let second = rotate_signed_pre_key(&conn).unwrap();
        assert_ne!(first.key_id, second.key_id);

        // both secrets remain available during the grace window
        get_signed_pre_key_secret(&conn, first.key_id).unwrap();
        get_signed_pre_key_secret(&conn, second.key_id).unwrap();

        let bundle = local_bundle(&conn).unwrap();
        assert_eq!(bundle.signed_pre_key.key_id, second.key_id);
    }

    #[test]
    fn one_time_pre_key_ids_continue_across_batches() {
        let conn = setup();
        let first = generate_one_time_pre_keys(&conn, 3).unwrap();
        let second = generate_one_time_pre_keys(&conn, 2).unwrap();
        assert_eq!(
            first.iter().map(|k| k.key_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            second.iter().map(|k| k.key_id).collect::<Vec<_>>(),
            vec![4, 5]
        );
    }

    #[test]
    fn consume_is_single_use() {
        let conn = setup();
        let keys = generate_one_time_pre_keys(&conn, 1).unwrap();
        let key_id = keys[0].key_id;

        consume_one_time_pre_key(&conn, key_id).unwrap();
        assert!(matches!(
            consume_one_time_pre_key(&conn, key_id),
            Err(CryptoError::PreKeyAlreadyConsumed { .. })
        ));
    }

    #[test]
    fn consume_unknown_key_is_not_found() {
        let conn = setup();
        assert!(matches!(
            consume_one_time_pre_key(&conn, 42),
            Err(CryptoError::PreKeyNotFound { key_id: 42 })
        ));
    }

    #[test]
    fn replenishment_threshold() {
        let conn = setup();
        assert!(needs_replenishment(&conn, 5).unwrap());
        generate_one_time_pre_keys(&conn, 10).unwrap();
        assert!(!needs_replenishment(&conn, 5).unwrap());

        for key_id in 1..=6 {
            consume_one_time_pre_key(&conn, key_id).unwrap();
        }
        assert!(needs_replenishment(&conn, 5).unwrap());
    }

    #[test]
    fn missing_signed_pre_key_is_stale() {
        let conn = setup();
        assert!(is_signed_pre_key_stale(&conn, 7).unwrap());
        rotate_signed_pre_key(&conn).unwrap();
        assert!(!is_signed_pre_key_stale(&conn, 7).unwrap());
    }

    #[test]
    fn bundle_excludes_consumed_keys() {
        let conn = setup();
        rotate_signed_pre_key(&conn).unwrap();
        let keys = generate_one_time_pre_keys(&conn, 3).unwrap();
        consume_one_time_pre_key(&conn, keys[0].key_id).unwrap();

        let bundle = local_bundle(&conn).unwrap();
        assert_eq!(bundle.one_time_pre_keys.len(), 2);
        assert!(bundle
            .one_time_pre_keys
            .iter()
            .all(|k| k.key_id != keys[0].key_id));
    }
}
