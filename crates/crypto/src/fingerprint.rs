//! Safety numbers.
//!
//! A safety number is a 60-digit string both parties can display and
//! compare out of band. Each half commits to one party's user id and
//! identity key through iterated SHA-512; halves are ordered by user id so
//! both sides render the identical string.

use rusqlite::Connection;
use sha2::{Digest, Sha512};

use crate::error::CryptoError;
use crate::identity::IDENTITY_KEY_LEN;
use crate::message::PeerAddress;
use crate::storage::CryptoStore;

const FINGERPRINT_VERSION: u16 = 1;
const FINGERPRINT_ITERATIONS: u32 = 5200;
const GROUPS_PER_PARTY: usize = 6;
const DIGITS_PER_GROUP: usize = 5;

/// Six groups of five decimal digits committing to one identity.
fn digit_groups(user_id: &str, identity_key: &[u8]) -> Vec<String> {
    let mut digest = Sha512::new()
        .chain_update(FINGERPRINT_VERSION.to_be_bytes())
        .chain_update(identity_key)
        .chain_update(user_id.as_bytes())
        .finalize();
    for _ in 1..FINGERPRINT_ITERATIONS {
        digest = Sha512::new()
            .chain_update(digest)
            .chain_update(identity_key)
            .finalize();
    }

    digest
        .chunks(DIGITS_PER_GROUP)
        .take(GROUPS_PER_PARTY)
        .map(|chunk| {
            let mut value: u64 = 0;
            for byte in chunk {
                value = (value << 8) | u64::from(*byte);
            }
            format!("{:05}", value % 100_000)
        })
        .collect()
}

/// Compute the safety number for a conversation.
///
/// Symmetric: both parties get the same string regardless of who is local
/// and who is remote.
pub fn generate_safety_number(
    local_user_id: &str,
    local_identity_key: &[u8],
    remote_user_id: &str,
    remote_identity_key: &[u8],
) -> Result<String, CryptoError> {
    for (name, key) in [
        ("local", local_identity_key),
        ("remote", remote_identity_key),
    ] {
        if key.len() != IDENTITY_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "{name} identity key must be {IDENTITY_KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
    }

    let local = digit_groups(local_user_id, local_identity_key);
    let remote = digit_groups(remote_user_id, remote_identity_key);

    let (mut first, second) = if local_user_id.as_bytes() <= remote_user_id.as_bytes() {
        (local, remote)
    } else {
        (remote, local)
    };
    first.extend(second);
    Ok(first.join(" "))
}

/// Record that the user compared safety numbers with this peer.
pub fn mark_identity_verified(conn: &Connection, peer: &PeerAddress) -> Result<(), CryptoError> {
    CryptoStore::new(conn).mark_identity_verified(&peer.name(), peer.device_id)
}

/// Whether this peer's current identity key has been verified. Resets
/// automatically when the peer's key changes.
pub fn is_identity_verified(conn: &Connection, peer: &PeerAddress) -> Result<bool, CryptoError> {
    CryptoStore::new(conn).is_identity_verified(&peer.name(), peer.device_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyPair;
    use crate::storage::init_test_db;
    use murmur_shared::ids::UserId;

    fn keys() -> (Vec<u8>, Vec<u8>) {
        (
            IdentityKeyPair::generate().public().to_bytes().to_vec(),
            IdentityKeyPair::generate().public().to_bytes().to_vec(),
        )
    }

    #[test]
    fn safety_number_is_symmetric() {
        let (alice_key, bob_key) = keys();
        let from_alice =
            generate_safety_number("alice", &alice_key, "bob", &bob_key).unwrap();
        let from_bob = generate_safety_number("bob", &bob_key, "alice", &alice_key).unwrap();
        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn safety_number_has_twelve_groups_of_five() {
        let (alice_key, bob_key) = keys();
        let number = generate_safety_number("alice", &alice_key, "bob", &bob_key).unwrap();

        let groups: Vec<&str> = number.split(' ').collect();
        assert_eq!(groups.len(), 12);
        for group in groups {
            assert_eq!(group.len(), 5);
            assert!(group.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn safety_number_is_deterministic() {
        let (alice_key, bob_key) = keys();
        let a = generate_safety_number("alice", &alice_key, "bob", &bob_key).unwrap();
        let b = generate_safety_number("alice", &alice_key, "bob", &bob_key).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_keys_give_different_numbers() {
        let (alice_key, bob_key) = keys();
        let (other_key, _) = keys();
        let a = generate_safety_number("alice", &alice_key, "bob", &bob_key).unwrap();
        let b = generate_safety_number("alice", &alice_key, "bob", &other_key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let (alice_key, _) = keys();
        assert!(matches!(
            generate_safety_number("alice", &alice_key, "bob", &[0u8; 32]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn verification_flow_roundtrips() {
        let conn = init_test_db();
        let peer = PeerAddress::new(UserId::new(), 1);
        let (key, _) = keys();

        CryptoStore::new(&conn)
            .save_remote_identity(&peer.name(), peer.device_id, &key)
            .unwrap();

        assert!(!is_identity_verified(&conn, &peer).unwrap());
        mark_identity_verified(&conn, &peer).unwrap();
        assert!(is_identity_verified(&conn, &peer).unwrap());
    }

    #[test]
    fn verifying_unknown_peer_fails() {
        let conn = init_test_db();
        let peer = PeerAddress::new(UserId::new(), 1);
        assert!(mark_identity_verified(&conn, &peer).is_err());
    }
}
