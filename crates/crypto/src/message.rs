//! Message envelopes and the encrypt/decrypt entry points.
//!
//! Session state is loaded, advanced in memory, and written back inside a
//! transaction only when the operation succeeds. A failed decryption rolls
//! everything back, including any one-time pre-key consumption.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use murmur_shared::constants::MAX_MESSAGE_SIZE_BYTES;
use murmur_shared::ids::UserId;

use crate::error::CryptoError;
use crate::identity;
use crate::prekeys::{self, FetchedBundle};
use crate::session::{RatchetHeader, SessionState, SKIPPED_KEY_MAX_AGE_SECS};
use crate::storage::{with_transaction, CryptoStore, IdentityChange};

/// A peer device: user plus device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub user_id: UserId,
    pub device_id: u32,
}

impl PeerAddress {
    pub fn new(user_id: UserId, device_id: u32) -> Self {
        Self { user_id, device_id }
    }

    /// Storage key for this peer's user.
    pub fn name(&self) -> String {
        self.user_id.to_string()
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

/// Wire-level envelope kind, carried out of band next to the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    /// Carries X3DH handshake material alongside the first ciphertexts.
    Initial,
    /// Regular ratchet message on an established session.
    Normal,
}

impl EnvelopeType {
    pub fn as_tag(&self) -> u8 {
        match self {
            EnvelopeType::Initial => 1,
            EnvelopeType::Normal => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CryptoError> {
        match tag {
            1 => Ok(EnvelopeType::Initial),
            2 => Ok(EnvelopeType::Normal),
            other => Err(CryptoError::SerializationError(format!(
                "unknown envelope tag {other}"
            ))),
        }
    }
}

/// Ratchet message: header in the clear, AEAD ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalMessage {
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
}

/// Handshake envelope. Sent by the initiator until the peer's first reply;
/// carries everything the responder needs to derive the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialMessage {
    pub identity_key: Vec<u8>,
    pub ephemeral_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
    pub message: NormalMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Initial(InitialMessage),
    Normal(NormalMessage),
}

/// Serialized envelope ready for transport.
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    pub envelope: Vec<u8>,
    pub envelope_type: EnvelopeType,
}

/// Establish an outgoing session from a fetched pre-key bundle.
pub fn create_outgoing_session(
    conn: &Connection,
    peer: &PeerAddress,
    bundle: &FetchedBundle,
) -> Result<(), CryptoError> {
    let local = identity::get_identity(conn)?;
    let state = SessionState::initiate(&local, bundle)?;

    with_transaction(conn, |store| {
        let change =
            store.save_remote_identity(&peer.name(), peer.device_id, &bundle.identity_key)?;
        if change == IdentityChange::ReplacedExisting {
            warn!(peer = %peer, "peer identity key changed on new outgoing session");
        }
        store.store_session(&peer.name(), peer.device_id, &state.to_bytes()?)?;
        Ok(())
    })
}

pub fn has_session(conn: &Connection, peer: &PeerAddress) -> Result<bool, CryptoError> {
    CryptoStore::new(conn).has_session(&peer.name(), peer.device_id)
}

/// Tear down a session so the next exchange starts a fresh handshake.
pub fn recover_session(conn: &Connection, peer: &PeerAddress) -> Result<bool, CryptoError> {
    let deleted = CryptoStore::new(conn).delete_session(&peer.name(), peer.device_id)?;
    if deleted {
        warn!(peer = %peer, "deleted session for recovery");
    }
    Ok(deleted)
}

/// Load and validate the stored session, deleting it if it is unreadable.
fn load_valid_session(
    conn: &Connection,
    peer: &PeerAddress,
) -> Result<SessionState, CryptoError> {
    let store = CryptoStore::new(conn);
    let blob = store
        .load_session(&peer.name(), peer.device_id)?
        .ok_or_else(|| CryptoError::SessionNotFound {
            address: peer.to_string(),
        })?;

    let state = match SessionState::from_bytes(&blob) {
        Ok(state) => state,
        Err(_) => {
            store.delete_session(&peer.name(), peer.device_id)?;
            warn!(peer = %peer, "deleted unparseable session state");
            return Err(CryptoError::SessionCorrupted {
                address: peer.to_string(),
                detail: "stored session state failed to parse".into(),
            });
        }
    };
    if let Err(detail) = state.check_consistency() {
        store.delete_session(&peer.name(), peer.device_id)?;
        warn!(peer = %peer, detail, "deleted inconsistent session state");
        return Err(CryptoError::SessionCorrupted {
            address: peer.to_string(),
            detail,
        });
    }
    Ok(state)
}

/// Encrypt a message to a peer with an established session.
///
/// Emits an `Initial` envelope while the handshake is unconfirmed and a
/// `Normal` envelope afterwards.
pub fn encrypt_message(
    conn: &Connection,
    peer: &PeerAddress,
    plaintext: &[u8],
) -> Result<EncryptedMessage, CryptoError> {
    if plaintext.len() > MAX_MESSAGE_SIZE_BYTES {
        return Err(CryptoError::MessageTooLarge {
            size: plaintext.len(),
            max: MAX_MESSAGE_SIZE_BYTES,
        });
    }

    let mut state = load_valid_session(conn, peer)?;

    with_transaction(conn, |store| {
        let (header, ciphertext) = state.encrypt(plaintext)?;
        let message = NormalMessage { header, ciphertext };

        let envelope = match state.handshake() {
            Some(handshake) => Envelope::Initial(InitialMessage {
                identity_key: state.local_identity_public().to_vec(),
                ephemeral_key: handshake.ephemeral_key,
                signed_pre_key_id: handshake.signed_pre_key_id,
                one_time_pre_key_id: handshake.one_time_pre_key_id,
                message,
            }),
            None => Envelope::Normal(message),
        };
        let envelope_type = match &envelope {
            Envelope::Initial(_) => EnvelopeType::Initial,
            Envelope::Normal(_) => EnvelopeType::Normal,
        };

        store.store_session(&peer.name(), peer.device_id, &state.to_bytes()?)?;
        Ok(EncryptedMessage {
            envelope: serde_json::to_vec(&envelope)?,
            envelope_type,
        })
    })
}

/// Decrypt an incoming envelope from a peer.
pub fn decrypt_message(
    conn: &Connection,
    peer: &PeerAddress,
    envelope: &[u8],
    envelope_type: EnvelopeType,
) -> Result<Vec<u8>, CryptoError> {
    let envelope: Envelope = serde_json::from_slice(envelope)
        .map_err(|_| CryptoError::DecryptionFailed("malformed envelope".into()))?;

    let tag_matches = matches!(
        (&envelope, envelope_type),
        (Envelope::Initial(_), EnvelopeType::Initial)
            | (Envelope::Normal(_), EnvelopeType::Normal)
    );
    if !tag_matches {
        return Err(CryptoError::DecryptionFailed(
            "envelope type does not match payload".into(),
        ));
    }

    match envelope {
        Envelope::Normal(message) => decrypt_normal(conn, peer, &message),
        Envelope::Initial(initial) => decrypt_initial(conn, peer, &initial),
    }
}

fn decrypt_normal(
    conn: &Connection,
    peer: &PeerAddress,
    message: &NormalMessage,
) -> Result<Vec<u8>, CryptoError> {
    let mut state = load_valid_session(conn, peer)?;

    with_transaction(conn, |store| {
        let plaintext = state.decrypt(&message.header, &message.ciphertext)?;
        state.prune_skipped(SKIPPED_KEY_MAX_AGE_SECS);
        store.store_session(&peer.name(), peer.device_id, &state.to_bytes()?)?;
        Ok(plaintext)
    })
}

fn decrypt_initial(
    conn: &Connection,
    peer: &PeerAddress,
    initial: &InitialMessage,
) -> Result<Vec<u8>, CryptoError> {
    let store = CryptoStore::new(conn);
    if let Some(blob) = store.load_session(&peer.name(), peer.device_id)? {
        if let Ok(existing) = SessionState::from_bytes(&blob) {
            if existing.origin_ephemeral() == &initial.ephemeral_key {
                // same handshake, retransmitted; the session already exists
                return decrypt_normal(conn, peer, &initial.message);
            }
        }
        warn!(peer = %peer, "incoming handshake supersedes existing session");
    }

    let local = identity::get_identity(conn)?;

    with_transaction(conn, |store| {
        store.delete_session(&peer.name(), peer.device_id)?;

        let spk_secret = prekeys::get_signed_pre_key_secret(conn, initial.signed_pre_key_id)?;
        let opk_secret = initial
            .one_time_pre_key_id
            .map(|key_id| prekeys::consume_one_time_pre_key(conn, key_id))
            .transpose()?;

        let mut state = SessionState::respond(
            &local,
            &spk_secret,
            opk_secret.as_ref(),
            &initial.identity_key,
            &initial.ephemeral_key,
        )?;
        let plaintext = state.decrypt(&initial.message.header, &initial.message.ciphertext)?;

        let change =
            store.save_remote_identity(&peer.name(), peer.device_id, &initial.identity_key)?;
        if change == IdentityChange::ReplacedExisting {
            warn!(peer = %peer, "peer identity key changed on incoming handshake");
        }
        store.store_session(&peer.name(), peer.device_id, &state.to_bytes()?)?;
        Ok(plaintext)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_identity;
    use crate::prekeys::{generate_one_time_pre_keys, local_bundle, rotate_signed_pre_key};
    use crate::storage::init_test_db;

    fn new_device() -> Connection {
        let conn = init_test_db();
        generate_identity(&conn).unwrap();
        rotate_signed_pre_key(&conn).unwrap();
        generate_one_time_pre_keys(&conn, 5).unwrap();
        conn
    }

    /// What the directory would hand a sender: the bundle with one
    /// one-time pre-key picked off the top.
    fn fetch_from(conn: &Connection) -> FetchedBundle {
        let published = local_bundle(conn).unwrap();
        FetchedBundle {
            identity_key: published.identity_key,
            registration_id: published.registration_id,
            signed_pre_key: published.signed_pre_key,
            one_time_pre_key: published.one_time_pre_keys.into_iter().next(),
        }
    }

    fn addr() -> PeerAddress {
        PeerAddress::new(UserId::new(), 1)
    }

    #[test]
    fn initial_message_roundtrips() {
        let alice = new_device();
        let bob = new_device();
        let alice_addr = addr();
        let bob_addr = addr();

        create_outgoing_session(&alice, &bob_addr, &fetch_from(&bob)).unwrap();
        assert!(has_session(&alice, &bob_addr).unwrap());

        let message = encrypt_message(&alice, &bob_addr, b"hello").unwrap();
        assert_eq!(message.envelope_type, EnvelopeType::Initial);

        let plaintext =
            decrypt_message(&bob, &alice_addr, &message.envelope, message.envelope_type).unwrap();
        assert_eq!(plaintext, b"hello");
        assert!(has_session(&bob, &alice_addr).unwrap());
    }

    #[test]
    fn envelopes_stay_initial_until_first_reply() {
        let alice = new_device();
        let bob = new_device();
        let alice_addr = addr();
        let bob_addr = addr();

        create_outgoing_session(&alice, &bob_addr, &fetch_from(&bob)).unwrap();

        let m1 = encrypt_message(&alice, &bob_addr, b"one").unwrap();
        let m2 = encrypt_message(&alice, &bob_addr, b"two").unwrap();
        assert_eq!(m1.envelope_type, EnvelopeType::Initial);
        assert_eq!(m2.envelope_type, EnvelopeType::Initial);

        decrypt_message(&bob, &alice_addr, &m1.envelope, m1.envelope_type).unwrap();
        decrypt_message(&bob, &alice_addr, &m2.envelope, m2.envelope_type).unwrap();

        let reply = encrypt_message(&bob, &alice_addr, b"ack").unwrap();
        assert_eq!(reply.envelope_type, EnvelopeType::Normal);
        decrypt_message(&alice, &bob_addr, &reply.envelope, reply.envelope_type).unwrap();

        let m3 = encrypt_message(&alice, &bob_addr, b"three").unwrap();
        assert_eq!(m3.envelope_type, EnvelopeType::Normal);
        let plaintext =
            decrypt_message(&bob, &alice_addr, &m3.envelope, m3.envelope_type).unwrap();
        assert_eq!(plaintext, b"three");
    }

    #[test]
    fn oversized_message_is_rejected() {
        let alice = new_device();
        let bob = new_device();
        let bob_addr = addr();

        create_outgoing_session(&alice, &bob_addr, &fetch_from(&bob)).unwrap();
        let big = vec![0u8; MAX_MESSAGE_SIZE_BYTES + 1];
        assert!(matches!(
            encrypt_message(&alice, &bob_addr, &big),
            Err(CryptoError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn encrypt_without_session_is_not_found() {
        let alice = new_device();
        assert!(matches!(
            encrypt_message(&alice, &addr(), b"hi"),
            Err(CryptoError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn mismatched_envelope_type_is_rejected() {
        let alice = new_device();
        let bob = new_device();
        let alice_addr = addr();
        let bob_addr = addr();

        create_outgoing_session(&alice, &bob_addr, &fetch_from(&bob)).unwrap();
        let message = encrypt_message(&alice, &bob_addr, b"hello").unwrap();

        assert!(matches!(
            decrypt_message(&bob, &alice_addr, &message.envelope, EnvelopeType::Normal),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn failed_decrypt_does_not_advance_state() {
        let alice = new_device();
        let bob = new_device();
        let alice_addr = addr();
        let bob_addr = addr();

        create_outgoing_session(&alice, &bob_addr, &fetch_from(&bob)).unwrap();
        let good = encrypt_message(&alice, &bob_addr, b"good").unwrap();

        let mut tampered = good.envelope.clone();
        // flip a byte inside the base64-ish json payload body
        if let Some(byte) = tampered.iter_mut().rev().nth(4) {
            *byte = byte.wrapping_add(1);
        }
        let _ = decrypt_message(&bob, &alice_addr, &tampered, good.envelope_type);

        // the untampered original still decrypts, so no state was burned
        let plaintext =
            decrypt_message(&bob, &alice_addr, &good.envelope, good.envelope_type).unwrap();
        assert_eq!(plaintext, b"good");
    }

    #[test]
    fn replayed_envelope_is_rejected_after_success() {
        let alice = new_device();
        let bob = new_device();
        let alice_addr = addr();
        let bob_addr = addr();

        create_outgoing_session(&alice, &bob_addr, &fetch_from(&bob)).unwrap();
        let message = encrypt_message(&alice, &bob_addr, b"once").unwrap();

        decrypt_message(&bob, &alice_addr, &message.envelope, message.envelope_type).unwrap();
        assert!(decrypt_message(&bob, &alice_addr, &message.envelope, message.envelope_type)
            .is_err());
    }

    #[test]
    fn new_handshake_supersedes_existing_session() {
        let alice = new_device();
        let bob = new_device();
        let alice_addr = addr();
        let bob_addr = addr();

        create_outgoing_session(&alice, &bob_addr, &fetch_from(&bob)).unwrap();
        let first = encrypt_message(&alice, &bob_addr, b"first").unwrap();
        decrypt_message(&bob, &alice_addr, &first.envelope, first.envelope_type).unwrap();

        // alice loses her state and starts over
        recover_session(&alice, &bob_addr).unwrap();
        create_outgoing_session(&alice, &bob_addr, &fetch_from(&bob)).unwrap();
        let second = encrypt_message(&alice, &bob_addr, b"fresh start").unwrap();
        assert_eq!(second.envelope_type, EnvelopeType::Initial);

        let plaintext =
            decrypt_message(&bob, &alice_addr, &second.envelope, second.envelope_type).unwrap();
        assert_eq!(plaintext, b"fresh start");

        // the superseded session is gone; the new one carries the traffic
        let reply = encrypt_message(&bob, &alice_addr, b"ok").unwrap();
        let plaintext =
            decrypt_message(&alice, &bob_addr, &reply.envelope, reply.envelope_type).unwrap();
        assert_eq!(plaintext, b"ok");
    }

    #[test]
    fn corrupt_stored_session_is_deleted_and_reported() {
        let alice = new_device();
        let bob = new_device();
        let bob_addr = addr();

        create_outgoing_session(&alice, &bob_addr, &fetch_from(&bob)).unwrap();
        CryptoStore::new(&alice)
            .store_session(&bob_addr.name(), bob_addr.device_id, b"garbage")
            .unwrap();

        assert!(matches!(
            encrypt_message(&alice, &bob_addr, b"hi"),
            Err(CryptoError::SessionCorrupted { .. })
        ));
        assert!(!has_session(&alice, &bob_addr).unwrap());
    }

    #[test]
    fn envelope_tag_roundtrip() {
        for kind in [EnvelopeType::Initial, EnvelopeType::Normal] {
            assert_eq!(EnvelopeType::from_tag(kind.as_tag()).unwrap(), kind);
        }
        assert!(EnvelopeType::from_tag(9).is_err());
    }
}
