//! X3DH key agreement and the Double Ratchet.
//!
//! `SessionState` is the complete per-peer ratchet state. It is loaded from
//! storage, mutated in memory, and only written back after an operation
//! succeeds, so a failed decryption never advances the persisted ratchet.

use serde::{Deserialize, Serialize};
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, IdentityPublicKey, IDENTITY_KEY_LEN};
use crate::prekeys::FetchedBundle;
use crate::primitives::{self, KEY_LEN};

/// Upper bound on cached out-of-order message keys per session.
pub const MAX_SKIPPED_KEYS: usize = 200;
/// Skipped message keys older than this are pruned.
pub const SKIPPED_KEY_MAX_AGE_SECS: i64 = 7 * 86_400;

/// Per-message ratchet header, sent in the clear alongside the ciphertext
/// and authenticated as part of the AEAD associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    pub ratchet_key: [u8; KEY_LEN],
    pub counter: u32,
    pub previous_counter: u32,
}

/// Handshake parameters the initiator attaches to outgoing messages until
/// the peer's first reply confirms session establishment.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize)]
pub struct HandshakeInfo {
    pub ephemeral_key: [u8; KEY_LEN],
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
}

#[derive(Clone, Serialize, Deserialize, Zeroize)]
struct Chain {
    key: [u8; KEY_LEN],
    next_index: u32,
}

impl Chain {
    fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key, next_index: 0 }
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize)]
struct SkippedKey {
    ratchet_key: [u8; KEY_LEN],
    index: u32,
    message_key: [u8; KEY_LEN],
    cached_at: i64,
}

/// Full Double Ratchet state for one peer session.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionState {
    root_key: [u8; KEY_LEN],
    send_chain: Option<Chain>,
    recv_chain: Option<Chain>,
    our_ratchet_secret: [u8; KEY_LEN],
    our_ratchet_public: [u8; KEY_LEN],
    their_ratchet_public: Option<[u8; KEY_LEN]>,
    previous_send_count: u32,
    is_initiator: bool,
    local_identity_public: Vec<u8>,
    peer_identity_public: Vec<u8>,
    associated_data: Vec<u8>,
    origin_ephemeral: [u8; KEY_LEN],
    pending_handshake: Option<HandshakeInfo>,
    skipped: Vec<SkippedKey>,
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl SessionState {
    /// Initiator side of X3DH: establish a session from a fetched bundle.
    ///
    /// Verifies the signed pre-key signature before any DH computation and
    /// falls back to three DH legs when the bundle carries no one-time
    /// pre-key.
    pub fn initiate(
        local: &IdentityKeyPair,
        bundle: &FetchedBundle,
    ) -> Result<Self, CryptoError> {
        let peer_identity = IdentityPublicKey::from_bytes(&bundle.identity_key)?;
        primitives::verify_signature(
            &peer_identity.signing,
            &bundle.signed_pre_key.public_key,
            &bundle.signed_pre_key.signature,
        )?;

        let spk_public = PublicKey::from(bundle.signed_pre_key.public_key);
        let (ephemeral_secret, ephemeral_public) = primitives::generate_dh_keypair();

        let mut dh_outputs = vec![
            primitives::dh(local.dh_secret(), &spk_public),
            primitives::dh(&ephemeral_secret, &peer_identity.dh),
            primitives::dh(&ephemeral_secret, &spk_public),
        ];
        let one_time_pre_key_id = match &bundle.one_time_pre_key {
            Some(opk) => {
                dh_outputs.push(primitives::dh(
                    &ephemeral_secret,
                    &PublicKey::from(opk.public_key),
                ));
                Some(opk.key_id)
            }
            None => {
                warn!("bundle has no one-time pre-key; establishing session with reduced forward secrecy");
                None
            }
        };
        let shared_secret = primitives::kdf_initial_secret(&dh_outputs);

        let local_public = local.public().to_bytes();
        let mut associated_data = Vec::with_capacity(IDENTITY_KEY_LEN * 2);
        associated_data.extend_from_slice(&local_public);
        associated_data.extend_from_slice(&bundle.identity_key);

        // The peer's signed pre-key doubles as its initial ratchet key, so
        // the initiator can ratchet forward and send immediately.
        let (our_secret, our_public) = primitives::generate_dh_keypair();
        let dh_out = primitives::dh(&our_secret, &spk_public);
        let (root_key, send_chain_key) = primitives::kdf_root(&shared_secret, &dh_out);

        Ok(Self {
            root_key,
            send_chain: Some(Chain::new(send_chain_key)),
            recv_chain: None,
            our_ratchet_secret: our_secret.to_bytes(),
            our_ratchet_public: *our_public.as_bytes(),
            their_ratchet_public: Some(bundle.signed_pre_key.public_key),
            previous_send_count: 0,
            is_initiator: true,
            local_identity_public: local_public.to_vec(),
            peer_identity_public: bundle.identity_key.clone(),
            associated_data,
            origin_ephemeral: *ephemeral_public.as_bytes(),
            pending_handshake: Some(HandshakeInfo {
                ephemeral_key: *ephemeral_public.as_bytes(),
                signed_pre_key_id: bundle.signed_pre_key.key_id,
                one_time_pre_key_id,
            }),
            skipped: Vec::new(),
        })
    }

    /// Responder side of X3DH: establish a session from an incoming
    /// handshake, using the private halves of the referenced pre-keys.
    pub fn respond(
        local: &IdentityKeyPair,
        signed_pre_key_secret: &StaticSecret,
        one_time_pre_key_secret: Option<&StaticSecret>,
        peer_identity_key: &[u8],
        peer_ephemeral: &[u8; KEY_LEN],
    ) -> Result<Self, CryptoError> {
        let peer_identity = IdentityPublicKey::from_bytes(peer_identity_key)?;
        let ephemeral = PublicKey::from(*peer_ephemeral);

        let mut dh_outputs = vec![
            primitives::dh(signed_pre_key_secret, &peer_identity.dh),
            primitives::dh(local.dh_secret(), &ephemeral),
            primitives::dh(signed_pre_key_secret, &ephemeral),
        ];
        if let Some(opk_secret) = one_time_pre_key_secret {
            dh_outputs.push(primitives::dh(opk_secret, &ephemeral));
        }
        let shared_secret = primitives::kdf_initial_secret(&dh_outputs);

        let local_public = local.public().to_bytes();
        let mut associated_data = Vec::with_capacity(IDENTITY_KEY_LEN * 2);
        associated_data.extend_from_slice(peer_identity_key);
        associated_data.extend_from_slice(&local_public);

        // Our signed pre-key is our initial ratchet key. Chains come up on
        // the first DH ratchet step when the initiator's message arrives.
        let our_ratchet_public = PublicKey::from(signed_pre_key_secret);

        Ok(Self {
            root_key: shared_secret,
            send_chain: None,
            recv_chain: None,
            our_ratchet_secret: signed_pre_key_secret.to_bytes(),
            our_ratchet_public: *our_ratchet_public.as_bytes(),
            their_ratchet_public: None,
            previous_send_count: 0,
            is_initiator: false,
            local_identity_public: local_public.to_vec(),
            peer_identity_public: peer_identity_key.to_vec(),
            associated_data,
            origin_ephemeral: *peer_ephemeral,
            pending_handshake: None,
            skipped: Vec::new(),
        })
    }

    /// Encrypt a message, advancing the sending chain by one step.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
    ) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
        let (counter, chain_key) = match &self.send_chain {
            Some(chain) => (chain.next_index, chain.key),
            None => {
                return Err(CryptoError::InvalidKey(
                    "sending chain not established".into(),
                ))
            }
        };

        let (next_chain_key, message_key) = primitives::kdf_chain(&chain_key);
        let header = RatchetHeader {
            ratchet_key: self.our_ratchet_public,
            counter,
            previous_counter: self.previous_send_count,
        };
        let aad = self.header_aad(&header);
        let ciphertext = primitives::seal(&message_key, &aad, plaintext)?;

        if let Some(chain) = self.send_chain.as_mut() {
            chain.key = next_chain_key;
            chain.next_index = counter + 1;
        }
        Ok((header, ciphertext))
    }

    /// Decrypt a message, performing DH ratchet steps and skipped-key
    /// caching as needed. On any error the state may be partially advanced;
    /// callers must discard it instead of persisting.
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if let Some(plaintext) = self.try_skipped(header, ciphertext)? {
            self.pending_handshake = None;
            return Ok(plaintext);
        }

        if self.their_ratchet_public != Some(header.ratchet_key) {
            if self.their_ratchet_public.is_some() {
                // close out the previous receiving chain before stepping
                self.cache_skipped(header.previous_counter)?;
            }
            self.dh_ratchet_step(&header.ratchet_key);
        }

        {
            let chain = self.recv_chain.as_ref().ok_or_else(|| {
                CryptoError::DecryptionFailed("receiving chain not established".into())
            })?;
            if header.counter < chain.next_index {
                return Err(CryptoError::DecryptionFailed(
                    "message key already consumed".into(),
                ));
            }
        }
        self.cache_skipped(header.counter)?;

        let chain_key = self
            .recv_chain
            .as_ref()
            .map(|chain| chain.key)
            .ok_or_else(|| {
                CryptoError::DecryptionFailed("receiving chain not established".into())
            })?;
        let (next_chain_key, message_key) = primitives::kdf_chain(&chain_key);
        let aad = self.header_aad(header);
        let plaintext = primitives::open(&message_key, &aad, ciphertext)?;

        if let Some(chain) = self.recv_chain.as_mut() {
            chain.key = next_chain_key;
            chain.next_index = header.counter + 1;
        }
        self.pending_handshake = None;
        Ok(plaintext)
    }

    fn try_skipped(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        let position = self.skipped.iter().position(|entry| {
            entry.ratchet_key == header.ratchet_key && entry.index == header.counter
        });
        let Some(position) = position else {
            return Ok(None);
        };

        let entry = self.skipped.remove(position);
        let aad = self.header_aad(header);
        let plaintext = primitives::open(&entry.message_key, &aad, ciphertext)?;
        Ok(Some(plaintext))
    }

    /// Advance the receiving chain up to (but not including) `until`,
    /// caching each intermediate message key. Oldest cached keys are
    /// evicted once the cache exceeds its bound.
    fn cache_skipped(&mut self, until: u32) -> Result<(), CryptoError> {
        let Some(ratchet_key) = self.their_ratchet_public else {
            return Ok(());
        };
        let Some(chain) = self.recv_chain.as_mut() else {
            return Ok(());
        };

        if until > chain.next_index
            && (until - chain.next_index) as usize > MAX_SKIPPED_KEYS
        {
            return Err(CryptoError::DecryptionFailed(
                "message skips too far ahead".into(),
            ));
        }

        let cached_at = now_secs();
        while chain.next_index < until {
            let (next_chain_key, message_key) = primitives::kdf_chain(&chain.key);
            self.skipped.push(SkippedKey {
                ratchet_key,
                index: chain.next_index,
                message_key,
                cached_at,
            });
            chain.key = next_chain_key;
            chain.next_index += 1;
        }

        while self.skipped.len() > MAX_SKIPPED_KEYS {
            self.skipped.remove(0);
        }
        Ok(())
    }

    fn dh_ratchet_step(&mut self, their_new_key: &[u8; KEY_LEN]) {
        let their_public = PublicKey::from(*their_new_key);
        let our_secret = StaticSecret::from(self.our_ratchet_secret);

        let recv_dh = primitives::dh(&our_secret, &their_public);
        let (root_key, recv_chain_key) = primitives::kdf_root(&self.root_key, &recv_dh);

        let (new_secret, new_public) = primitives::generate_dh_keypair();
        let send_dh = primitives::dh(&new_secret, &their_public);
        let (root_key, send_chain_key) = primitives::kdf_root(&root_key, &send_dh);

        self.previous_send_count = self
            .send_chain
            .as_ref()
            .map(|chain| chain.next_index)
            .unwrap_or(0);
        self.root_key = root_key;
        self.recv_chain = Some(Chain::new(recv_chain_key));
        self.send_chain = Some(Chain::new(send_chain_key));
        self.our_ratchet_secret = new_secret.to_bytes();
        self.our_ratchet_public = *new_public.as_bytes();
        self.their_ratchet_public = Some(*their_new_key);
    }

    fn header_aad(&self, header: &RatchetHeader) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.associated_data.len() + KEY_LEN + 8);
        aad.extend_from_slice(&self.associated_data);
        aad.extend_from_slice(&header.ratchet_key);
        aad.extend_from_slice(&header.counter.to_be_bytes());
        aad.extend_from_slice(&header.previous_counter.to_be_bytes());
        aad
    }

    /// Drop cached skipped keys older than `max_age_secs`. Returns how many
    /// were removed.
    pub fn prune_skipped(&mut self, max_age_secs: i64) -> usize {
        let cutoff = now_secs() - max_age_secs;
        let before = self.skipped.len();
        self.skipped.retain(|entry| entry.cached_at >= cutoff);
        before - self.skipped.len()
    }

    /// Structural sanity check. Returns a description of the first problem
    /// found, if any.
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.local_identity_public.len() != IDENTITY_KEY_LEN {
            return Err("local identity key has wrong length".into());
        }
        if self.peer_identity_public.len() != IDENTITY_KEY_LEN {
            return Err("peer identity key has wrong length".into());
        }
        if self.associated_data.len() != IDENTITY_KEY_LEN * 2 {
            return Err("associated data has wrong length".into());
        }
        if self.is_initiator && self.send_chain.is_none() {
            return Err("initiator session is missing its sending chain".into());
        }
        if self.recv_chain.is_some() && self.their_ratchet_public.is_none() {
            return Err("receiving chain exists without a peer ratchet key".into());
        }
        if self.skipped.len() > MAX_SKIPPED_KEYS {
            return Err("skipped-key cache exceeds its bound".into());
        }
        Ok(())
    }

    /// Handshake parameters to attach to outgoing messages, present until
    /// the peer's first message confirms the session.
    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        self.pending_handshake.as_ref()
    }

    /// The ephemeral key that bootstrapped this session. Used to tell a
    /// retransmitted handshake apart from a brand-new one.
    pub fn origin_ephemeral(&self) -> &[u8; KEY_LEN] {
        &self.origin_ephemeral
    }

    pub fn peer_identity_public(&self) -> &[u8] {
        &self.peer_identity_public
    }

    pub fn local_identity_public(&self) -> &[u8] {
        &self.local_identity_public
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
