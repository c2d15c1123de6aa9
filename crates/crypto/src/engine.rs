//! The session engine: the async facade the application talks to.
//!
//! Serializes concurrent operations per peer so two sends to the same
//! device cannot race session establishment, and keeps the database
//! connection behind an async mutex. Directory traffic happens outside the
//! connection lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{info, warn};

use murmur_shared::ids::UserId;

use crate::directory::{fetch_bundle_with_timeout, DirectoryService};
use crate::error::CryptoError;
use crate::fingerprint;
use crate::identity;
use crate::master_key::{self, MasterKey};
use crate::message::{self, EncryptedMessage, EnvelopeType, PeerAddress};
use crate::prekeys::{self, SignedPreKeyPublic, DEFAULT_BATCH_SIZE};
use crate::storage::{migrations, CryptoStore};

const DEFAULT_BUNDLE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local_user: UserId,
    pub device_id: u32,
    pub bundle_fetch_timeout: Duration,
    pub one_time_pre_key_batch: u32,
}

impl EngineConfig {
    pub fn new(local_user: UserId, device_id: u32) -> Self {
        Self {
            local_user,
            device_id,
            bundle_fetch_timeout: DEFAULT_BUNDLE_FETCH_TIMEOUT,
            one_time_pre_key_batch: DEFAULT_BATCH_SIZE,
        }
    }
}

/// End-to-end encryption engine for one local device.
pub struct SessionEngine<D> {
    config: EngineConfig,
    conn: Mutex<Connection>,
    directory: D,
    session_locks: DashMap<PeerAddress, Arc<Mutex<()>>>,
    master: Mutex<Option<MasterKey>>,
}

impl<D: DirectoryService> SessionEngine<D> {
    /// Wrap an opened (and, in production, SQLCipher-keyed) connection,
    /// applying any pending schema migrations.
    pub fn new(conn: Connection, directory: D, config: EngineConfig) -> Result<Self, CryptoError> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            config,
            conn: Mutex::new(conn),
            directory,
            session_locks: DashMap::new(),
            master: Mutex::new(None),
        })
    }

    pub fn local_user(&self) -> &UserId {
        &self.config.local_user
    }

    fn session_lock(&self, peer: &PeerAddress) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// First-run setup: derive the master key from the password, generate
    /// the identity and initial pre-keys, and publish the bundle.
    ///
    /// The identity row is the marker for a completed setup. If a master
    /// key exists without one, an earlier run was interrupted; the password
    /// is verified against the stored key and setup continues from there.
    pub async fn initialize(&self, password: &str) -> Result<(), CryptoError> {
        {
            let conn = self.conn.lock().await;
            if CryptoStore::new(&conn).load_identity()?.is_some() {
                return Err(CryptoError::AlreadyInitialized);
            }

            let master = match master_key::initialize_master_key(&conn, password) {
                Ok(master) => master,
                Err(CryptoError::AlreadyInitialized) => {
                    warn!("resuming interrupted setup; master key exists without an identity");
                    master_key::unlock_master_key(&conn, password)?
                }
                Err(err) => return Err(err),
            };
            identity::generate_identity(&conn)?;
            prekeys::rotate_signed_pre_key(&conn)?;
            prekeys::generate_one_time_pre_keys(&conn, self.config.one_time_pre_key_batch)?;
            *self.master.lock().await = Some(master);
        }
        self.publish_current_bundle().await?;
        info!(user = %self.config.local_user, device = self.config.device_id, "initialized crypto engine");
        Ok(())
    }

    /// Re-derive the master key from the password on login.
    pub async fn unlock(&self, password: &str) -> Result<(), CryptoError> {
        let conn = self.conn.lock().await;
        let master = master_key::unlock_master_key(&conn, password)?;
        *self.master.lock().await = Some(master);
        Ok(())
    }

    /// Restore the master key from a 24-word recovery phrase.
    pub async fn recover(&self, phrase: &str) -> Result<(), CryptoError> {
        let conn = self.conn.lock().await;
        let master = master_key::recover_master_key(&conn, phrase)?;
        *self.master.lock().await = Some(master);
        Ok(())
    }

    /// One-time export of the recovery phrase.
    pub async fn recovery_phrase(&self) -> Result<Vec<String>, CryptoError> {
        let conn = self.conn.lock().await;
        let master_guard = self.master.lock().await;
        let master = master_guard
            .as_ref()
            .ok_or(CryptoError::MasterKeyUnavailable)?;
        master_key::take_recovery_phrase(&conn, master)
    }

    /// Wipe the in-memory master key, e.g. on logout.
    pub async fn wipe_master_key(&self) {
        *self.master.lock().await = None;
    }

    /// Encrypt a message to a peer, establishing a session first if none
    /// exists. The bundle fetch happens outside the connection lock.
    pub async fn encrypt_message(
        &self,
        peer: &PeerAddress,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        let lock = self.session_lock(peer);
        let _guard = lock.lock().await;

        let established = {
            let conn = self.conn.lock().await;
            message::has_session(&conn, peer)?
        };
        if !established {
            let bundle = fetch_bundle_with_timeout(
                &self.directory,
                &peer.user_id,
                peer.device_id,
                self.config.bundle_fetch_timeout,
            )
            .await?;

            if let Some(opk) = &bundle.one_time_pre_key {
                if let Err(err) = self
                    .directory
                    .consume_one_time_pre_key(&peer.user_id, peer.device_id, opk.key_id)
                    .await
                {
                    warn!(peer = %peer, error = %err, "directory did not confirm one-time pre-key consumption");
                }
            }

            let conn = self.conn.lock().await;
            message::create_outgoing_session(&conn, peer, &bundle)?;
            info!(peer = %peer, "established outgoing session");
        }

        let conn = self.conn.lock().await;
        message::encrypt_message(&conn, peer, plaintext)
    }

    /// Decrypt an incoming envelope from a peer.
    pub async fn decrypt_message(
        &self,
        peer: &PeerAddress,
        envelope: &[u8],
        envelope_type: EnvelopeType,
    ) -> Result<Vec<u8>, CryptoError> {
        let lock = self.session_lock(peer);
        let _guard = lock.lock().await;

        let conn = self.conn.lock().await;
        message::decrypt_message(&conn, peer, envelope, envelope_type)
    }

    pub async fn has_session(&self, peer: &PeerAddress) -> Result<bool, CryptoError> {
        let conn = self.conn.lock().await;
        message::has_session(&conn, peer)
    }

    /// Delete the session so the next message starts a fresh handshake.
    pub async fn reset_session(&self, peer: &PeerAddress) -> Result<bool, CryptoError> {
        let lock = self.session_lock(peer);
        let _guard = lock.lock().await;

        let conn = self.conn.lock().await;
        message::recover_session(&conn, peer)
    }

    /// Safety number for out-of-band comparison with a peer whose identity
    /// key we have seen.
    pub async fn safety_number(&self, peer: &PeerAddress) -> Result<String, CryptoError> {
        let conn = self.conn.lock().await;
        let store = CryptoStore::new(&conn);

        let (local_key, _) = store
            .load_identity()?
            .ok_or(CryptoError::IdentityNotInitialized)?;
        let remote_key = store
            .get_remote_identity(&peer.name(), peer.device_id)?
            .ok_or_else(|| CryptoError::StorageError(format!("no recorded identity for {peer}")))?;

        fingerprint::generate_safety_number(
            &self.config.local_user.to_string(),
            &local_key,
            &peer.user_id.to_string(),
            &remote_key,
        )
    }

    pub async fn mark_peer_verified(&self, peer: &PeerAddress) -> Result<(), CryptoError> {
        let conn = self.conn.lock().await;
        fingerprint::mark_identity_verified(&conn, peer)
    }

    pub async fn is_peer_verified(&self, peer: &PeerAddress) -> Result<bool, CryptoError> {
        let conn = self.conn.lock().await;
        fingerprint::is_identity_verified(&conn, peer)
    }

    /// Rotate the signed pre-key and republish the bundle.
    pub async fn rotate_signed_pre_key(&self) -> Result<SignedPreKeyPublic, CryptoError> {
        let rotated = {
            let conn = self.conn.lock().await;
            prekeys::rotate_signed_pre_key(&conn)?
        };
        self.publish_current_bundle().await?;
        Ok(rotated)
    }

    /// Generate `count` fresh one-time pre-keys and republish the bundle.
    pub async fn replenish_one_time_pre_keys(&self, count: u32) -> Result<u32, CryptoError> {
        {
            let conn = self.conn.lock().await;
            prekeys::generate_one_time_pre_keys(&conn, count)?;
        }
        self.publish_current_bundle().await?;
        Ok(count)
    }

    pub async fn signed_pre_key_is_stale(&self, max_age_days: u32) -> Result<bool, CryptoError> {
        let conn = self.conn.lock().await;
        prekeys::is_signed_pre_key_stale(&conn, max_age_days)
    }

    pub async fn needs_pre_key_replenishment(&self, threshold: u32) -> Result<bool, CryptoError> {
        let conn = self.conn.lock().await;
        prekeys::needs_replenishment(&conn, threshold)
    }

    async fn publish_current_bundle(&self) -> Result<(), CryptoError> {
        let bundle = {
            let conn = self.conn.lock().await;
            prekeys::local_bundle(&conn)?
        };
        self.directory
            .publish_bundle(&self.config.local_user, self.config.device_id, &bundle)
            .await?;

        let uploaded: Vec<u32> = bundle.one_time_pre_keys.iter().map(|k| k.key_id).collect();
        let conn = self.conn.lock().await;
        prekeys::mark_pre_keys_uploaded(&conn, &uploaded)?;
        Ok(())
    }
}
