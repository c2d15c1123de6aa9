//! Persistence layer for crypto state.
//!
//! All key material and session state lives in the SQLCipher-encrypted
//! database. `CryptoStore` wraps a borrowed connection with typed accessors;
//! multi-statement operations go through [`with_transaction`] so partial
//! writes roll back together.

pub mod migrations;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CryptoError;

/// Result of recording a remote identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityChange {
    /// First sighting, or the key matches what we already have.
    NewOrUnchanged,
    /// The peer's identity key changed. Verification status was reset.
    ReplacedExisting,
}

/// Typed accessor over the crypto tables.
pub struct CryptoStore<'a> {
    pub(crate) conn: &'a Connection,
}

/// Current wall-clock time as unix seconds.
pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl<'a> CryptoStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // --- identity ---

    pub fn save_identity(&self, public_key: &[u8], private_key: &[u8]) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_identity_keys (id, public_key, private_key, created_at)
             VALUES (1, ?1, ?2, ?3)",
            params![public_key, private_key, now_secs()],
        )?;
        Ok(())
    }

    pub fn load_identity(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, CryptoError> {
        let row = self
            .conn
            .query_row(
                "SELECT public_key, private_key FROM crypto_identity_keys WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_identity(&self) -> Result<(), CryptoError> {
        self.conn
            .execute("DELETE FROM crypto_identity_keys WHERE id = 1", [])?;
        Ok(())
    }

    // --- remote identities (trust on first use) ---

    /// Record the identity key observed for a peer. A changed key resets
    /// any prior verification.
    pub fn save_remote_identity(
        &self,
        address: &str,
        device_id: u32,
        identity_key: &[u8],
    ) -> Result<IdentityChange, CryptoError> {
        let existing: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT identity_key FROM crypto_trusted_identities
                 WHERE address = ?1 AND device_id = ?2",
                params![address, device_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(known) if known == identity_key => Ok(IdentityChange::NewOrUnchanged),
            Some(_) => {
                self.conn.execute(
                    "UPDATE crypto_trusted_identities
                     SET identity_key = ?3, verified_at = NULL
                     WHERE address = ?1 AND device_id = ?2",
                    params![address, device_id, identity_key],
                )?;
                Ok(IdentityChange::ReplacedExisting)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO crypto_trusted_identities
                     (address, device_id, identity_key, first_seen_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![address, device_id, identity_key, now_secs()],
                )?;
                Ok(IdentityChange::NewOrUnchanged)
            }
        }
    }

    pub fn get_remote_identity(
        &self,
        address: &str,
        device_id: u32,
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        let row = self
            .conn
            .query_row(
                "SELECT identity_key FROM crypto_trusted_identities
                 WHERE address = ?1 AND device_id = ?2",
                params![address, device_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn mark_identity_verified(&self, address: &str, device_id: u32) -> Result<(), CryptoError> {
        let updated = self.conn.execute(
            "UPDATE crypto_trusted_identities SET verified_at = ?3
             WHERE address = ?1 AND device_id = ?2",
            params![address, device_id, now_secs()],
        )?;
        if updated == 0 {
            return Err(CryptoError::StorageError(format!(
                "no recorded identity for {address}.{device_id}"
            )));
        }
        Ok(())
    }

    pub fn is_identity_verified(&self, address: &str, device_id: u32) -> Result<bool, CryptoError> {
        let verified: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT verified_at FROM crypto_trusted_identities
                 WHERE address = ?1 AND device_id = ?2",
                params![address, device_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(verified, Some(Some(_))))
    }

    // --- config ---

    pub fn set_config(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_config (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        let row = self
            .conn
            .query_row(
                "SELECT value FROM crypto_config WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    // --- one-time pre-keys ---

    pub fn next_pre_key_id(&self) -> Result<u32, CryptoError> {
        let max: u32 = self.conn.query_row(
            "SELECT COALESCE(MAX(key_id), 0) FROM crypto_pre_keys",
            [],
            |row| row.get(0),
        )?;
        Ok(max + 1)
    }

    pub fn insert_pre_key(
        &self,
        key_id: u32,
        public_key: &[u8],
        private_key: &[u8],
    ) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_pre_keys (key_id, public_key, private_key, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key_id, public_key, private_key, now_secs()],
        )?;
        Ok(())
    }

    /// Private key and consumed flag for a pre-key, if it exists.
    pub fn get_pre_key(&self, key_id: u32) -> Result<Option<(Vec<u8>, bool)>, CryptoError> {
        let row = self
            .conn
            .query_row(
                "SELECT private_key, consumed FROM crypto_pre_keys WHERE key_id = ?1",
                [key_id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()?;
        Ok(row)
    }

    /// Tombstone a consumed pre-key. The private key material is blanked
    /// but the row stays so replayed handshakes are detectable.
    pub fn mark_pre_key_consumed(&self, key_id: u32) -> Result<(), CryptoError> {
        self.conn.execute(
            "UPDATE crypto_pre_keys SET consumed = 1, private_key = x'' WHERE key_id = ?1",
            [key_id],
        )?;
        Ok(())
    }

    pub fn mark_pre_keys_uploaded(&self, key_ids: &[u32]) -> Result<(), CryptoError> {
        let mut stmt = self
            .conn
            .prepare("UPDATE crypto_pre_keys SET uploaded = 1 WHERE key_id = ?1")?;
        for key_id in key_ids {
            stmt.execute([key_id])?;
        }
        Ok(())
    }

    pub fn count_available_pre_keys(&self) -> Result<u32, CryptoError> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM crypto_pre_keys WHERE consumed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Unconsumed pre-key ids and public keys, oldest first.
    pub fn list_unconsumed_pre_keys(&self) -> Result<Vec<(u32, Vec<u8>)>, CryptoError> {
        let mut stmt = self.conn.prepare(
            "SELECT key_id, public_key FROM crypto_pre_keys
             WHERE consumed = 0 ORDER BY key_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- signed pre-keys ---

    pub fn next_signed_pre_key_id(&self) -> Result<u32, CryptoError> {
        let max: u32 = self.conn.query_row(
            "SELECT COALESCE(MAX(key_id), 0) FROM crypto_signed_pre_keys",
            [],
            |row| row.get(0),
        )?;
        Ok(max + 1)
    }

    pub fn insert_signed_pre_key(
        &self,
        key_id: u32,
        public_key: &[u8],
        private_key: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_signed_pre_keys
             (key_id, public_key, private_key, signature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key_id, public_key, private_key, signature, now_secs()],
        )?;
        Ok(())
    }

    /// The current (non-retired) signed pre-key: id, public key, signature,
    /// creation time.
    pub fn active_signed_pre_key(
        &self,
    ) -> Result<Option<(u32, Vec<u8>, Vec<u8>, i64)>, CryptoError> {
        let row = self
            .conn
            .query_row(
                "SELECT key_id, public_key, signature, created_at
                 FROM crypto_signed_pre_keys
                 WHERE retired_at IS NULL
                 ORDER BY key_id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Private half of a signed pre-key, retired or not. Retired keys stay
    /// decryptable until pruned so in-flight handshakes still complete.
    pub fn signed_pre_key_private(&self, key_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        let row = self
            .conn
            .query_row(
                "SELECT private_key FROM crypto_signed_pre_keys WHERE key_id = ?1",
                [key_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn retire_signed_pre_keys_except(&self, key_id: u32) -> Result<(), CryptoError> {
        self.conn.execute(
            "UPDATE crypto_signed_pre_keys SET retired_at = ?2
             WHERE key_id != ?1 AND retired_at IS NULL",
            params![key_id, now_secs()],
        )?;
        Ok(())
    }

    pub fn prune_retired_signed_pre_keys(&self, grace_secs: i64) -> Result<usize, CryptoError> {
        let deleted = self.conn.execute(
            "DELETE FROM crypto_signed_pre_keys WHERE retired_at IS NOT NULL AND retired_at <= ?1",
            [now_secs() - grace_secs],
        )?;
        Ok(deleted)
    }

    // --- sessions ---

    pub fn store_session(
        &self,
        address: &str,
        device_id: u32,
        session_data: &[u8],
    ) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_sessions (address, device_id, session_data, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (address, device_id)
             DO UPDATE SET session_data = excluded.session_data, last_used_at = excluded.last_used_at",
            params![address, device_id, session_data, now_secs()],
        )?;
        Ok(())
    }

    pub fn load_session(&self, address: &str, device_id: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        let row = self
            .conn
            .query_row(
                "SELECT session_data FROM crypto_sessions WHERE address = ?1 AND device_id = ?2",
                params![address, device_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_session(&self, address: &str, device_id: u32) -> Result<bool, CryptoError> {
        let deleted = self.conn.execute(
            "DELETE FROM crypto_sessions WHERE address = ?1 AND device_id = ?2",
            params![address, device_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn has_session(&self, address: &str, device_id: u32) -> Result<bool, CryptoError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM crypto_sessions WHERE address = ?1 AND device_id = ?2",
            params![address, device_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Run `f` inside a transaction, committing on success and rolling back on
/// error. Uses an unchecked transaction so the connection can be shared
/// behind an async mutex.
pub fn with_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&CryptoStore) -> Result<T, CryptoError>,
) -> Result<T, CryptoError> {
    let tx = conn.unchecked_transaction()?;
    let store = CryptoStore::new(conn);
    let result = f(&store)?;
    tx.commit()?;
    Ok(result)
}

/// Fresh in-memory database with the crypto schema applied.
#[cfg(test)]
pub fn init_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    migrations::run_migrations(&conn).expect("run migrations");
    conn
}
