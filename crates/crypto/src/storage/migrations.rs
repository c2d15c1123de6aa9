use rusqlite::Connection;
use tracing::info;

use crate::error::CryptoError;

/// Ordered schema migrations. Each entry runs at most once per database,
/// tracked in the `_crypto_migrations` table.
const MIGRATIONS: &[(i32, &str)] = &[(
    1,
    "
    CREATE TABLE IF NOT EXISTS crypto_identity_keys (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        public_key BLOB NOT NULL,
        private_key BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS crypto_trusted_identities (
        address TEXT NOT NULL,
        device_id INTEGER NOT NULL,
        identity_key BLOB NOT NULL,
        first_seen_at INTEGER NOT NULL,
        verified_at INTEGER,
        PRIMARY KEY (address, device_id)
    );

    CREATE TABLE IF NOT EXISTS crypto_pre_keys (
        key_id INTEGER PRIMARY KEY,
        public_key BLOB NOT NULL,
        private_key BLOB NOT NULL,
        uploaded INTEGER NOT NULL DEFAULT 0,
        consumed INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS crypto_signed_pre_keys (
        key_id INTEGER PRIMARY KEY,
        public_key BLOB NOT NULL,
        private_key BLOB NOT NULL,
        signature BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        retired_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS crypto_sessions (
        address TEXT NOT NULL,
        device_id INTEGER NOT NULL,
        session_data BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        last_used_at INTEGER NOT NULL,
        PRIMARY KEY (address, device_id)
    );

    CREATE TABLE IF NOT EXISTS crypto_config (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );
    ",
)];

/// Apply any pending crypto schema migrations to the given connection.
pub fn run_migrations(conn: &Connection) -> Result<(), CryptoError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _crypto_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _crypto_migrations",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in MIGRATIONS {
        if *version > current {
            let tx = conn.unchecked_transaction()?;
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO _crypto_migrations (version, applied_at) VALUES (?1, unixepoch())",
                [version],
            )?;
            tx.commit()?;
            info!(version, "applied crypto schema migration");
        }
    }

    Ok(())
}
