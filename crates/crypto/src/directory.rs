//! Key directory abstraction.
//!
//! The directory is the server-side store of published pre-key bundles.
//! `SessionEngine` is generic over this trait; `InMemoryDirectory` backs
//! tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use murmur_shared::ids::UserId;

use crate::error::CryptoError;
use crate::prekeys::{FetchedBundle, OneTimePreKeyPublic, PublishedBundle, SignedPreKeyPublic};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("no bundle published for {0}")]
    NotFound(String),

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

impl From<DirectoryError> for CryptoError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(who) => {
                CryptoError::DirectoryUnavailable(format!("no bundle published for {who}"))
            }
            DirectoryError::Unavailable(detail) => CryptoError::DirectoryUnavailable(detail),
        }
    }
}

/// Server-side pre-key bundle storage.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Upload or replace a device's bundle.
    async fn publish_bundle(
        &self,
        user_id: &UserId,
        device_id: u32,
        bundle: &PublishedBundle,
    ) -> Result<(), DirectoryError>;

    /// Fetch a device's bundle with at most one unconsumed one-time
    /// pre-key attached.
    async fn fetch_bundle(
        &self,
        user_id: &UserId,
        device_id: u32,
    ) -> Result<FetchedBundle, DirectoryError>;

    /// Mark a one-time pre-key as handed out so no other sender gets it.
    async fn consume_one_time_pre_key(
        &self,
        user_id: &UserId,
        device_id: u32,
        key_id: u32,
    ) -> Result<(), DirectoryError>;
}

#[async_trait]
impl<D: DirectoryService + ?Sized> DirectoryService for std::sync::Arc<D> {
    async fn publish_bundle(
        &self,
        user_id: &UserId,
        device_id: u32,
        bundle: &PublishedBundle,
    ) -> Result<(), DirectoryError> {
        (**self).publish_bundle(user_id, device_id, bundle).await
    }

    async fn fetch_bundle(
        &self,
        user_id: &UserId,
        device_id: u32,
    ) -> Result<FetchedBundle, DirectoryError> {
        (**self).fetch_bundle(user_id, device_id).await
    }

    async fn consume_one_time_pre_key(
        &self,
        user_id: &UserId,
        device_id: u32,
        key_id: u32,
    ) -> Result<(), DirectoryError> {
        (**self).consume_one_time_pre_key(user_id, device_id, key_id).await
    }
}

/// Fetch a bundle with a deadline. A slow or hung directory surfaces as
/// `BundleFetchTimeout` instead of blocking the send path.
pub async fn fetch_bundle_with_timeout<D: DirectoryService + ?Sized>(
    directory: &D,
    user_id: &UserId,
    device_id: u32,
    timeout: Duration,
) -> Result<FetchedBundle, CryptoError> {
    match tokio::time::timeout(timeout, directory.fetch_bundle(user_id, device_id)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CryptoError::BundleFetchTimeout),
    }
}

struct StoredBundle {
    identity_key: Vec<u8>,
    registration_id: u32,
    signed_pre_key: SignedPreKeyPublic,
    one_time_pre_keys: Vec<(OneTimePreKeyPublic, bool)>,
}

/// Process-local directory for tests and development.
#[derive(Default)]
pub struct InMemoryDirectory {
    bundles: Mutex<HashMap<(UserId, u32), StoredBundle>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconsumed one-time pre-keys remaining for a device.
    pub fn remaining_one_time_pre_keys(&self, user_id: &UserId, device_id: u32) -> usize {
        let Ok(bundles) = self.bundles.lock() else {
            return 0;
        };
        bundles
            .get(&(*user_id, device_id))
            .map(|stored| {
                stored
                    .one_time_pre_keys
                    .iter()
                    .filter(|(_, consumed)| !consumed)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl DirectoryService for InMemoryDirectory {
    async fn publish_bundle(
        &self,
        user_id: &UserId,
        device_id: u32,
        bundle: &PublishedBundle,
    ) -> Result<(), DirectoryError> {
        let mut bundles = self
            .bundles
            .lock()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?;

        // re-publishing keeps consumption marks for keys we already saw
        let previous = bundles.remove(&(*user_id, device_id));
        let consumed_ids: Vec<u32> = previous
            .map(|stored| {
                stored
                    .one_time_pre_keys
                    .iter()
                    .filter(|(_, consumed)| *consumed)
                    .map(|(key, _)| key.key_id)
                    .collect()
            })
            .unwrap_or_default();

        let one_time_pre_keys = bundle
            .one_time_pre_keys
            .iter()
            .map(|key| (key.clone(), consumed_ids.contains(&key.key_id)))
            .collect();

        bundles.insert(
            (*user_id, device_id),
            StoredBundle {
                identity_key: bundle.identity_key.clone(),
                registration_id: bundle.registration_id,
                signed_pre_key: bundle.signed_pre_key.clone(),
                one_time_pre_keys,
            },
        );
        debug!(%user_id, device_id, "published bundle");
        Ok(())
    }

    async fn fetch_bundle(
        &self,
        user_id: &UserId,
        device_id: u32,
    ) -> Result<FetchedBundle, DirectoryError> {
        let bundles = self
            .bundles
            .lock()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?;
        let stored = bundles
            .get(&(*user_id, device_id))
            .ok_or_else(|| DirectoryError::NotFound(format!("{user_id}.{device_id}")))?;

        let one_time_pre_key = stored
            .one_time_pre_keys
            .iter()
            .find(|(_, consumed)| !consumed)
            .map(|(key, _)| key.clone());

        Ok(FetchedBundle {
            identity_key: stored.identity_key.clone(),
            registration_id: stored.registration_id,
            signed_pre_key: stored.signed_pre_key.clone(),
            one_time_pre_key,
        })
    }

    async fn consume_one_time_pre_key(
        &self,
        user_id: &UserId,
        device_id: u32,
        key_id: u32,
    ) -> Result<(), DirectoryError> {
        let mut bundles = self
            .bundles
            .lock()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?;
        let stored = bundles
            .get_mut(&(*user_id, device_id))
            .ok_or_else(|| DirectoryError::NotFound(format!("{user_id}.{device_id}")))?;

        for (key, consumed) in &mut stored.one_time_pre_keys {
            if key.key_id == key_id {
                *consumed = true;
                return Ok(());
            }
        }
        Err(DirectoryError::NotFound(format!("pre-key {key_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(otpk_count: u32) -> PublishedBundle {
        PublishedBundle {
            identity_key: vec![1u8; 64],
            registration_id: 42,
            signed_pre_key: SignedPreKeyPublic {
                key_id: 1,
                public_key: [2u8; 32],
                signature: vec![3u8; 64],
                created_at: 0,
            },
            one_time_pre_keys: (1..=otpk_count)
                .map(|key_id| OneTimePreKeyPublic {
                    key_id,
                    public_key: [4u8; 32],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn fetch_returns_first_unconsumed_key() {
        let directory = InMemoryDirectory::new();
        let user = UserId::new();
        directory.publish_bundle(&user, 1, &bundle(2)).await.unwrap();

        let fetched = directory.fetch_bundle(&user, 1).await.unwrap();
        assert_eq!(fetched.one_time_pre_key.unwrap().key_id, 1);

        directory.consume_one_time_pre_key(&user, 1, 1).await.unwrap();
        let fetched = directory.fetch_bundle(&user, 1).await.unwrap();
        assert_eq!(fetched.one_time_pre_key.unwrap().key_id, 2);
    }

    #[tokio::test]
    async fn exhausted_bundle_fetches_without_key() {
        let directory = InMemoryDirectory::new();
        let user = UserId::new();
        directory.publish_bundle(&user, 1, &bundle(1)).await.unwrap();
        directory.consume_one_time_pre_key(&user, 1, 1).await.unwrap();

        let fetched = directory.fetch_bundle(&user, 1).await.unwrap();
        assert!(fetched.one_time_pre_key.is_none());
    }

    #[tokio::test]
    async fn fetch_unknown_device_fails() {
        let directory = InMemoryDirectory::new();
        assert!(matches!(
            directory.fetch_bundle(&UserId::new(), 1).await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn republish_preserves_consumption_marks() {
        let directory = InMemoryDirectory::new();
        let user = UserId::new();
        directory.publish_bundle(&user, 1, &bundle(2)).await.unwrap();
        directory.consume_one_time_pre_key(&user, 1, 1).await.unwrap();

        directory.publish_bundle(&user, 1, &bundle(3)).await.unwrap();
        assert_eq!(directory.remaining_one_time_pre_keys(&user, 1), 2);
        let fetched = directory.fetch_bundle(&user, 1).await.unwrap();
        assert_eq!(fetched.one_time_pre_key.unwrap().key_id, 2);
    }

    #[tokio::test]
    async fn timeout_wrapper_maps_to_bundle_fetch_timeout() {
        struct SlowDirectory;

        #[async_trait]
        impl DirectoryService for SlowDirectory {
            async fn publish_bundle(
                &self,
                _: &UserId,
                _: u32,
                _: &PublishedBundle,
            ) -> Result<(), DirectoryError> {
                Ok(())
            }
            async fn fetch_bundle(
                &self,
                _: &UserId,
                _: u32,
            ) -> Result<FetchedBundle, DirectoryError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!()
            }
            async fn consume_one_time_pre_key(
                &self,
                _: &UserId,
                _: u32,
                _: u32,
            ) -> Result<(), DirectoryError> {
                Ok(())
            }
        }

        tokio::time::pause();
        let result = fetch_bundle_with_timeout(
            &SlowDirectory,
            &UserId::new(),
            1,
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(CryptoError::BundleFetchTimeout)));
    }
}
