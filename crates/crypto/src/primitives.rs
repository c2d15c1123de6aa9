//! Low-level cryptographic building blocks shared by the key agreement and
//! ratchet layers: key generation, Diffie-Hellman, the KDFs, and AEAD.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const X3DH_INFO: &[u8] = b"murmur-x3dh-v1";
const ROOT_INFO: &[u8] = b"murmur-ratchet-root-v1";

/// Fill an array with bytes from the OS RNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a fresh X25519 keypair.
pub fn generate_dh_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::from(random_array::<KEY_LEN>());
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Generate a fresh Ed25519 signing keypair.
pub fn generate_signing_keypair() -> (SigningKey, VerifyingKey) {
    let signing = SigningKey::from_bytes(&random_array::<KEY_LEN>());
    let verifying = signing.verifying_key();
    (signing, verifying)
}

/// X25519 Diffie-Hellman.
pub fn dh(secret: &StaticSecret, public: &PublicKey) -> [u8; KEY_LEN] {
    secret.diffie_hellman(public).to_bytes()
}

/// Derive the shared secret from concatenated X3DH DH outputs.
///
/// The input key material is prefixed with 32 bytes of 0xFF before being
/// run through HKDF-SHA256 with an all-zero salt.
pub fn kdf_initial_secret(dh_outputs: &[[u8; KEY_LEN]]) -> [u8; KEY_LEN] {
    let mut ikm = Vec::with_capacity(KEY_LEN * (dh_outputs.len() + 1));
    ikm.extend_from_slice(&[0xFFu8; KEY_LEN]);
    for output in dh_outputs {
        ikm.extend_from_slice(output);
    }

    let hk = Hkdf::<Sha256>::new(Some(&[0u8; KEY_LEN]), &ikm);
    let mut secret = [0u8; KEY_LEN];
    hk.expand(X3DH_INFO, &mut secret)
        .expect("32 bytes is a valid HKDF output length");
    secret
}

/// Root KDF for a Diffie-Hellman ratchet step. Returns the new root key and
/// the chain key for the new sending or receiving chain.
pub fn kdf_root(root_key: &[u8; KEY_LEN], dh_output: &[u8; KEY_LEN]) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = [0u8; KEY_LEN * 2];
    hk.expand(ROOT_INFO, &mut okm)
        .expect("64 bytes is a valid HKDF output length");

    let mut new_root = [0u8; KEY_LEN];
    let mut chain_key = [0u8; KEY_LEN];
    new_root.copy_from_slice(&okm[..KEY_LEN]);
    chain_key.copy_from_slice(&okm[KEY_LEN..]);
    (new_root, chain_key)
}

/// Symmetric chain KDF. Returns the next chain key and the message key for
/// the current position.
pub fn kdf_chain(chain_key: &[u8; KEY_LEN]) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let next = hmac_sha256(chain_key, &[0x01]);
    let message_key = hmac_sha256(chain_key, &[0x02]);
    (next, message_key)
}

fn hmac_sha256(key: &[u8; KEY_LEN], data: &[u8]) -> [u8; KEY_LEN] {
    // qualified call: aes_gcm::KeyInit also provides new_from_slice
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// AES-256-GCM encryption. Output is nonce || ciphertext.
pub fn seal(key: &[u8; KEY_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("AEAD key must be 32 bytes".into()))?;
    let nonce_bytes = random_array::<NONCE_LEN>();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed("AEAD encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// AES-256-GCM decryption of a nonce || ciphertext blob.
pub fn open(key: &[u8; KEY_LEN], aad: &[u8], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN {
        return Err(CryptoError::DecryptionFailed(
            "ciphertext shorter than nonce".into(),
        ));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("AEAD key must be 32 bytes".into()))?;
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed("AEAD authentication failed".into()))
}

/// Sign a message with an Ed25519 key.
pub fn sign(signing_key: &SigningKey, message: &[u8]) -> [u8; 64] {
    signing_key.sign(message).to_bytes()
}

/// Verify an Ed25519 signature over a message.
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let signature = Signature::from_slice(signature)
        .map_err(|_| CryptoError::InvalidSignature("malformed signature".into()))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature("signature does not verify".into()))
}

/// Parse a 32-byte slice into a fixed array.
pub fn key_bytes(slice: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    slice
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", slice.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_is_commutative() {
        let (secret_a, public_a) = generate_dh_keypair();
        let (secret_b, public_b) = generate_dh_keypair();
        assert_eq!(dh(&secret_a, &public_b), dh(&secret_b, &public_a));
    }

    #[test]
    fn kdf_chain_diverges_message_and_chain_keys() {
        let chain = [7u8; 32];
        let (next, message_key) = kdf_chain(&chain);
        assert_ne!(next, message_key);
        assert_ne!(next, chain);

        // deterministic
        let (next2, mk2) = kdf_chain(&chain);
        assert_eq!(next, next2);
        assert_eq!(message_key, mk2);
    }

    #[test]
    fn kdf_root_depends_on_both_inputs() {
        let (root_a, _) = kdf_root(&[1u8; 32], &[2u8; 32]);
        let (root_b, _) = kdf_root(&[1u8; 32], &[3u8; 32]);
        let (root_c, _) = kdf_root(&[4u8; 32], &[2u8; 32]);
        assert_ne!(root_a, root_b);
        assert_ne!(root_a, root_c);
    }

    #[test]
    fn initial_secret_sensitive_to_dh_count() {
        let three = kdf_initial_secret(&[[1u8; 32], [2u8; 32], [3u8; 32]]);
        let four = kdf_initial_secret(&[[1u8; 32], [2u8; 32], [3u8; 32], [4u8; 32]]);
        assert_ne!(three, four);
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = random_array::<32>();
        let blob = seal(&key, b"aad", b"hello").unwrap();
        let plaintext = open(&key, b"aad", &blob).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let key = random_array::<32>();
        let blob = seal(&key, b"aad", b"hello").unwrap();
        assert!(matches!(
            open(&key, b"other", &blob),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let key = random_array::<32>();
        let mut blob = seal(&key, b"aad", b"hello").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(open(&key, b"aad", &blob).is_err());
    }

    #[test]
    fn open_rejects_truncated_blob() {
        let key = random_array::<32>();
        assert!(open(&key, b"", &[0u8; 4]).is_err());
    }

    #[test]
    fn signature_roundtrip_and_rejection() {
        let (signing, verifying) = generate_signing_keypair();
        let signature = sign(&signing, b"message");
        verify_signature(&verifying, b"message", &signature).unwrap();
        assert!(verify_signature(&verifying, b"other", &signature).is_err());

        let (_, other_key) = generate_signing_keypair();
        assert!(verify_signature(&other_key, b"message", &signature).is_err());
    }

    #[test]
    fn key_bytes_rejects_wrong_length() {
        assert!(key_bytes(&[0u8; 31]).is_err());
        assert!(key_bytes(&[0u8; 32]).is_ok());
    }
}
