//! Key-hashing and value-encryption envelope.
//!
//! The envelope sits between the cache façade and every back-end. Keys are
//! replaced by a fixed-width lowercase hex digest so back-end key length
//! stays bounded and characters that are illegal in filenames or memcached
//! keys never reach a back-end. Values are sealed with AES-256-GCM under a
//! key derived from the configured passphrase (SHA-256 of its UTF-8 bytes,
//! fixed) and carried as `base64url(nonce || ciphertext || tag)` so every
//! back-end can treat them as an opaque string.
//!
//! A value that fails authentication on the way out is reported as
//! [`CacheError::Crypto`]; one that is not even a well-formed envelope is
//! [`CacheError::Corruption`]. The façade turns both into a logged miss.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{error, warn};
use zeroize::Zeroizing;

use crate::error::{CacheError, CacheResult};
use crate::options::CacheOptions;

/// Key-hashing algorithm applied before delegation to a back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHashAlgo {
    /// Pass raw keys through; the back-end must enforce its key cap.
    None,
    /// SHA-1, 40 hex characters.
    Sha1,
    /// SHA-256, 64 hex characters. The default.
    Sha256,
    /// SHA-384, 96 hex characters.
    Sha384,
    /// SHA-512, 128 hex characters.
    Sha512,
}

impl KeyHashAlgo {
    /// Resolve the `key_hash_algo` option value; absent means SHA-256.
    pub fn from_option(value: Option<&str>) -> CacheResult<Self> {
        match value {
            None => Ok(Self::Sha256),
            Some("none") => Ok(Self::None),
            Some("sha1") => Ok(Self::Sha1),
            Some("sha256") => Ok(Self::Sha256),
            Some("sha384") => Ok(Self::Sha384),
            Some("sha512") => Ok(Self::Sha512),
            Some(other) => Err(CacheError::InvalidConfig(format!(
                "unsupported key_hash_algo: {other}"
            ))),
        }
    }

    /// Apply the algorithm to a raw key.
    pub fn apply(&self, key: &str) -> String {
        match self {
            Self::None => key.to_string(),
            Self::Sha1 => hex::encode(Sha1::digest(key.as_bytes())),
            Self::Sha256 => hex::encode(Sha256::digest(key.as_bytes())),
            Self::Sha384 => hex::encode(Sha384::digest(key.as_bytes())),
            Self::Sha512 => hex::encode(Sha512::digest(key.as_bytes())),
        }
    }
}

/// The envelope configuration owned by one cache handle.
pub struct Envelope {
    hash: KeyHashAlgo,
    /// 256-bit encryption key; `None` means values pass through unsealed.
    key: Option<Zeroizing<[u8; 32]>>,
}

impl Envelope {
    /// AES-256-GCM key size in bytes.
    pub const KEY_SIZE: usize = 32;
    /// AES-GCM nonce size in bytes.
    pub const NONCE_SIZE: usize = 12;
    /// GCM authentication tag size in bytes.
    pub const TAG_SIZE: usize = 16;

    /// Build an envelope from the common options.
    ///
    /// `encrypt_by_default` comes from the back-end type descriptor and is
    /// overridden by an explicit `encrypt=true|false` option. Encryption
    /// requires a `passphrase`: requesting it explicitly without one is a
    /// configuration error, while a type default without one downgrades to
    /// an unencrypted cache with a loud warning. There is no built-in
    /// fallback passphrase.
    pub fn from_options(opts: &CacheOptions, encrypt_by_default: bool) -> CacheResult<Self> {
        let hash = KeyHashAlgo::from_option(opts.get("key_hash_algo"))?;

        let explicit = match opts.get("encrypt") {
            None => None,
            Some(_) => Some(opts.get_bool("encrypt", encrypt_by_default)?),
        };
        let encrypt = explicit.unwrap_or(encrypt_by_default);

        let key = match (encrypt, opts.get("passphrase")) {
            (false, _) => None,
            (true, Some(passphrase)) if !passphrase.is_empty() => {
                let digest = Sha256::digest(passphrase.as_bytes());
                let mut key = Zeroizing::new([0u8; Self::KEY_SIZE]);
                key.copy_from_slice(digest.as_slice());
                Some(key)
            }
            (true, _) if explicit == Some(true) => {
                error!("cache encryption requested but no passphrase is configured");
                return Err(CacheError::InvalidConfig(
                    "encrypt=true requires a passphrase".to_string(),
                ));
            }
            (true, _) => {
                warn!(
                    "cache type defaults to encryption but no passphrase is \
                     configured; values will be stored UNENCRYPTED"
                );
                None
            }
        };

        Ok(Self { hash, key })
    }

    /// Whether values are sealed before delegation.
    pub fn encrypting(&self) -> bool {
        self.key.is_some()
    }

    /// The configured key-hash algorithm.
    pub fn key_hash_algo(&self) -> KeyHashAlgo {
        self.hash
    }

    /// Transform a caller key into the key handed to the back-end.
    pub fn hash_key(&self, key: &str) -> String {
        self.hash.apply(key)
    }

    /// Seal a plaintext value into the opaque wire form.
    pub fn seal(&self, plaintext: &str) -> CacheResult<String> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| CacheError::Crypto("sealing without an encryption key".to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| CacheError::Crypto(format!("cipher setup failed: {e}")))?;

        let mut nonce = [0u8; Self::NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CacheError::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(Self::NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Unseal a wire-form value back into plaintext.
    pub fn open(&self, sealed: &str) -> CacheResult<String> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| CacheError::Crypto("unsealing without an encryption key".to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| CacheError::Crypto(format!("cipher setup failed: {e}")))?;

        let raw = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|e| CacheError::Corruption(format!("envelope is not base64url: {e}")))?;
        if raw.len() < Self::NONCE_SIZE + Self::TAG_SIZE {
            return Err(CacheError::Corruption(format!(
                "envelope too short: {} bytes",
                raw.len()
            )));
        }

        let (nonce, ciphertext) = raw.split_at(Self::NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CacheError::Crypto("authentication failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CacheError::Corruption("decrypted value is not UTF-8".to_string()))
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("hash", &self.hash)
            .field("encrypting", &self.encrypting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encrypted(passphrase: &str) -> Envelope {
        let mut opts = CacheOptions::new();
        opts.push("encrypt", "true");
        opts.push("passphrase", passphrase);
        Envelope::from_options(&opts, false).unwrap()
    }

    #[test]
    fn sha256_is_the_default() {
        let env = Envelope::from_options(&CacheOptions::new(), false).unwrap();
        assert_eq!(env.key_hash_algo(), KeyHashAlgo::Sha256);
        assert_eq!(env.hash_key("piet").len(), 64);
        assert!(env
            .hash_key("piet")
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn none_passes_keys_through() {
        let opts = CacheOptions::parse("key_hash_algo=none").unwrap();
        let env = Envelope::from_options(&opts, false).unwrap();
        assert_eq!(env.hash_key("hans"), "hans");
    }

    #[test]
    fn unknown_algo_is_rejected() {
        let opts = CacheOptions::parse("key_hash_algo=crc32").unwrap();
        assert!(Envelope::from_options(&opts, false).is_err());
    }

    #[test]
    fn seal_open_round_trip() {
        let env = encrypted("secret");
        let sealed = env.seal("klaas").unwrap();
        assert_ne!(sealed, "klaas");
        assert!(!sealed.contains("klaas"));
        assert_eq!(env.open(&sealed).unwrap(), "klaas");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let env = encrypted("secret");
        assert_ne!(env.seal("v").unwrap(), env.seal("v").unwrap());
    }

    #[test]
    fn wrong_passphrase_fails_authentication() {
        let sealed = encrypted("one").seal("klaas").unwrap();
        let err = encrypted("two").open(&sealed).unwrap_err();
        assert!(matches!(err, CacheError::Crypto(_)));
    }

    #[test]
    fn tampering_fails_authentication() {
        let env = encrypted("secret");
        let sealed = env.seal("klaas").unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(env.open(&tampered).is_err());
    }

    #[test]
    fn malformed_envelope_is_corruption() {
        let env = encrypted("secret");
        assert!(matches!(
            env.open("not base64!?"),
            Err(CacheError::Corruption(_))
        ));
        assert!(matches!(env.open("c2hvcnQ"), Err(CacheError::Corruption(_))));
    }

    #[test]
    fn explicit_encrypt_without_passphrase_is_rejected() {
        let opts = CacheOptions::parse("encrypt=true").unwrap();
        let err = Envelope::from_options(&opts, false).unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfig(_)));
    }

    #[test]
    fn default_encrypt_without_passphrase_downgrades() {
        let env = Envelope::from_options(&CacheOptions::new(), true).unwrap();
        assert!(!env.encrypting());
    }

    #[test]
    fn explicit_off_beats_type_default() {
        let opts = CacheOptions::parse("encrypt=false&passphrase=secret").unwrap();
        let env = Envelope::from_options(&opts, true).unwrap();
        assert!(!env.encrypting());
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_values(value in "\\PC{0,256}", passphrase in "[a-z]{1,16}") {
            let env = encrypted(&passphrase);
            let sealed = env.seal(&value).unwrap();
            prop_assert_eq!(env.open(&sealed).unwrap(), value);
        }
    }
}
