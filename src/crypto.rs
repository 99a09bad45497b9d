//! Authenticated encryption for tunneled messages.
//!
//! Tokens are ChaCha20-Poly1305 over a key derived from the configured
//! master key, laid out as `b"CH20" || nonce(12) || ciphertext+tag` and
//! base64url-encoded without padding, so a token is safe to carry in TXT
//! records and (re-encoded) in query labels. Tampering with any part fails
//! decryption.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Master key length (256-bit)
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Token format marker, also bound into the AEAD as associated data
const MAGIC: &[u8; 4] = b"CH20";

const HKDF_SALT_NORMALIZE: &[u8] = b"key-normalize";
const HKDF_SALT_AEAD: &[u8] = b"chacha20+poly1305";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("token is not valid base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("token is malformed ({0})")]
    Malformed(&'static str),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("plaintext is not valid UTF-8")]
    BadUtf8,
    #[error("random generator failure")]
    Rng,
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn hkdf_stretch(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) {
    let len = out.len();
    // HKDF with fixed labels cannot fail for output lengths this small
    if let Ok(okm) = hkdf::Salt::new(hkdf::HKDF_SHA256, salt)
        .extract(ikm)
        .expand(&[info], OkmLen(len))
    {
        let _ = okm.fill(out);
    }
}

/// Normalize arbitrary key material into a 32-byte master key.
///
/// Accepts a base64url-encoded 32-byte key (the `generate_key` format), raw
/// 32 bytes, or (as a last resort) any other byte string stretched
/// deterministically through HKDF.
fn normalize_key(material: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];

    if let Ok(decoded) = URL_SAFE_NO_PAD.decode(trim_padding(material)) {
        if decoded.len() == KEY_LEN {
            key.copy_from_slice(&decoded);
            return key;
        }
    }
    if material.len() == KEY_LEN {
        key.copy_from_slice(material);
        return key;
    }
    hkdf_stretch(HKDF_SALT_NORMALIZE, material, b"master", &mut key);
    key
}

fn trim_padding(material: &[u8]) -> &[u8] {
    let mut end = material.len();
    while end > 0 && material[end - 1] == b'=' {
        end -= 1;
    }
    &material[..end]
}

/// Black-box encrypt/decrypt capability shared by client and server.
pub struct CryptoManager {
    key_bytes: [u8; KEY_LEN],
    rng: SystemRandom,
}

impl CryptoManager {
    /// Build from key material in any accepted form (see [`normalize_key`]).
    pub fn new(material: &[u8]) -> Self {
        let master = normalize_key(material);
        let mut aead_key = [0u8; KEY_LEN];
        hkdf_stretch(HKDF_SALT_AEAD, &master, b"enc", &mut aead_key);
        Self {
            key_bytes: aead_key,
            rng: SystemRandom::new(),
        }
    }

    /// Generate a fresh random master key, base64url-encoded.
    pub fn generate_key() -> Result<String, CryptoError> {
        let mut raw = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut raw)
            .map_err(|_| CryptoError::Rng)?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn sealing_key(&self) -> LessSafeKey {
        // Key length is fixed at construction, so this cannot fail
        let unbound = UnboundKey::new(&aead::CHACHA20_POLY1305, &self.key_bytes)
            .unwrap_or_else(|_| unreachable!("CHACHA20_POLY1305 key is {KEY_LEN} bytes"));
        LessSafeKey::new(unbound)
    }

    /// Encrypt a message into an opaque token. A fresh random nonce makes
    /// repeated encryptions of the same plaintext produce distinct tokens.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Rng)?;

        let mut buf = plaintext.as_bytes().to_vec();
        self.sealing_key()
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(MAGIC),
                &mut buf,
            )
            .map_err(|_| CryptoError::Rng)?;

        let mut blob = Vec::with_capacity(MAGIC.len() + NONCE_LEN + buf.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&buf);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    /// Decrypt a token produced by [`encrypt`]. Fails on any tampering,
    /// truncation, or key mismatch.
    pub fn decrypt(&self, token: &str) -> Result<String, CryptoError> {
        let blob = URL_SAFE_NO_PAD.decode(token.trim_end_matches('='))?;
        if blob.len() < MAGIC.len() + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed("too short"));
        }
        if &blob[..MAGIC.len()] != MAGIC {
            return Err(CryptoError::Malformed("bad magic"));
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&blob[MAGIC.len()..MAGIC.len() + NONCE_LEN]);
        let mut ciphertext = blob[MAGIC.len() + NONCE_LEN..].to_vec();

        let plaintext = self
            .sealing_key()
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(MAGIC),
                &mut ciphertext,
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::BadUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CryptoManager {
        CryptoManager::new(CryptoManager::generate_key().unwrap().as_bytes())
    }

    #[test]
    fn test_roundtrip() {
        let crypto = manager();
        let token = crypto.encrypt("hello over dns").unwrap();
        assert_eq!(crypto.decrypt(&token).unwrap(), "hello over dns");
    }

    #[test]
    fn test_encryption_is_nondeterministic() {
        let crypto = manager();
        let a = crypto.encrypt("same plaintext").unwrap();
        let b = crypto.encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(crypto.decrypt(&a).unwrap(), crypto.decrypt(&b).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key_a = CryptoManager::generate_key().unwrap();
        let key_b = CryptoManager::generate_key().unwrap();
        let a = CryptoManager::new(key_a.as_bytes());
        let b = CryptoManager::new(key_b.as_bytes());

        let token = a.encrypt("secret").unwrap();
        assert!(matches!(
            b.decrypt(&token),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_boundary_lengths() {
        let crypto = manager();
        for len in [0usize, 1, 15, 16, 17, 255, 256, 257] {
            let message: String = std::iter::repeat('B').take(len).collect();
            let token = crypto.encrypt(&message).unwrap();
            assert_eq!(crypto.decrypt(&token).unwrap(), message, "length {len}");
        }
    }

    #[test]
    fn test_unicode_and_control_chars() {
        let crypto = manager();
        for message in ["Hello\nworld\t!", "Unicode: \u{4f60}\u{597d} \u{1f510}", "   "] {
            let token = crypto.encrypt(message).unwrap();
            assert_eq!(crypto.decrypt(&token).unwrap(), message);
        }
    }

    #[test]
    fn test_tampered_token_rejected() {
        let crypto = manager();
        let token = crypto.encrypt("integrity matters").unwrap();

        let mut chars: Vec<char> = token.chars().collect();
        let mid = chars.len() / 2;
        chars[mid] = if chars[mid] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();
        assert!(crypto.decrypt(&tampered).is_err());

        // Truncation
        assert!(crypto.decrypt(&token[..token.len() / 2]).is_err());
        // Garbage
        assert!(crypto.decrypt("not-a-token").is_err());
    }

    #[test]
    fn test_key_normalization_forms_agree() {
        let encoded = CryptoManager::generate_key().unwrap();
        let raw = URL_SAFE_NO_PAD.decode(encoded.as_bytes()).unwrap();

        let from_encoded = CryptoManager::new(encoded.as_bytes());
        let from_raw = CryptoManager::new(&raw);
        let token = from_encoded.encrypt("one key, two spellings").unwrap();
        assert_eq!(from_raw.decrypt(&token).unwrap(), "one key, two spellings");
    }

    #[test]
    fn test_passphrase_key_is_stretched_deterministically() {
        let a = CryptoManager::new(b"correct horse battery staple");
        let b = CryptoManager::new(b"correct horse battery staple");
        let token = a.encrypt("stretched").unwrap();
        assert_eq!(b.decrypt(&token).unwrap(), "stretched");

        let c = CryptoManager::new(b"different passphrase");
        assert!(c.decrypt(&token).is_err());
    }
}
