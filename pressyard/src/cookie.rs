//! The auth cookie: an opaque capability carrying only a session id.
//!
//! The value is encrypted (XChaCha20-Poly1305, 32-byte key) and signed
//! (HMAC-SHA256, 64-byte key), so holders can neither read nor mint session
//! ids. A cookie that fails to decode for any reason is treated as absent,
//! never as an error: wrong keys and tampering look the same as no cookie.

use anyhow::Context as _;
use axum_extra::extract::cookie::Cookie;
use base64::prelude::*;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac as _};
use sha2::Sha256;
use time::OffsetDateTime;

pub const AUTH_COOKIE_NAME: &str = "auth";

pub const SIGN_KEY_LENGTH: usize = 64;
pub const ENCRYPT_KEY_LENGTH: usize = 32;

/// Sessions, and the cookies carrying them, live this long.
pub const SESSION_LIFETIME: time::Duration = time::Duration::days(30);

const NONCE_LENGTH: usize = 24;

type HmacSha256 = Hmac<Sha256>;

pub struct CookieCodec {
    cipher: XChaCha20Poly1305,
    mac: HmacSha256,
}

impl CookieCodec {
    pub fn new(sign_key: &[u8], encrypt_key: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            sign_key.len() == SIGN_KEY_LENGTH,
            "invalid signing key length: expected {SIGN_KEY_LENGTH} bytes, got {}",
            sign_key.len()
        );
        anyhow::ensure!(
            encrypt_key.len() == ENCRYPT_KEY_LENGTH,
            "invalid encryption key length: expected {ENCRYPT_KEY_LENGTH} bytes, got {}",
            encrypt_key.len()
        );

        let cipher = XChaCha20Poly1305::new_from_slice(encrypt_key).context("bad encryption key")?;
        let mac = hmac::Mac::new_from_slice(sign_key).context("bad signing key")?;

        Ok(Self { cipher, mac })
    }

    pub fn encode(&self, session_id: &str) -> anyhow::Result<String> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, session_id.as_bytes())
            .map_err(|_| anyhow::anyhow!("failed to seal session id"))?;

        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&ciphertext);

        let tag = self.sign(&payload);

        Ok(format!(
            "{}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(&payload),
            BASE64_URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// `None` on any decode failure; the gate treats that as "no cookie".
    pub fn decode(&self, value: &str) -> Option<String> {
        let (payload, tag) = value.split_once('.')?;

        let payload = BASE64_URL_SAFE_NO_PAD.decode(payload).ok()?;
        let tag = BASE64_URL_SAFE_NO_PAD.decode(tag).ok()?;

        let mut mac = self.mac.clone();
        mac.update(AUTH_COOKIE_NAME.as_bytes());
        mac.update(b"|");
        mac.update(&payload);
        mac.verify_slice(&tag).ok()?;

        if payload.len() <= NONCE_LENGTH {
            return None;
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LENGTH);
        let plaintext = self.cipher.decrypt(XNonce::from_slice(nonce), ciphertext).ok()?;

        String::from_utf8(plaintext).ok()
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(AUTH_COOKIE_NAME.as_bytes());
        mac.update(b"|");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

pub fn auth_cookie(value: String, expires: OffsetDateTime) -> Cookie<'static> {
    let mut cookie = Cookie::new(AUTH_COOKIE_NAME, value);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_expires(expires);
    cookie
}

/// An expired, empty cookie: what logout sends back.
pub fn reset_auth_cookie() -> Cookie<'static> {
    let mut cookie = Cookie::new(AUTH_COOKIE_NAME, "");
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_expires(OffsetDateTime::UNIX_EPOCH);
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CookieCodec {
        CookieCodec::new(&[7u8; SIGN_KEY_LENGTH], &[3u8; ENCRYPT_KEY_LENGTH]).expect("codec")
    }

    #[test]
    fn rejects_bad_key_lengths() {
        assert!(CookieCodec::new(&[0u8; 16], &[0u8; ENCRYPT_KEY_LENGTH]).is_err());
        assert!(CookieCodec::new(&[0u8; SIGN_KEY_LENGTH], &[0u8; 16]).is_err());
    }

    #[test]
    fn round_trips_the_session_id() {
        let codec = codec();
        let encoded = codec.encode("session-1234").expect("encode");

        assert_eq!(codec.decode(&encoded).as_deref(), Some("session-1234"));
    }

    #[test]
    fn two_encodings_of_the_same_id_differ() {
        let codec = codec();

        let first = codec.encode("session-1234").expect("encode");
        let second = codec.encode("session-1234").expect("encode");

        assert_ne!(first, second);
    }

    #[test]
    fn tampered_value_decodes_to_none() {
        let codec = codec();
        let encoded = codec.encode("session-1234").expect("encode");

        let mut tampered: String = encoded.clone();
        let flipped = if tampered.remove(0) == 'A' { 'B' } else { 'A' };
        tampered.insert(0, flipped);

        assert_eq!(codec.decode(&tampered), None);
        assert_eq!(codec.decode("garbage"), None);
        assert_eq!(codec.decode(""), None);
    }

    #[test]
    fn value_from_other_keys_decodes_to_none() {
        let codec = codec();
        let other = CookieCodec::new(&[9u8; SIGN_KEY_LENGTH], &[9u8; ENCRYPT_KEY_LENGTH]).expect("codec");

        let encoded = other.encode("session-1234").expect("encode");

        assert_eq!(codec.decode(&encoded), None);
    }
}
