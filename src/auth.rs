//! Password hashing, signed access tokens and API key encryption.
//!
//! Everything is built on HMAC-SHA256 from the same primitives the Binance
//! client signs requests with.

use crate::config::DashboardConfig;
use crate::error::{BotError, BotResult};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

fn mac(key: &[u8]) -> BotResult<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| BotError::Auth(format!("bad key: {e}")))
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// `salt$hash`, both hex.
pub fn hash_password(password: &str) -> BotResult<String> {
    let salt = random_bytes::<SALT_LEN>();
    let mut m = mac(&salt)?;
    m.update(password.as_bytes());
    Ok(format!("{}${}", hex::encode(salt), hex::encode(m.finalize().into_bytes())))
}

/// Constant-time check against a stored `salt$hash`.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once('$') else { return false };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(hash_hex)) else {
        return false;
    };
    let Ok(mut m) = mac(&salt) else { return false };
    m.update(password.as_bytes());
    m.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub username: String,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct AuthService {
    token_secret: Vec<u8>,
    encryption_key: Vec<u8>,
    token_ttl: Duration,
}

impl AuthService {
    pub fn new(token_secret: &str, encryption_key: &str, token_ttl: Duration) -> Self {
        Self {
            token_secret: token_secret.as_bytes().to_vec(),
            encryption_key: encryption_key.as_bytes().to_vec(),
            token_ttl,
        }
    }

    pub fn from_config(config: &DashboardConfig) -> Self {
        Self::new(
            &config.token_secret,
            &config.encryption_key,
            Duration::minutes(config.token_ttl_minutes),
        )
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    pub fn issue_token(&self, user_id: i64, username: &str) -> BotResult<String> {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            exp: (Utc::now() + self.token_ttl).timestamp(),
        };
        self.sign_claims(&claims)
    }

    fn sign_claims(&self, claims: &Claims) -> BotResult<String> {
        let payload = serde_json::to_vec(claims).map_err(|e| BotError::Auth(e.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let mut m = mac(&self.token_secret)?;
        m.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(m.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    pub fn verify_token(&self, token: &str) -> BotResult<Claims> {
        let invalid = || BotError::Auth("Invalid token".into());
        let (payload, signature) = token.split_once('.').ok_or_else(invalid)?;
        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| invalid())?;

        let mut m = mac(&self.token_secret)?;
        m.update(payload.as_bytes());
        m.verify_slice(&signature).map_err(|_| invalid())?;

        let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        let claims: Claims = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(BotError::Auth("Token expired".into()));
        }
        Ok(claims)
    }

    fn keystream_xor(&self, nonce: &[u8], data: &mut [u8]) -> BotResult<()> {
        for (counter, chunk) in data.chunks_mut(32).enumerate() {
            let mut m = mac(&self.encryption_key)?;
            m.update(nonce);
            m.update(&(counter as u32).to_be_bytes());
            let block = m.finalize().into_bytes();
            for (byte, k) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= k;
            }
        }
        Ok(())
    }

    fn tag(&self, nonce: &[u8], ciphertext: &[u8]) -> BotResult<HmacSha256> {
        let mut m = mac(&self.encryption_key)?;
        m.update(b"tag");
        m.update(nonce);
        m.update(ciphertext);
        Ok(m)
    }

    /// base64(nonce | ciphertext | tag)
    pub fn encrypt(&self, plaintext: &str) -> BotResult<String> {
        let nonce = random_bytes::<NONCE_LEN>();
        let mut data = plaintext.as_bytes().to_vec();
        self.keystream_xor(&nonce, &mut data)?;
        let tag = self.tag(&nonce, &data)?.finalize().into_bytes();

        let mut out = Vec::with_capacity(NONCE_LEN + data.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&data);
        out.extend_from_slice(&tag);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> BotResult<String> {
        let corrupt = || BotError::Auth("Encrypted value is corrupt".into());
        let raw = STANDARD.decode(encoded).map_err(|_| corrupt())?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(corrupt());
        }
        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        self.tag(nonce, ciphertext)?
            .verify_slice(tag)
            .map_err(|_| corrupt())?;

        let mut data = ciphertext.to_vec();
        self.keystream_xor(nonce, &mut data)?;
        String::from_utf8(data).map_err(|_| corrupt())
    }
}

/// `abcd****wxyz` style preview for showing stored keys.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new("token-secret", "encryption-key", Duration::hours(24))
    }

    #[test]
    fn password_hash_verifies() {
        let stored = hash_password("hunter22").unwrap();
        let (salt, hash) = stored.split_once('$').unwrap();
        assert_eq!(salt.len(), SALT_LEN * 2);
        assert_eq!(hash.len(), 64);
        assert!(verify_password("hunter22", &stored));
        assert!(!verify_password("hunter23", &stored));
        assert!(!verify_password("hunter22", "garbage"));
        // Same password, different salt
        assert_ne!(stored, hash_password("hunter22").unwrap());
    }

    #[test]
    fn token_round_trip_and_tampering() {
        let auth = service();
        let token = auth.issue_token(7, "alice").unwrap();
        let claims = auth.verify_token(&token).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.username, "alice");

        let other = AuthService::new("different", "encryption-key", Duration::hours(1));
        assert!(other.verify_token(&token).is_err());
        assert!(auth.verify_token("not-a-token").is_err());

        let (payload, signature) = token.split_once('.').unwrap();
        let forged = format!("{}x.{}", payload, signature);
        assert!(auth.verify_token(&forged).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let auth = service();
        let token = auth
            .sign_claims(&Claims {
                sub: 1,
                username: "bob".into(),
                exp: Utc::now().timestamp() - 10,
            })
            .unwrap();
        let err = auth.verify_token(&token).unwrap_err();
        assert_eq!(err.to_string(), "Authentication failed: Token expired");
    }

    #[test]
    fn encryption_round_trip() {
        let auth = service();
        let secret = "x".repeat(70);
        let a = auth.encrypt(&secret).unwrap();
        let b = auth.encrypt(&secret).unwrap();
        assert_ne!(a, b);
        assert_eq!(auth.decrypt(&a).unwrap(), secret);

        let wrong_key = AuthService::new("token-secret", "other", Duration::hours(1));
        assert!(wrong_key.decrypt(&a).is_err());
        assert!(auth.decrypt("AAAA").is_err());
    }

    #[test]
    fn masks_keys() {
        assert_eq!(mask_key("abcdefghijkl"), "abcd****ijkl");
        assert_eq!(mask_key("short"), "*****");
    }
}
