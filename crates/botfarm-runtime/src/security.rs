//! Password hashing and bearer token signing.
//!
//! Passwords are stored as PBKDF2-HMAC-SHA256 hashes in the modular crypt
//! layout `$pbkdf2-sha256$<rounds>$<salt>$<checksum>`, where salt and
//! checksum use the adapted base64 alphabet (`.` in place of `+`, no
//! padding). Bearer tokens are HS256 JWTs carrying `sub` and `exp`.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::LeaseError;

pub const DEFAULT_HASH_ITERATIONS: u32 = 29_000;

const HASH_IDENT: &str = "pbkdf2-sha256";
const CHECKSUM_LEN: usize = 32;

fn ab64_encode(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes).replace('+', ".")
}

fn ab64_decode(text: &str) -> Option<Vec<u8>> {
    STANDARD_NO_PAD.decode(text.replace('.', "+")).ok()
}

fn derive(password: &str, salt: &[u8], rounds: u32) -> [u8; CHECKSUM_LEN] {
    let mut checksum = [0u8; CHECKSUM_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut checksum);
    checksum
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasswordHasher {
    iterations: u32,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::with_iterations(DEFAULT_HASH_ITERATIONS)
    }
}

impl PasswordHasher {
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn hash(&self, password: &str) -> Result<String, LeaseError> {
        let salt = Uuid::new_v4().into_bytes();
        let checksum = derive(password, &salt, self.iterations);
        Ok(format!(
            "${HASH_IDENT}${}${}${}",
            self.iterations,
            ab64_encode(&salt),
            ab64_encode(&checksum)
        ))
    }

    /// Check `password` against a stored hash. A malformed hash never
    /// verifies. The round count comes from the stored hash, not from
    /// `self`.
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        let mut parts = stored.split('$');
        let (Some(""), Some(HASH_IDENT), Some(rounds), Some(salt), Some(checksum), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return false;
        };
        let (Ok(rounds), Some(salt), Some(checksum)) =
            (rounds.parse::<u32>(), ab64_decode(salt), ab64_decode(checksum))
        else {
            return false;
        };
        if rounds == 0 || checksum.len() != CHECKSUM_LEN {
            return false;
        }
        derive(password, &salt, rounds)[..].ct_eq(&checksum[..]).into()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// Issues and checks HS256 bearer tokens.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, LeaseError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(LeaseError::Validation("auth secret must not be empty".to_string()));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        })
    }

    pub fn sign(&self, subject: &str, expires_at: DateTime<Utc>) -> Result<String, LeaseError> {
        if subject.is_empty() {
            return Err(LeaseError::Validation("token subject must not be empty".to_string()));
        }
        let claims = Claims {
            sub: subject.to_string(),
            exp: expires_at.timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| LeaseError::Store(format!("token signing failed: {err}")))
    }

    /// Returns the subject of a well-signed token that has not expired at
    /// `now`.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Option<String> {
        // Expiry is checked against the caller's clock below.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .ok()?
            .claims;
        if now.timestamp() >= claims.exp {
            return None;
        }
        Some(claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    #[test]
    fn password_hash_verifies_only_the_original_password() {
        let hasher = PasswordHasher::with_iterations(16);
        let stored = hasher.hash("hunter22").expect("hash");
        assert!(stored.starts_with("$pbkdf2-sha256$16$"));
        assert!(hasher.verify("hunter22", &stored));
        assert!(!hasher.verify("hunter23", &stored));
    }

    #[test]
    fn verifies_hashes_in_the_modular_crypt_layout() {
        // PBKDF2-HMAC-SHA256("password", "salt", 1) = 120fb6cf...b70be17b
        let stored = "$pbkdf2-sha256$1$c2FsdA$Eg.2z/z4syxD5yJSVsT4N6hlSMkszDVICAWYfLcL4Xs";
        let hasher = PasswordHasher::default();
        assert!(hasher.verify("password", stored));
        assert!(!hasher.verify("passwore", stored));
    }

    #[test]
    fn adapted_alphabet_round_trips_plus_signs() {
        let bytes = [0xfb, 0xef, 0xbe];
        assert_eq!(ab64_encode(&bytes), "....");
        assert_eq!(ab64_decode("....").as_deref(), Some(&bytes[..]));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let hasher = PasswordHasher::with_iterations(2);
        assert_ne!(
            hasher.hash("secret").expect("hash"),
            hasher.hash("secret").expect("hash")
        );
    }

    #[test]
    fn malformed_hashes_never_verify() {
        let hasher = PasswordHasher::with_iterations(2);
        for stored in [
            "",
            "pbkdf2-sha256$2$c2FsdA$AAAA",
            "$pbkdf2-sha1$2$c2FsdA$AAAA",
            "$pbkdf2-sha256$0$c2FsdA$AAAA",
            "$pbkdf2-sha256$2$c2FsdA",
            "$pbkdf2-sha256$2$!!$AAAA",
            "$pbkdf2-sha256$2$c2FsdA$AAAA",
        ] {
            assert!(!hasher.verify("secret", stored), "{stored}");
        }
    }

    #[test]
    fn tokens_expire_and_reject_tampering() {
        let signer = TokenSigner::new("test-secret").expect("signer");
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let token = signer.sign("abc", now + Duration::minutes(5)).expect("sign");
        assert_eq!(token.split('.').count(), 3);

        assert_eq!(signer.verify(&token, now).as_deref(), Some("abc"));
        assert_eq!(signer.verify(&token, now + Duration::minutes(5)), None);

        // Claims from one token, signature from another.
        let other_claims = signer.sign("abd", now + Duration::minutes(5)).expect("sign");
        let (body, _) = other_claims.rsplit_once('.').expect("jwt");
        let (_, signature) = token.rsplit_once('.').expect("jwt");
        assert_eq!(signer.verify(&format!("{body}.{signature}"), now), None);

        let other = TokenSigner::new("other-secret").expect("signer");
        assert_eq!(other.verify(&token, now), None);
        assert_eq!(signer.verify("not-a-token", now), None);
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(TokenSigner::new(""), Err(LeaseError::Validation(_))));
    }
}
