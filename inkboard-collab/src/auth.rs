//! Connection-time identity verification.
//!
//! Tokens are HS256 JWTs issued elsewhere; this module only checks the
//! signature (and `exp` when present) and extracts who the caller is.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::protocol::string_or_number;

/// Display name used when the token carries none.
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// Verified user identity. Immutable once derived from a token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Token claims understood by the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// Verifies bearer tokens presented during the websocket handshake.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Create a verifier for tokens signed with the shared `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens are long-lived session tokens; `exp` is honoured but optional.
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a credential. Malformed, forged or expired tokens yield `None`.
    pub fn verify(&self, token: &str) -> Option<Identity> {
        if token.is_empty() {
            return None;
        }
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => {
                let display_name = data
                    .claims
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| ANONYMOUS_NAME.to_string());
                Some(Identity {
                    user_id: data.claims.user_id,
                    display_name,
                })
            }
            Err(e) => {
                log::debug!("Token rejected: {e}");
                None
            }
        }
    }
}

/// Extract the `token` query parameter from a request query string.
pub fn token_from_query(query: Option<&str>) -> Option<&str> {
    query?.split('&').find_map(|pair| {
        let mut it = pair.splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("token"), Some(value)) if !value.is_empty() => Some(value),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"test-secret";

    fn sign(claims: &serde_json::Value, secret: &[u8]) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    #[test]
    fn test_verify_valid_token() {
        let verifier = TokenVerifier::new(SECRET);
        let token = sign(&serde_json::json!({"userId": "u-1", "name": "Alice"}), SECRET);

        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.user_id, "u-1");
        assert_eq!(identity.display_name, "Alice");
    }

    #[test]
    fn test_verify_defaults_display_name() {
        let verifier = TokenVerifier::new(SECRET);
        let token = sign(&serde_json::json!({"userId": 12}), SECRET);

        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.user_id, "12");
        assert_eq!(identity.display_name, ANONYMOUS_NAME);
    }

    #[test]
    fn test_verify_wrong_secret() {
        let verifier = TokenVerifier::new(SECRET);
        let token = sign(&serde_json::json!({"userId": "u-1"}), b"other-secret");
        assert!(verifier.verify(&token).is_none());
    }

    #[test]
    fn test_verify_expired() {
        let verifier = TokenVerifier::new(SECRET);
        let token = sign(&serde_json::json!({"userId": "u-1", "exp": now() - 3600}), SECRET);
        assert!(verifier.verify(&token).is_none());
    }

    #[test]
    fn test_verify_not_yet_expired() {
        let verifier = TokenVerifier::new(SECRET);
        let token = sign(&serde_json::json!({"userId": "u-1", "exp": now() + 3600}), SECRET);
        assert!(verifier.verify(&token).is_some());
    }

    #[test]
    fn test_verify_garbage_does_not_panic() {
        let verifier = TokenVerifier::new(SECRET);
        for token in ["", "abc", "a.b.c", "....", "\u{0}\u{1}"] {
            assert!(verifier.verify(token).is_none());
        }
    }

    #[test]
    fn test_verify_missing_user_id() {
        let verifier = TokenVerifier::new(SECRET);
        let token = sign(&serde_json::json!({"name": "Alice"}), SECRET);
        assert!(verifier.verify(&token).is_none());
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query(Some("token=abc")), Some("abc"));
        assert_eq!(token_from_query(Some("room=1&token=x.y.z")), Some("x.y.z"));
        assert_eq!(token_from_query(Some("token=")), None);
        assert_eq!(token_from_query(Some("other=1")), None);
        assert_eq!(token_from_query(None), None);
    }
}
