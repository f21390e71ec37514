//! Bearer identity tokens (HS256 JWT).

use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use huddle_core::events::UserSummary;
use huddle_core::ids::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub exp: u64,
}

/// The caller a verified token speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Identity {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.user_id.clone(),
            username: self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token subject does not match {0}")]
    Mismatch(UserId),
}

pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &SecretString) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        Ok(Identity {
            user_id: UserId::from(claims.sub),
            username: claims.username,
        })
    }

    /// Verify `token` and require that it belongs to `user`.
    pub fn verify_for(&self, token: &str, user: &UserId) -> Result<Identity, AuthError> {
        let identity = self.verify(token)?;
        if &identity.user_id != user {
            return Err(AuthError::Mismatch(user.clone()));
        }
        Ok(identity)
    }

    /// Mint a token for local tooling and tests.
    pub fn issue(
        &self,
        user: &UserId,
        username: Option<&str>,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let exp = chrono::Utc::now().timestamp().max(0) as u64 + ttl.as_secs();
        self.sign(&Claims {
            sub: user.to_string(),
            username: username.map(str::to_owned),
            exp,
        })
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(&SecretString::from("test-secret"))
    }

    #[test]
    fn issued_token_verifies() {
        let v = verifier();
        let token = v
            .issue(&UserId::from("alice"), Some("Alice"), Duration::from_secs(60))
            .unwrap();
        let identity = v.verify(&token).unwrap();
        assert_eq!(identity.user_id, UserId::from("alice"));
        assert_eq!(identity.username.as_deref(), Some("Alice"));
        assert_eq!(identity.summary().id, UserId::from("alice"));
    }

    #[test]
    fn expired_token_rejected() {
        let v = verifier();
        let past = chrono::Utc::now().timestamp() as u64 - 3600;
        let token = v
            .sign(&Claims {
                sub: "alice".into(),
                username: None,
                exp: past,
            })
            .unwrap();
        assert_eq!(v.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = verifier()
            .issue(&UserId::from("alice"), None, Duration::from_secs(60))
            .unwrap();
        let other = TokenVerifier::new(&SecretString::from("other-secret"));
        assert!(matches!(other.verify(&token), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn garbage_and_empty_rejected() {
        let v = verifier();
        assert_eq!(v.verify(""), Err(AuthError::Missing));
        assert!(matches!(v.verify("a.b.c"), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn subject_must_match_path_user() {
        let v = verifier();
        let token = v
            .issue(&UserId::from("alice"), None, Duration::from_secs(60))
            .unwrap();
        assert!(v.verify_for(&token, &UserId::from("alice")).is_ok());
        assert_eq!(
            v.verify_for(&token, &UserId::from("bob")),
            Err(AuthError::Mismatch(UserId::from("bob")))
        );
    }
}
