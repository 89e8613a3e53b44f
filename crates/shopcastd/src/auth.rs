//! Token verification for the connection handshake.
//!
//! Two verifiers ship: fixed tokens from config (development, internal
//! services) and HS256 JWTs carrying `sub`, `role` and `exp`. They are
//! combined with [`VerifierChain`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shopcast_core::{Identity, IdentityId, Role};

use crate::config::AuthConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing token")]
    Missing,

    #[error("Invalid token: {0}")]
    Invalid(String),

    #[error("Token expired")]
    Expired,

    #[error("Failed to issue token: {0}")]
    Issue(String),
}

/// Resolves a bearer token to an identity.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

// ============================================================================
// Static tokens
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown token".to_string()))
    }
}

// ============================================================================
// JWT
// ============================================================================

/// Claims of a connection token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl AuthVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        let id = IdentityId::new(data.claims.sub).map_err(|e| AuthError::Invalid(e.to_string()))?;
        let role: Role = data
            .claims
            .role
            .parse()
            .map_err(|e: shopcast_core::DomainError| AuthError::Invalid(e.to_string()))?;
        Ok(Identity::new(id, role))
    }
}

/// Issues an HS256 connection token valid for `ttl`.
pub fn issue_token(secret: &[u8], identity: &Identity, ttl: Duration) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let ttl = i64::try_from(ttl.as_secs()).map_err(|e| AuthError::Issue(e.to_string()))?;
    let claims = Claims {
        sub: identity.id.to_string(),
        role: identity.role.to_string(),
        iat: now,
        exp: now.saturating_add(ttl),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| AuthError::Issue(e.to_string()))
}

// ============================================================================
// Chain
// ============================================================================

/// Tries each verifier in order; the first success wins.
#[derive(Clone, Default)]
pub struct VerifierChain {
    verifiers: Vec<Arc<dyn AuthVerifier>>,
}

impl VerifierChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, verifier: Arc<dyn AuthVerifier>) -> Self {
        self.verifiers.push(verifier);
        self
    }

    /// Builds the verifiers named by config.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let mut chain = Self::new();

        if !config.tokens.is_empty() {
            let mut tokens = StaticTokenVerifier::new();
            for entry in &config.tokens {
                let id = IdentityId::new(entry.identity.as_str())
                    .map_err(|e| AuthError::Invalid(e.to_string()))?;
                tokens = tokens.with_token(entry.token.as_str(), Identity::new(id, entry.role));
            }
            chain = chain.with(Arc::new(tokens));
        }
        if let Some(secret) = &config.jwt_secret {
            chain = chain.with(Arc::new(JwtVerifier::new(secret.as_bytes())));
        }
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.verifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }
}

#[async_trait]
impl AuthVerifier for VerifierChain {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let mut last = AuthError::Invalid("no verifier configured".to_string());
        for verifier in &self.verifiers {
            match verifier.verify(token).await {
                Ok(identity) => return Ok(identity),
                // An expired JWT is more useful to report than "unknown token"
                Err(e @ AuthError::Expired) => return Err(e),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticToken;

    const SECRET: &[u8] = b"test-secret-with-enough-bytes-32!";

    fn alice() -> Identity {
        Identity::new(IdentityId::new("alice").unwrap(), Role::Customer)
    }

    #[tokio::test]
    async fn test_static_tokens() {
        let verifier = StaticTokenVerifier::new().with_token("t-alice", alice());
        assert_eq!(verifier.verify("t-alice").await.unwrap(), alice());
        assert!(matches!(verifier.verify("nope").await, Err(AuthError::Invalid(_))));
        assert_eq!(verifier.verify("").await, Err(AuthError::Missing));
    }

    #[tokio::test]
    async fn test_jwt_round_trip() {
        let token = issue_token(SECRET, &alice(), Duration::from_secs(60)).unwrap();
        let identity = JwtVerifier::new(SECRET).verify(&token).await.unwrap();
        assert_eq!(identity, alice());
    }

    #[tokio::test]
    async fn test_jwt_wrong_secret() {
        let token = issue_token(SECRET, &alice(), Duration::from_secs(60)).unwrap();
        let result = JwtVerifier::new(b"another-secret").verify(&token).await;
        assert!(matches!(result, Err(AuthError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_jwt_expired() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "alice".to_string(),
            role: "customer".to_string(),
            iat: now - 120,
            exp: now - 60,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap();
        assert_eq!(
            JwtVerifier::new(SECRET).verify(&token).await,
            Err(AuthError::Expired)
        );
    }

    #[tokio::test]
    async fn test_jwt_unknown_role() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "alice".to_string(),
            role: "owner".to_string(),
            iat: now,
            exp: now + 60,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap();
        assert!(matches!(
            JwtVerifier::new(SECRET).verify(&token).await,
            Err(AuthError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_chain_from_config() {
        let config = AuthConfig {
            jwt_secret: Some(String::from_utf8(SECRET.to_vec()).unwrap()),
            tokens: vec![StaticToken {
                token: "dev-admin".to_string(),
                identity: "admin-1".to_string(),
                role: Role::Admin,
            }],
        };
        let chain = VerifierChain::from_config(&config).unwrap();
        assert_eq!(chain.len(), 2);

        assert!(chain.verify("dev-admin").await.unwrap().is_admin());

        let token = issue_token(SECRET, &alice(), Duration::from_secs(60)).unwrap();
        assert_eq!(chain.verify(&token).await.unwrap(), alice());

        assert!(chain.verify("garbage").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_chain_rejects() {
        let chain = VerifierChain::new();
        assert!(chain.is_empty());
        assert!(chain.verify("anything").await.is_err());
    }
}
