//! Authentication backends for the order-400 middleware.
//!
//! A backend inspects the scope and either produces an [`AuthRecord`]
//! (identity, tags, backend name), passes (no credentials presented), or
//! rejects (credentials presented but invalid).

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::ServerError;
use crate::transport::{AuthRecord, Scope};

/// Pluggable credential validator.
pub trait AuthBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when no credentials of this backend's kind are present;
    /// `Err(NotAuthenticated)` when they are present but invalid.
    fn authenticate(&self, scope: &Scope) -> Result<Option<AuthRecord>, ServerError>;
}

/// Claims carried by Portico-minted tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub exp: u64,
}

/// HMAC JWT backend reading `Authorization: Bearer <token>`.
///
/// Token issuance lives elsewhere; this backend only validates and maps
/// the `tags` claim onto the request's auth tags.
pub struct JwtAuthBackend {
    decoding: jsonwebtoken::DecodingKey,
    encoding: jsonwebtoken::EncodingKey,
    validation: jsonwebtoken::Validation,
}

impl JwtAuthBackend {
    pub fn new(secret: &[u8]) -> JwtAuthBackend {
        JwtAuthBackend {
            decoding: jsonwebtoken::DecodingKey::from_secret(secret),
            encoding: jsonwebtoken::EncodingKey::from_secret(secret),
            validation: jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
        }
    }

    /// Backend from `auth.jwt_secret` config, when configured.
    pub fn from_config(config: &Config) -> Option<JwtAuthBackend> {
        let secret: String = config.get("auth.jwt_secret").ok()?;
        Some(JwtAuthBackend::new(secret.as_bytes()))
    }

    /// Mint a token for the `_server/_create_jwt` endpoint.
    pub fn mint(&self, sub: &str, tags: &[String], ttl_secs: u64) -> Result<String, ServerError> {
        let claims = TokenClaims {
            sub: sub.to_string(),
            tags: tags.to_vec(),
            exp: (chrono::Utc::now().timestamp() as u64).saturating_add(ttl_secs),
        };
        jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &self.encoding)
            .map_err(|e| ServerError::Internal(format!("token mint: {e}")))
    }
}

impl AuthBackend for JwtAuthBackend {
    fn name(&self) -> &'static str {
        "jwt"
    }

    fn authenticate(&self, scope: &Scope) -> Result<Option<AuthRecord>, ServerError> {
        let Some(header) = scope
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(None);
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return Ok(None);
        };

        let data =
            jsonwebtoken::decode::<TokenClaims>(token, &self.decoding, &self.validation)
                .map_err(|e| ServerError::NotAuthenticated(format!("invalid token: {e}")))?;

        Ok(Some(AuthRecord {
            identity: data.claims.sub,
            tags: data.claims.tags,
            backend: "jwt".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn scope_with_token(token: &str) -> Scope {
        let mut scope = Scope::http(Method::GET, "/x");
        scope.headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        scope
    }

    #[test]
    fn mint_and_validate_round_trip() {
        let backend = JwtAuthBackend::new(b"test-secret");
        let token = backend
            .mint("user-1", &["admin".to_string(), "user".to_string()], 60)
            .unwrap();
        let record = backend
            .authenticate(&scope_with_token(&token))
            .unwrap()
            .unwrap();
        assert_eq!(record.identity, "user-1");
        assert_eq!(record.tags, vec!["admin", "user"]);
        assert_eq!(record.backend, "jwt");
    }

    #[test]
    fn absent_credentials_pass_through() {
        let backend = JwtAuthBackend::new(b"test-secret");
        let scope = Scope::http(Method::GET, "/x");
        assert!(backend.authenticate(&scope).unwrap().is_none());
    }

    #[test]
    fn invalid_token_is_rejected() {
        let backend = JwtAuthBackend::new(b"test-secret");
        assert!(matches!(
            backend.authenticate(&scope_with_token("garbage")),
            Err(ServerError::NotAuthenticated(_))
        ));

        let other = JwtAuthBackend::new(b"other-secret");
        let token = other.mint("user-1", &[], 60).unwrap();
        assert!(matches!(
            backend.authenticate(&scope_with_token(&token)),
            Err(ServerError::NotAuthenticated(_))
        ));
    }
}
