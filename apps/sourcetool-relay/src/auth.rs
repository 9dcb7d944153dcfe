//! Authenticates `/ws` upgrade requests and resolves the peer identity.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::persistence::{Persistence, PersistenceError};
use crate::router::Peer;

pub const INSTANCE_ID_HEADER: &str = "x-sourcetool-instance-id";
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials presented")]
    MissingCredentials,
    #[error("unknown api key")]
    UnknownApiKey,
    #[error("host instance id header missing or malformed")]
    InstanceId,
    #[error("browser sessions are not configured on this relay")]
    TokensDisabled,
    #[error("token verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token claim {0} is malformed")]
    Claim(&'static str),
    #[error("organization subdomain does not match the request host")]
    TenantMismatch,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub organization_id: String,
    #[serde(default)]
    pub organization_subdomain: Option<String>,
    pub exp: i64,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Peer, AuthError>;
}

/// Hosts present `Authorization: Bearer <api key>` plus their instance id;
/// browsers present an `access_token` cookie signed with the relay secret.
pub struct TokenAuthenticator {
    persistence: Arc<dyn Persistence>,
    decoding_key: Option<DecodingKey>,
}

impl TokenAuthenticator {
    pub fn new(persistence: Arc<dyn Persistence>, jwt_secret: Option<&str>) -> Self {
        Self {
            persistence,
            decoding_key: jwt_secret.map(|secret| DecodingKey::from_secret(secret.as_bytes())),
        }
    }

    async fn authenticate_host(&self, api_key: &str, headers: &HeaderMap) -> Result<Peer, AuthError> {
        let instance_id = headers
            .get(INSTANCE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or(AuthError::InstanceId)?;
        let key = {
            let mut tx = self.persistence.begin().await?;
            let key = tx.get_api_key_by_key(api_key).await?;
            key
        }
        .ok_or(AuthError::UnknownApiKey)?;
        Ok(Peer::Host {
            organization_id: key.organization_id,
            api_key_id: key.id,
            instance_id,
        })
    }

    fn authenticate_browser(&self, token: &str, headers: &HeaderMap) -> Result<Peer, AuthError> {
        let key = self.decoding_key.as_ref().ok_or(AuthError::TokensDisabled)?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let claims = jsonwebtoken::decode::<AccessTokenClaims>(token, key, &validation)?.claims;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::Claim("sub"))?;
        let organization_id = Uuid::parse_str(&claims.organization_id)
            .map_err(|_| AuthError::Claim("organization_id"))?;
        if let (Some(expected), Some(actual)) = (
            claims.organization_subdomain.as_deref(),
            request_subdomain(headers),
        ) {
            if !expected.eq_ignore_ascii_case(actual) {
                return Err(AuthError::TenantMismatch);
            }
        }
        Ok(Peer::Client {
            organization_id,
            user_id,
        })
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Peer, AuthError> {
        if let Some(api_key) = bearer_token(headers) {
            return self.authenticate_host(api_key, headers).await;
        }
        if let Some(token) = cookie(headers, ACCESS_TOKEN_COOKIE) {
            return self.authenticate_browser(token, headers);
        }
        Err(AuthError::MissingCredentials)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Leftmost label of the `Host` header when it has at least three labels.
fn request_subdomain(headers: &HeaderMap) -> Option<&str> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = host.split(':').next()?;
    let mut labels = host.split('.');
    let first = labels.next()?;
    (labels.count() >= 2).then_some(first)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{EncodingKey, Header};

    use super::*;
    use crate::model::ApiKey;
    use crate::persistence::InMemoryPersistence;

    const SECRET: &str = "relay-test-secret";

    fn token(org: Uuid, user: Uuid, subdomain: Option<&str>) -> String {
        let claims = AccessTokenClaims {
            sub: user.to_string(),
            organization_id: org.to_string(),
            organization_subdomain: subdomain.map(str::to_string),
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn bearer_key_resolves_a_host_peer() {
        let store = InMemoryPersistence::new();
        let key = ApiKey {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            name: "dev".into(),
            key: "key_abc".into(),
        };
        store.seed_api_key(key.clone()).await;
        let auth = TokenAuthenticator::new(store, Some(SECRET));
        let instance_id = Uuid::new_v4();

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer key_abc"));
        headers.insert(
            INSTANCE_ID_HEADER,
            HeaderValue::from_str(&instance_id.to_string()).unwrap(),
        );
        let peer = auth.authenticate(&headers).await.unwrap();
        assert_eq!(
            peer,
            Peer::Host {
                organization_id: key.organization_id,
                api_key_id: key.id,
                instance_id,
            }
        );

        headers.remove(INSTANCE_ID_HEADER);
        assert!(matches!(
            auth.authenticate(&headers).await,
            Err(AuthError::InstanceId)
        ));
    }

    #[tokio::test]
    async fn cookie_token_resolves_a_client_peer() {
        let auth = TokenAuthenticator::new(InMemoryPersistence::new(), Some(SECRET));
        let (org, user) = (Uuid::new_v4(), Uuid::new_v4());
        let mut headers = HeaderMap::new();
        let cookie = format!("theme=dark; access_token={}", token(org, user, Some("acme")));
        headers.insert(header::COOKIE, HeaderValue::from_str(&cookie).unwrap());
        headers.insert(header::HOST, HeaderValue::from_static("acme.sourcetool.dev:443"));

        let peer = auth.authenticate(&headers).await.unwrap();
        assert_eq!(
            peer,
            Peer::Client {
                organization_id: org,
                user_id: user,
            }
        );

        headers.insert(header::HOST, HeaderValue::from_static("globex.sourcetool.dev"));
        assert!(matches!(
            auth.authenticate(&headers).await,
            Err(AuthError::TenantMismatch)
        ));
    }

    #[tokio::test]
    async fn anonymous_and_forged_requests_are_rejected() {
        let auth = TokenAuthenticator::new(InMemoryPersistence::new(), Some(SECRET));
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()).await,
            Err(AuthError::MissingCredentials)
        ));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("access_token=not.a.jwt"),
        );
        assert!(matches!(
            auth.authenticate(&headers).await,
            Err(AuthError::Jwt(_))
        ));
    }
}
