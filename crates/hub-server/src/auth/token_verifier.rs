//! Token verification, delegated to an injected `TokenVerifier` so token
//! minting and refresh-token validation can live behind an external
//! identity provider. `JwtTokenVerifier` is the concrete stand-in used by
//! tests and the default binary.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hub_shared::HubError;

#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub principal_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, HubError>;
    async fn refresh(&self, refresh_token: &str) -> Result<(String, VerifiedToken), HubError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
    refresh: bool,
}

#[derive(Clone)]
pub struct JwtTokenVerifier {
    secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtTokenVerifier {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            access_ttl: Duration::hours(1),
            refresh_ttl: Duration::days(30),
        }
    }

    fn encode(&self, principal_id: Uuid, ttl: Duration, refresh: bool) -> Result<(String, DateTime<Utc>), HubError> {
        let now = Utc::now();
        let exp = now + ttl;
        let claims = Claims {
            sub: principal_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            refresh,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(self.secret.as_ref()))
            .map_err(|e| HubError::Internal(e.to_string()))?;
        Ok((token, exp))
    }

    #[must_use]
    pub fn issue(&self, principal_id: Uuid) -> Result<VerifiedToken, HubError> {
        let (access, expires_at) = self.encode(principal_id, self.access_ttl, false)?;
        let (refresh, _) = self.encode(principal_id, self.refresh_ttl, true)?;
        let _ = access;
        Ok(VerifiedToken { principal_id, expires_at, refresh_token: Some(refresh) })
    }

    fn decode(&self, token: &str) -> Result<Claims, HubError> {
        decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_ref()), &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| HubError::Unauthorized)
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, HubError> {
        let claims = self.decode(token)?;
        let principal_id = Uuid::parse_str(&claims.sub).map_err(|_| HubError::Unauthorized)?;
        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(HubError::Unauthorized)?;
        Ok(VerifiedToken { principal_id, expires_at, refresh_token: None })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<(String, VerifiedToken), HubError> {
        let claims = self.decode(refresh_token)?;
        if !claims.refresh {
            return Err(HubError::InvalidRefreshToken);
        }
        let principal_id = Uuid::parse_str(&claims.sub).map_err(|_| HubError::InvalidRefreshToken)?;
        let (access, expires_at) = self.encode(principal_id, self.access_ttl, false)?;
        Ok((access, VerifiedToken { principal_id, expires_at, refresh_token: Some(refresh_token.to_string()) }))
    }
}
