//! Authentication collaborator: resolves the caller of the upgrade endpoint to a user id.
//! Accepts a `token` query parameter or the `session_token` cookie.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::UserId;

pub const SESSION_COOKIE: &str = "session_token";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials supplied")]
    MissingCredentials,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token subject is not a user id")]
    InvalidSubject,
}

#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub token: Option<String>,
    pub session_cookie: Option<String>,
}

impl Credentials {
    pub fn from_request(token: Option<String>, headers: &HeaderMap) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
            session_cookie: session_cookie(headers),
        }
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// HS256 tokens whose `sub` is the numeric user id. Session cookies carry the same token.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthError> {
        let token = credentials
            .token
            .as_deref()
            .or(credentials.session_cookie.as_deref())
            .ok_or(AuthError::MissingCredentials)?;
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        match data.claims.sub.parse::<UserId>() {
            Ok(uid) if uid > 0 => Ok(uid),
            _ => Err(AuthError::InvalidSubject),
        }
    }
}
