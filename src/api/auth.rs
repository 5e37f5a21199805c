//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                      | Description                                    | Key Methods        |
// |---------------------------|------------------------------------------------|--------------------|
// | Principal                 | Authenticated caller                           |                    |
// | Authenticator             | Validates a credential                         | authenticate       |
// | TenantResolver            | Maps a principal to its restaurant scope       | resolve            |
// | StaticTokenAuthenticator  | Token table loaded from configuration          | parse, with_token  |
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use thiserror::Error;

use crate::domain::models::types::RestaurantId;

/// Authentication failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("malformed token table entry: {0}")]
    MalformedEntry(String),
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable name of the caller, used in logs
    pub subject: String,
    /// Restaurant the caller belongs to; `None` for all-tenant callers
    pub restaurant_id: Option<RestaurantId>,
}

/// Validates the credential presented on the stream endpoint.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Principal, AuthError>;
}

/// Decides which restaurant's events a principal may receive.
///
/// `None` means every restaurant.
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, principal: &Principal) -> Option<RestaurantId>;
}

/// Token table authenticator.
///
/// Configured as a comma separated list of `token=restaurant` pairs, where a
/// restaurant of `*` grants access to every restaurant:
///
/// ```
/// use order_relay::api::StaticTokenAuthenticator;
///
/// let auth = StaticTokenAuthenticator::parse("kitchen-1=r-1, ops=*").unwrap();
/// assert_eq!(auth.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Option<RestaurantId>>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, restaurant_id: Option<RestaurantId>) -> Self {
        self.tokens.insert(token.into(), restaurant_id);
        self
    }

    /// Parses a `token=restaurant,...` table. Empty entries are skipped.
    pub fn parse(table: &str) -> Result<Self, AuthError> {
        let mut auth = Self::new();
        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, restaurant) = entry
                .split_once('=')
                .ok_or_else(|| AuthError::MalformedEntry(entry.to_string()))?;
            let (token, restaurant) = (token.trim(), restaurant.trim());
            if token.is_empty() || restaurant.is_empty() {
                return Err(AuthError::MalformedEntry(entry.to_string()));
            }

            let scope = if restaurant == "*" {
                None
            } else {
                Some(RestaurantId::new(restaurant))
            };
            auth = auth.with_token(token, scope);
        }
        Ok(auth)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Principal, AuthError> {
        let restaurant_id = self
            .tokens
            .get(credential)
            .ok_or(AuthError::InvalidCredential)?;

        let subject = match restaurant_id {
            Some(restaurant) => format!("restaurant:{}", restaurant),
            None => "admin".to_string(),
        };

        Ok(Principal {
            subject,
            restaurant_id: restaurant_id.clone(),
        })
    }
}

impl TenantResolver for StaticTokenAuthenticator {
    fn resolve(&self, principal: &Principal) -> Option<RestaurantId> {
        principal.restaurant_id.clone()
    }
}

/// Extracts the token of an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
