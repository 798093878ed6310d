//! Caller authentication.

use std::collections::HashMap;
use std::fmt;

use subtle::ConstantTimeEq;

use crate::error::SandboxError;
use crate::workspace::Principal;

/// Turns a presented credential into a [`Principal`].
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Authenticate a bearer token.
    fn authenticate(&self, token: &str) -> Result<Principal, SandboxError>;
}

/// Static bearer tokens mapped to principal ids.
#[derive(Clone, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl TokenAuthenticator {
    /// Accept the given `token → principal id` pairs.
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Add one token.
    pub fn with_token(mut self, token: impl Into<String>, principal: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), principal.into());
        self
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Principal, SandboxError> {
        if token.is_empty() {
            return Err(SandboxError::Unauthorized);
        }
        // Compare against every token so timing does not reveal which matched.
        let mut found = None;
        for (known, principal) in &self.tokens {
            if bool::from(known.as_bytes().ct_eq(token.as_bytes())) {
                found = Some(principal);
            }
        }
        found
            .map(Principal::new)
            .ok_or(SandboxError::Unauthorized)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_token_maps_to_principal() {
        let auth = TokenAuthenticator::default().with_token("s3cret", "alice");
        assert_eq!(auth.authenticate("s3cret").ok(), Some(Principal::new("alice")));
        assert!(matches!(
            auth.authenticate("s3cres"),
            Err(SandboxError::Unauthorized)
        ));
        assert!(matches!(auth.authenticate(""), Err(SandboxError::Unauthorized)));
    }

    #[test]
    fn test_every_registered_token_is_checked() {
        let auth = TokenAuthenticator::default()
            .with_token("alpha-token", "alice")
            .with_token("beta-token", "bob");
        assert_eq!(auth.authenticate("beta-token").ok(), Some(Principal::new("bob")));
        assert_eq!(auth.authenticate("alpha-token").ok(), Some(Principal::new("alice")));
        assert!(auth.authenticate("alpha-toke").is_err());
        assert!(auth.authenticate("alpha-token-and-more").is_err());
    }

    #[test]
    fn test_bearer_header() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
