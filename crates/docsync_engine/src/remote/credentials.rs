//! Credentials collaborator.

use crate::error::EngineResult;
use docsync_model::User;

/// An auth token and the identity it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Opaque token value passed to the transport.
    pub value: String,
    /// The identity the token authenticates.
    pub user: User,
}

impl Token {
    /// Creates a token.
    pub fn new(value: impl Into<String>, user: User) -> Self {
        Self {
            value: value.into(),
            user,
        }
    }
}

/// Supplies tokens for stream authentication.
///
/// Identity changes are delivered separately through
/// `SyncEngine::handle_credential_change`.
pub trait CredentialsProvider: Send + Sync {
    /// Returns the current token, or `None` when unauthenticated.
    fn get_token(&self) -> EngineResult<Option<Token>>;

    /// Forces the next [`get_token`](Self::get_token) to fetch a fresh token.
    fn invalidate_token(&self);
}

/// Provider for clients that never authenticate.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCredentialsProvider;

impl CredentialsProvider for EmptyCredentialsProvider {
    fn get_token(&self) -> EngineResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_provider_has_no_token() {
        let provider = EmptyCredentialsProvider;
        provider.invalidate_token();
        assert_eq!(provider.get_token().unwrap(), None);
    }
}
