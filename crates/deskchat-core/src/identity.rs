//! Conversation token supply.
//!
//! The conversation token authorises every call to the remote chat service.
//! It is issued elsewhere; the coordinator and the queue only read it through
//! an injected `IdentityProvider`, fetching it fresh for each call so a
//! rotated token takes effect without restarting anything.

use secrecy::{ExposeSecret, SecretString};

/// Supplies the conversation token used to address the remote service.
pub trait IdentityProvider: Send + Sync {
    /// The current conversation token, or `None` when none is configured.
    fn conversation_token(&self) -> Option<SecretString>;
}

/// A provider that always returns the same token.
pub struct StaticIdentityProvider {
    token: SecretString,
}

impl StaticIdentityProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn conversation_token(&self) -> Option<SecretString> {
        Some(SecretString::from(self.token.expose_secret().to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_returns_token() {
        let provider = StaticIdentityProvider::new("chat-token");
        let token = provider.conversation_token().unwrap();
        assert_eq!(token.expose_secret(), "chat-token");
    }
}
