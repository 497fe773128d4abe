//! Conversation token from the process environment.

use deskchat_core::identity::IdentityProvider;
use secrecy::SecretString;

/// Environment variable holding the conversation token.
pub const CHAT_TOKEN_ENV: &str = "DESKCHAT_CHAT_TOKEN";

/// Reads the conversation token from `DESKCHAT_CHAT_TOKEN` on every call, so
/// a rotated token is picked up without a restart.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvIdentityProvider;

impl EnvIdentityProvider {
    pub fn new() -> Self {
        Self
    }
}

impl IdentityProvider for EnvIdentityProvider {
    fn conversation_token(&self) -> Option<SecretString> {
        std::env::var(CHAT_TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .map(SecretString::from)
    }
}
