//! Source of the bearer token embedded in the realtime endpoint.

use async_trait::async_trait;
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;

/// Supplies the current authentication token.
///
/// Called once per connection attempt. There is no renewal contract: a provider that
/// returns `None` makes the attempt fail and the conversation's status becomes `error`.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn token(&self) -> Option<SecretString>;
}

/// A token fixed at construction time.
#[derive(Clone, Debug)]
pub struct StaticToken(SecretString);

impl StaticToken {
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(SecretString::from(token.into()))
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }
}

/// Follows a token published by the login flow; `None` while signed out.
#[async_trait]
impl TokenProvider for watch::Receiver<Option<SecretString>> {
    async fn token(&self) -> Option<SecretString> {
        self.borrow().clone()
    }
}
