/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};

/// Source of the opaque credential presented when a connection is opened.
///
/// Consulted once per connect attempt, so a provider backed by mutable session state
/// picks up a refreshed token on the next reconnect.
pub trait TokenProvider: Send + Sync + 'static {
    fn current_token(&self) -> SecretString;
}

/// A [`TokenProvider`] that always hands out the same token.
#[derive(Clone, Debug)]
pub struct StaticToken {
    token: SecretString,
}

impl StaticToken {
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

impl TokenProvider for StaticToken {
    fn current_token(&self) -> SecretString {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_token_is_redacted_in_debug() {
        let provider = StaticToken::new("super-secret");

        assert_eq!(provider.current_token().expose_secret(), "super-secret");
        assert!(!format!("{provider:?}").contains("super-secret"));
    }
}
