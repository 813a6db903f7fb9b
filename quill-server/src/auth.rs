//! Token validation behind the WebSocket auth gate.
//!
//! Validation itself is an external concern; the server only needs a yes/no
//! answer for the token presented in the first `auth` message.

pub trait TokenValidator: Send + Sync + 'static {
    fn validate(&self, token: &str) -> bool;
}

/// Compares against a single statically configured token.
pub struct StaticTokenValidator {
    token: Option<String>,
}

impl StaticTokenValidator {
    /// With `None` every token is rejected.
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> bool {
        self.token.as_deref().map(|t| t == token).unwrap_or(false)
    }
}
