//! Authenticated principal bound to a session at handshake time

use std::fmt;

/// Identity resolved once per connection by a [`crate::auth::CredentialResolver`].
///
/// Fields are private so the value cannot change after it is attached to a session.
#[derive(Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: String,
    username: String,
    email: Option<String>,
    token: String,
}

impl UserContext {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        email: Option<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            email,
            token: token.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_same_principal(&self, other: &UserContext) -> bool {
        self.user_id == other.user_id
    }
}

impl fmt::Debug for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserContext")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("token", &"[REDACTED]")
            .finish()
    }
}
