use std::fmt;

use pantry_protocol::{ConnectionStatus, UserIdentity};
use tracing::{debug, warn};

/// Bearer credential attached to the streaming connection and REST calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Returns `None` for blank tokens so callers hit the missing-credential
    /// precondition instead of sending an empty header.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthState {
    /// Connected but no acknowledgement yet. Shown as "authenticating".
    #[default]
    Pending,
    Authenticated(UserIdentity),
    Rejected(String),
}

#[derive(Debug, Default)]
pub struct AuthHandshake {
    state: AuthState,
}

impl AuthHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated(_))
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        match &self.state {
            AuthState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&str> {
        match &self.state {
            AuthState::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Interprets a `connection-status` acknowledgement.
    pub fn acknowledge(&mut self, status: &ConnectionStatus) -> &AuthState {
        self.state = match status.user.as_ref().filter(|user| user.is_valid()) {
            Some(user) => {
                debug!(target: "pantry::session", user_id = %user.id, "authenticated");
                AuthState::Authenticated(user.clone())
            }
            None => {
                let reason = status
                    .message
                    .clone()
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| "server did not confirm an authenticated user".to_string());
                warn!(target: "pantry::session", reason = %reason, "authentication rejected");
                AuthState::Rejected(reason)
            }
        };
        &self.state
    }

    /// Forgets the previous acknowledgement; every new connection must be
    /// acknowledged again.
    pub fn reset(&mut self) {
        self.state = AuthState::Pending;
    }
}
