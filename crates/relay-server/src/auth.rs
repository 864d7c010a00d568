//! Handshake authentication.
//!
//! The server only enforces the decision; an [`Authenticator`] makes it.

use relay_core::protocol::Hello;
use relay_settings::AuthSettings;
use subtle::ConstantTimeEq;

/// Why a `hello` was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The server requires a credential and none was sent.
    #[error("credential required")]
    MissingCredential,
    /// The token did not match.
    #[error("invalid token")]
    InvalidToken,
    /// The password did not match.
    #[error("invalid password")]
    InvalidPassword,
    /// Both a token and a password were sent.
    #[error("token and password are mutually exclusive")]
    AmbiguousCredential,
}

/// Decides whether a client may connect.
#[cfg_attr(test, mockall::automock)]
pub trait Authenticator: Send + Sync {
    /// Accept or refuse a handshake.
    fn authenticate(&self, hello: &Hello) -> Result<(), AuthError>;
}

/// Compares the presented token or password against the configured secret.
/// With nothing configured, every client is accepted.
#[derive(Clone, Debug, Default)]
pub struct SharedSecretAuth {
    token: Option<String>,
    password: Option<String>,
}

impl SharedSecretAuth {
    /// Build from settings.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self {
            token: settings.token.clone(),
            password: settings.password.clone(),
        }
    }

    /// Whether any credential is required.
    pub fn is_enabled(&self) -> bool {
        self.token.is_some() || self.password.is_some()
    }
}

fn secret_eq(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

impl Authenticator for SharedSecretAuth {
    fn authenticate(&self, hello: &Hello) -> Result<(), AuthError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let credential = hello.auth.as_ref();
        let token = credential.and_then(|c| c.token.as_deref());
        let password = credential.and_then(|c| c.password.as_deref());

        match (token, password) {
            (Some(_), Some(_)) => Err(AuthError::AmbiguousCredential),
            (None, None) => Err(AuthError::MissingCredential),
            (Some(token), None) => match &self.token {
                Some(expected) if secret_eq(token, expected) => Ok(()),
                _ => Err(AuthError::InvalidToken),
            },
            (None, Some(password)) => match &self.password {
                Some(expected) if secret_eq(password, expected) => Ok(()),
                _ => Err(AuthError::InvalidPassword),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::protocol::{AuthCredential, ClientMode};

    fn hello(token: Option<&str>, password: Option<&str>) -> Hello {
        Hello {
            client_name: "test".into(),
            client_display_name: None,
            client_version: "0.0.0".into(),
            platform: "test".into(),
            mode: ClientMode::Cli,
            capabilities: vec![],
            instance_id: None,
            min_protocol: 1,
            max_protocol: 3,
            auth: Some(AuthCredential {
                token: token.map(Into::into),
                password: password.map(Into::into),
            }),
        }
    }

    fn token_auth() -> SharedSecretAuth {
        SharedSecretAuth::from_settings(&AuthSettings {
            token: Some("s3cret".into()),
            password: None,
        })
    }

    #[test]
    fn open_server_accepts_anyone() {
        let auth = SharedSecretAuth::default();
        assert!(!auth.is_enabled());
        assert!(auth.authenticate(&hello(None, None)).is_ok());
        assert!(auth.authenticate(&hello(Some("whatever"), None)).is_ok());
    }

    #[test]
    fn token_checked() {
        let auth = token_auth();
        assert!(auth.authenticate(&hello(Some("s3cret"), None)).is_ok());
        assert_eq!(
            auth.authenticate(&hello(Some("s3cre"), None)),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            auth.authenticate(&hello(None, None)),
            Err(AuthError::MissingCredential)
        );
    }

    #[test]
    fn password_against_token_server_fails() {
        assert_eq!(
            token_auth().authenticate(&hello(None, Some("s3cret"))),
            Err(AuthError::InvalidPassword)
        );
    }

    #[test]
    fn both_credentials_rejected() {
        assert_eq!(
            token_auth().authenticate(&hello(Some("s3cret"), Some("x"))),
            Err(AuthError::AmbiguousCredential)
        );
    }

    #[test]
    fn missing_auth_block() {
        let mut h = hello(None, None);
        h.auth = None;
        assert_eq!(
            token_auth().authenticate(&h),
            Err(AuthError::MissingCredential)
        );
    }
}
