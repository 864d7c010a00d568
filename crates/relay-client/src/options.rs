//! Connection options.

use std::time::Duration;

use relay_core::backoff::ReconnectPolicy;
use relay_core::protocol::{AuthCredential, ClientMode, Hello, MAX_PROTOCOL, MIN_PROTOCOL};
use relay_settings::{AuthSettings, ClientSettings};

use crate::errors::{ClientError, Result};

/// How to reach and identify to the gateway.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// WebSocket URL, e.g. `ws://127.0.0.1:18789/ws`.
    pub url: String,
    /// Shared token.
    pub token: Option<String>,
    /// Shared password.
    pub password: Option<String>,
    /// Short client name sent in `hello`.
    pub client_name: String,
    /// Human-readable name.
    pub client_display_name: Option<String>,
    /// Client version.
    pub client_version: String,
    /// Platform string.
    pub platform: String,
    /// Kind of client.
    pub mode: ClientMode,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
    /// Stable per-install ID.
    pub instance_id: Option<String>,
    /// Lowest protocol version offered.
    pub min_protocol: u32,
    /// Highest protocol version offered.
    pub max_protocol: u32,
    /// Default per-request deadline.
    pub request_timeout: Duration,
    /// Time allowed for connect plus `helloOk`.
    pub handshake_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    url_overridden: bool,
}

impl ClientOptions {
    /// Options for `url` with no credential.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            password: None,
            client_name: env!("CARGO_PKG_NAME").to_owned(),
            client_display_name: None,
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            platform: std::env::consts::OS.to_owned(),
            mode: ClientMode::Cli,
            capabilities: Vec::new(),
            instance_id: None,
            min_protocol: MIN_PROTOCOL,
            max_protocol: MAX_PROTOCOL,
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_millis(relay_core::protocol::HANDSHAKE_TIMEOUT_MS),
            reconnect: ReconnectPolicy::default(),
            url_overridden: false,
        }
    }

    /// Options from settings, inheriting the server's configured credential.
    pub fn from_settings(client: &ClientSettings, auth: &AuthSettings) -> Self {
        let mut opts = Self::new(client.url.clone());
        opts.token.clone_from(&auth.token);
        opts.password.clone_from(&auth.password);
        opts.request_timeout = Duration::from_millis(client.request_timeout_ms);
        opts.reconnect = client.reconnect.clone();
        opts
    }

    /// Point at a different gateway. Inherited credentials are dropped: a
    /// credential configured for one gateway is never sent to another.
    #[must_use]
    pub fn with_url_override(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self.token = None;
        self.password = None;
        self.url_overridden = true;
        self
    }

    /// Use a token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Use a password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the client mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ClientMode) -> Self {
        self.mode = mode;
        self
    }

    /// Reject contradictory options.
    pub fn validate(&self) -> Result<()> {
        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(ClientError::InvalidConfig(format!(
                "url must be ws:// or wss://, got '{}'",
                self.url
            )));
        }
        if self.token.is_some() && self.password.is_some() {
            return Err(ClientError::InvalidConfig(
                "token and password are mutually exclusive".into(),
            ));
        }
        if self.url_overridden && self.token.is_none() && self.password.is_none() {
            return Err(ClientError::InvalidConfig(
                "a url override requires an explicit token or password".into(),
            ));
        }
        if self.min_protocol > self.max_protocol {
            return Err(ClientError::InvalidConfig(format!(
                "min_protocol {} exceeds max_protocol {}",
                self.min_protocol, self.max_protocol
            )));
        }
        Ok(())
    }

    /// The `hello` frame these options produce.
    pub fn hello(&self) -> Hello {
        let auth = (self.token.is_some() || self.password.is_some()).then(|| AuthCredential {
            token: self.token.clone(),
            password: self.password.clone(),
        });
        Hello {
            client_name: self.client_name.clone(),
            client_display_name: self.client_display_name.clone(),
            client_version: self.client_version.clone(),
            platform: self.platform.clone(),
            mode: self.mode,
            capabilities: self.capabilities.clone(),
            instance_id: self.instance_id.clone(),
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            auth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_options_validate() {
        let opts = ClientOptions::new("ws://127.0.0.1:1/ws");
        opts.validate().unwrap();
        assert!(opts.hello().auth.is_none());
    }

    #[test]
    fn token_and_password_conflict() {
        let opts = ClientOptions::new("ws://h/ws")
            .with_token("t")
            .with_password("p");
        assert_matches!(opts.validate(), Err(ClientError::InvalidConfig(_)));
    }

    #[test]
    fn url_override_requires_explicit_credential() {
        let auth = AuthSettings {
            token: Some("configured".into()),
            password: None,
        };
        let base = ClientOptions::from_settings(&ClientSettings::default(), &auth);
        assert_eq!(base.token.as_deref(), Some("configured"));

        let overridden = base.clone().with_url_override("ws://elsewhere:1/ws");
        assert!(overridden.token.is_none());
        assert_matches!(overridden.validate(), Err(ClientError::InvalidConfig(_)));

        let explicit = base.with_url_override("ws://elsewhere:1/ws").with_token("t2");
        explicit.validate().unwrap();
        assert_eq!(
            explicit.hello().auth.unwrap().token.as_deref(),
            Some("t2")
        );
    }

    #[test]
    fn rejects_non_websocket_url() {
        assert_matches!(
            ClientOptions::new("http://h/ws").validate(),
            Err(ClientError::InvalidConfig(_))
        );
    }
}
