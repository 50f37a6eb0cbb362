// src/channel/credentials.rs

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::error::ChannelError;
use crate::platform::store::{keys, ConfigStore, StorePaths, StoreError};

/// Credentials the guest service publishes in the configuration store
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Basic auth user
    pub username: String,

    /// Basic auth password
    pub password: SecretString,

    /// Carried for the guest service; not used to verify plain HTTP
    pub cert: String,

    /// Base URL of the record endpoint, without a trailing slash
    pub url: String,
}

impl Credentials {
    /// Reads the current credentials below `paths`
    pub async fn read(store: &dyn ConfigStore, paths: &StorePaths) -> Result<Self, ChannelError> {
        let username = store.read(&paths.key(keys::USERNAME)).await?;
        let password = store.read(&paths.key(keys::PASSWORD)).await?;
        let cert = match store.read(&paths.key(keys::CERT)).await {
            Ok(cert) => cert,
            Err(StoreError::NotFound(_)) => String::new(),
            Err(e) => return Err(e.into()),
        };
        let daemon_ip = store.read(&paths.key(keys::DAEMON_IP)).await?;

        let url = endpoint_url(&daemon_ip);
        debug!(username = %username, url = %url, "read guest service credentials");

        Ok(Self {
            username,
            password: SecretString::new(password),
            cert,
            url,
        })
    }

    /// Value of the `Authorization` header
    pub fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password.expose_secret());
        format!("Basic {}", STANDARD.encode(raw))
    }
}

/// Builds the record endpoint from the published daemon address
pub fn endpoint_url(daemon_ip: &str) -> String {
    let base = daemon_ip.trim().trim_matches('/');
    if base.contains("://") {
        format!("{}/kvp", base)
    } else {
        format!("http://{}/kvp", base)
    }
}
