//! Configuration management

use crate::domain::shared::value_objects::{SipProfile, SipUri};
use crate::domain::shared::{Result, UaError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix; `SIPUA__REGISTRATION__EXPIRY=600` and so on
pub const ENV_PREFIX: &str = "SIPUA";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub uri: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Digest username when it differs from the URI user
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub send_keepalive: bool,
}

/// Registration timing, all in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Expiry requested in each REGISTER
    pub expiry: u32,
    /// Base of the retry backoff
    pub short_expiry: u32,
    /// Refresh margin before expiry, and the shortest refresh delay
    pub min_expiry: u32,
    /// Cap on the retry backoff
    pub max_backoff: u32,
    pub keepalive_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            uri: "sip:alice@localhost".to_string(),
            password: String::new(),
            display_name: None,
            auth_username: None,
            send_keepalive: false,
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            expiry: 3600,
            short_expiry: 10,
            min_expiry: 60,
            max_backoff: 3600,
            keepalive_interval: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file (optional) with `SIPUA__*` environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .ok_or_else(|| UaError::Config(format!("invalid config path: {}", path.display())))?;

        let config = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Toml).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| UaError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| UaError::Config(e.to_string()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| UaError::Config(e.to_string()))
    }
}

impl ProfileConfig {
    pub fn to_profile(&self) -> Result<SipProfile> {
        let uri = SipUri::parse(&self.uri)?;
        if uri.user().is_none() {
            return Err(UaError::InvalidUri(format!("{}: profile needs a user part", self.uri)));
        }
        let mut profile = SipProfile::new(uri, self.password.clone())
            .with_send_keepalive(self.send_keepalive);
        if let Some(name) = &self.display_name {
            profile = profile.with_display_name(name.clone());
        }
        if let Some(username) = &self.auth_username {
            profile = profile.with_auth_username(username.clone());
        }
        Ok(profile)
    }
}

impl RegistrationConfig {
    /// Delay before refreshing a registration granted for `duration` seconds
    pub fn refresh_delay(&self, duration: u32) -> Duration {
        let secs = duration.saturating_sub(self.min_expiry).max(self.min_expiry);
        Duration::from_secs(u64::from(secs))
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.keepalive_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.registration.expiry, 3600);
        assert_eq!(config.registration.short_expiry, 10);
        assert_eq!(config.registration.min_expiry, 60);
        assert_eq!(config.registration.keepalive_interval, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [profile]
            uri = "sip:bob@example.com"
            password = "hunter2"
            auth_username = "bob-auth"

            [registration]
            expiry = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.registration.expiry, 600);
        assert_eq!(config.registration.min_expiry, 60);

        let profile = config.profile.to_profile().unwrap();
        assert_eq!(profile.uri().user(), Some("bob"));
        assert_eq!(profile.credentials().username, "bob-auth");
    }

    #[test]
    fn test_bad_profile_uri() {
        let profile = ProfileConfig {
            uri: "mailto:bob@example.com".to_string(),
            ..ProfileConfig::default()
        };
        assert!(matches!(profile.to_profile(), Err(UaError::InvalidUri(_))));

        let host_only = ProfileConfig {
            uri: "sip:example.com".to_string(),
            ..ProfileConfig::default()
        };
        assert!(matches!(host_only.to_profile(), Err(UaError::InvalidUri(_))));
    }

    #[test]
    fn test_refresh_delay() {
        let config = RegistrationConfig::default();
        assert_eq!(config.refresh_delay(3600), Duration::from_secs(3540));
        assert_eq!(config.refresh_delay(90), Duration::from_secs(60));
        assert_eq!(config.refresh_delay(30), Duration::from_secs(60));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/sipua.toml").unwrap();
        assert_eq!(config.registration, RegistrationConfig::default());
    }
}
