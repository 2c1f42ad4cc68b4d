//! Profile management
//!
//! A profile names one storage endpoint together with the addressing,
//! encoding and credential settings every request against it uses.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ConfigManager;
use crate::error::{Error, Result};

/// Timeout configuration for a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,

    /// Per-read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_ms: u64,

    /// Per-write-batch timeout in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    30000
}

fn default_write_timeout() -> u64 {
    30000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout(),
            read_ms: default_read_timeout(),
            write_ms: default_write_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }
}

/// A named storage endpoint and its request settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Unique name for this profile
    pub name: String,

    /// Host name or address of the endpoint
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub use_https: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Address buckets as `bucket.host` instead of `/bucket`
    #[serde(default)]
    pub virtual_hosting: bool,

    /// Percent-encode resource paths on the wire
    #[serde(default = "default_true")]
    pub url_encoding: bool,

    /// Also percent-encode `/` inside object keys
    #[serde(default)]
    pub encode_slashes: bool,

    /// Namespace delimiter for virtual directories
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Prefix of vendor headers (acl, metadata, copy source)
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,

    /// Upper bound on a framed request header or a reply header block
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,

    /// Bucket used when a locator names none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_bucket: Option<String>,

    /// Passphrase for on-the-fly encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,

    /// Idle connections kept per host; unbounded when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_per_host: Option<usize>,
}

fn default_port() -> u16 {
    80
}

fn default_true() -> bool {
    true
}

fn default_delimiter() -> String {
    "/".to_string()
}

fn default_header_prefix() -> String {
    "x-amz-".to_string()
}

fn default_max_header_size() -> usize {
    8192
}

impl Profile {
    /// Create a profile for a plain HTTP endpoint on port 80
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            use_https: false,
            access_key: None,
            secret_key: None,
            virtual_hosting: false,
            url_encoding: true,
            encode_slashes: false,
            delimiter: default_delimiter(),
            header_prefix: default_header_prefix(),
            max_header_size: default_max_header_size(),
            base_bucket: None,
            encrypt_key: None,
            timeout: None,
            max_idle_per_host: None,
        }
    }

    /// Create a profile from an endpoint URL such as `https://s3.example.com:8443`
    pub fn from_endpoint(name: impl Into<String>, endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint)?;
        let use_https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported endpoint scheme: {other}"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidArgument(format!("endpoint has no host: {endpoint}")))?;
        let mut profile = Self::new(name, host);
        profile.use_https = use_https;
        profile.port = url.port_or_known_default().unwrap_or(default_port());
        Ok(profile)
    }

    /// Set access and secret keys
    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }

    /// Get the effective timeout configuration
    pub fn timeout_config(&self) -> TimeoutConfig {
        self.timeout.clone().unwrap_or_default()
    }

    /// URL scheme of the endpoint
    pub fn scheme(&self) -> &'static str {
        if self.use_https { "https" } else { "http" }
    }
}

/// Manager for profile operations
pub struct ProfileManager {
    config_manager: ConfigManager,
}

impl ProfileManager {
    pub fn with_config_manager(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }

    /// Create a ProfileManager using the default config location
    pub fn new() -> Result<Self> {
        Ok(Self {
            config_manager: ConfigManager::new()?,
        })
    }

    pub fn list(&self) -> Result<Vec<Profile>> {
        Ok(self.config_manager.load()?.profiles)
    }

    pub fn get(&self, name: &str) -> Result<Profile> {
        self.config_manager
            .load()?
            .profiles
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(format!("profile {name}")))
    }

    /// Get the configured default profile
    pub fn get_default(&self) -> Result<Profile> {
        let config = self.config_manager.load()?;
        let name = config
            .default_profile
            .ok_or_else(|| Error::Config("no default profile configured".into()))?;
        config
            .profiles
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(format!("profile {name}")))
    }

    /// Add or replace a profile
    pub fn set(&self, profile: Profile) -> Result<()> {
        let mut config = self.config_manager.load()?;
        config.profiles.retain(|p| p.name != profile.name);
        config.profiles.push(profile);
        self.config_manager.save(&config)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut config = self.config_manager.load()?;
        let original_len = config.profiles.len();

        config.profiles.retain(|p| p.name != name);

        if config.profiles.len() == original_len {
            return Err(Error::NotFound(format!("profile {name}")));
        }
        if config.default_profile.as_deref() == Some(name) {
            config.default_profile = None;
        }

        self.config_manager.save(&config)
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        let config = self.config_manager.load()?;
        Ok(config.profiles.iter().any(|p| p.name == name))
    }
}
