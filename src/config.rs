use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::protocol::Version;

/// Default TCP control port.
pub const DEFAULT_PORT: u16 = 6668;
/// Default heartbeat cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Default response timeout, in seconds. `set` waits this x 2500 ms.
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 2;
/// Default discovery timeout.
pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to reach one device: identifiers, address, shared
/// secret, protocol version, and the behaviour knobs.
///
/// `id` or `ip` may start out unknown; discovery fills the gap. The local
/// key is always required and always 16 bytes.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: Option<String>,
    pub gateway_id: Option<String>,
    pub ip: Option<String>,
    pub port: u16,
    pub local_key: [u8; 16],
    pub version: Version,
    pub product_key: Option<String>,
    pub issue_get_on_connect: bool,
    pub issue_refresh_on_connect: bool,
    pub issue_refresh_on_ping: bool,
    pub null_payload_on_json_error: bool,
    pub heartbeat_interval: Duration,
    pub response_timeout_secs: u64,
    pub find_timeout: Duration,
}

#[derive(Debug)]
pub enum ConfigError {
    FileNotFound(String),
    ParseError(String),
    InvalidLocalKey(usize),
    MissingAddress,
    InvalidVersion(String),
    MissingSetArguments,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {msg}"),
            ConfigError::InvalidLocalKey(len) => {
                write!(f, "local_key must be exactly 16 bytes, got {len}")
            }
            ConfigError::MissingAddress => write!(f, "Either an id or an ip is required"),
            ConfigError::InvalidVersion(v) => write!(f, "Unsupported protocol version: {v}"),
            ConfigError::MissingSetArguments => {
                write!(f, "set requires a dps/value pair or a data map")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl DeviceConfig {
    /// Start a config from the 16-byte local key; identifiers, address and
    /// options come in through the `with_` setters.
    pub fn new(local_key: &str) -> Result<Self, ConfigError> {
        Ok(DeviceConfig {
            id: None,
            gateway_id: None,
            ip: None,
            port: DEFAULT_PORT,
            local_key: key_bytes(local_key)?,
            version: Version::default(),
            product_key: None,
            issue_get_on_connect: true,
            issue_refresh_on_connect: false,
            issue_refresh_on_ping: false,
            null_payload_on_json_error: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            response_timeout_secs: DEFAULT_RESPONSE_TIMEOUT_SECS,
            find_timeout: DEFAULT_FIND_TIMEOUT,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_gateway_id(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// The id as known to the parent gateway; equals `id` unless this is a
    /// sub-device.
    pub fn gateway_id(&self) -> &str {
        self.gateway_id
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or_default()
    }

    pub fn device_id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// A config is usable once it can address the device somehow.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_none() && self.ip.is_none() {
            return Err(ConfigError::MissingAddress);
        }
        Ok(())
    }

    /// Load a device record from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_owned()))?;
        Self::from_toml_str(&contents)
    }

    fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: DeviceConfigFile =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let version = match file.version {
            Some(text) => Version::parse(&text).ok_or(ConfigError::InvalidVersion(text.clone()))?,
            None => Version::default(),
        };

        let mut config = DeviceConfig::new(&file.local_key)?;
        config.id = file.id;
        config.gateway_id = file.gateway_id;
        config.ip = file.ip;
        config.port = file.port.unwrap_or(DEFAULT_PORT);
        config.version = version;
        config.product_key = file.product_key;
        if let Some(v) = file.issue_get_on_connect {
            config.issue_get_on_connect = v;
        }
        if let Some(v) = file.issue_refresh_on_connect {
            config.issue_refresh_on_connect = v;
        }
        if let Some(v) = file.issue_refresh_on_ping {
            config.issue_refresh_on_ping = v;
        }
        if let Some(v) = file.null_payload_on_json_error {
            config.null_payload_on_json_error = v;
        }
        if let Some(secs) = file.heartbeat_interval_secs {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.response_timeout_secs {
            config.response_timeout_secs = secs;
        }
        if let Some(secs) = file.find_timeout_secs {
            config.find_timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize)]
struct DeviceConfigFile {
    id: Option<String>,
    gateway_id: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
    local_key: String,
    version: Option<String>,
    product_key: Option<String>,
    issue_get_on_connect: Option<bool>,
    issue_refresh_on_connect: Option<bool>,
    issue_refresh_on_ping: Option<bool>,
    null_payload_on_json_error: Option<bool>,
    heartbeat_interval_secs: Option<u64>,
    response_timeout_secs: Option<u64>,
    find_timeout_secs: Option<u64>,
}

fn key_bytes(key: &str) -> Result<[u8; 16], ConfigError> {
    let bytes = key.as_bytes();
    if bytes.len() != 16 {
        return Err(ConfigError::InvalidLocalKey(bytes.len()));
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_key_is_rejected() {
        assert!(matches!(
            DeviceConfig::new("only15bytes1234"),
            Err(ConfigError::InvalidLocalKey(15))
        ));
    }

    #[test]
    fn id_or_ip_is_required() {
        let bare = DeviceConfig::new("4226aa407d5c1e2b").unwrap();
        assert!(matches!(bare.validate(), Err(ConfigError::MissingAddress)));

        let with_id = DeviceConfig::new("4226aa407d5c1e2b")
            .unwrap()
            .with_id("22325186db4a2217dc8e");
        assert!(with_id.validate().is_ok());

        let with_ip = DeviceConfig::new("4226aa407d5c1e2b")
            .unwrap()
            .with_ip("192.168.1.40");
        assert!(with_ip.validate().is_ok());
    }

    #[test]
    fn gateway_id_falls_back_to_id() {
        let config = DeviceConfig::new("4226aa407d5c1e2b")
            .unwrap()
            .with_id("22325186db4a2217dc8e");
        assert_eq!(config.gateway_id(), "22325186db4a2217dc8e");

        let config = config.with_gateway_id("gw00000000000000dead");
        assert_eq!(config.gateway_id(), "gw00000000000000dead");
    }

    #[test]
    fn toml_roundtrip_with_defaults() {
        let config = DeviceConfig::from_toml_str(
            r#"
            id = "22325186db4a2217dc8e"
            ip = "192.168.1.40"
            local_key = "4226aa407d5c1e2b"
            version = "3.3"
            "#,
        )
        .unwrap();
        assert_eq!(config.version, Version::V33);
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.issue_get_on_connect);
        assert!(!config.issue_refresh_on_connect);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let result = DeviceConfig::from_toml_str(
            r#"
            id = "22325186db4a2217dc8e"
            local_key = "4226aa407d5c1e2b"
            version = "2.0"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidVersion(_))));
    }
}
