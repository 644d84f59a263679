//! Server configuration loader
//!
//! Reads `RDP_*` keys from the process environment or from an env-style
//! `KEY=VALUE` file. Every key is optional; missing keys keep their defaults.

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::capability::Capability;

/// Default listen port (standard RDP)
pub const DEFAULT_PORT: u16 = 3389;

/// Default maximum payload size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Encryption level label advertised by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionLevel {
    Low,
    ClientCompatible,
    High,
    Fips,
}

impl EncryptionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::ClientCompatible => "client_compatible",
            Self::High => "high",
            Self::Fips => "fips",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "client_compatible" | "client-compatible" => Some(Self::ClientCompatible),
            "high" => Some(Self::High),
            "fips" => Some(Self::Fips),
            _ => None,
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Receive timeout during negotiation and authentication
    pub handshake_timeout: Duration,
    /// Largest payload accepted in a single packet
    pub buffer_size: usize,
    /// Encryption level label
    pub encryption_level: EncryptionLevel,
    /// Whether channels are marked compression-enabled
    pub compression_enabled: bool,
    /// Offer the clipboard capability
    pub clipboard_enabled: bool,
    /// Offer the audio capability
    pub audio_enabled: bool,
    /// Offer the printer capability
    pub printer_enabled: bool,
    /// Idle time after which an active session is torn down
    pub idle_timeout: Duration,
    /// Period of server-initiated heartbeats
    pub heartbeat_interval: Duration,
    /// Concurrent session cap (0 = unlimited)
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            handshake_timeout: Duration::from_secs(30),
            buffer_size: DEFAULT_BUFFER_SIZE,
            encryption_level: EncryptionLevel::High,
            compression_enabled: true,
            clipboard_enabled: true,
            audio_enabled: true,
            printer_enabled: false,
            idle_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            max_sessions: 5,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_pairs(utf8_vars(std::env::vars_os()))
    }

    /// Load configuration from an env-style file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse env-style file content
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut pairs = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'KEY=VALUE', got: {}", line),
                });
            };

            pairs.push((key.trim().to_string(), unquote(value.trim()).to_string()));
        }

        Self::from_pairs(pairs)
    }

    /// Build a configuration from key/value pairs, ignoring non-`RDP_` keys
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in pairs {
            let key = key.as_ref();
            let value = value.as_ref().trim();

            match key {
                "RDP_HOST" => config.host = value.to_string(),
                "RDP_PORT" => config.port = parse_number(key, value)?,
                "RDP_TIMEOUT" => config.handshake_timeout = parse_seconds(key, value)?,
                "RDP_BUFFER_SIZE" => config.buffer_size = parse_number(key, value)?,
                "RDP_ENCRYPTION_LEVEL" => {
                    config.encryption_level =
                        EncryptionLevel::parse(value).ok_or_else(|| invalid(key, value))?;
                }
                "RDP_COMPRESSION_ENABLED" => config.compression_enabled = parse_flag(key, value)?,
                "RDP_CLIPBOARD_ENABLED" => config.clipboard_enabled = parse_flag(key, value)?,
                "RDP_AUDIO_ENABLED" => config.audio_enabled = parse_flag(key, value)?,
                "RDP_PRINTER_ENABLED" => config.printer_enabled = parse_flag(key, value)?,
                "RDP_IDLE_TIMEOUT" => config.idle_timeout = parse_seconds(key, value)?,
                "RDP_HEARTBEAT_INTERVAL" => config.heartbeat_interval = parse_seconds(key, value)?,
                "RDP_MAX_SESSIONS" => config.max_sessions = parse_number(key, value)?,
                other if other.starts_with("RDP_") => {
                    // Unknown key, ignore (forward compatibility)
                    tracing::debug!("Unknown config key: {}", other);
                }
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // The length field is 16 bits and includes the 8-byte header
        let max_payload = u16::MAX as usize - crate::protocol::messages::HEADER_SIZE;
        if self.buffer_size == 0 || self.buffer_size > max_payload {
            return Err(invalid("RDP_BUFFER_SIZE", &self.buffer_size.to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("RDP_HEARTBEAT_INTERVAL", "0"));
        }
        Ok(())
    }

    /// Listen address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Capabilities this server is willing to negotiate
    pub fn supported_capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::BitmapCache, Capability::Compression];
        if self.clipboard_enabled {
            caps.push(Capability::Clipboard);
        }
        if self.audio_enabled {
            caps.push(Capability::Audio);
        }
        if self.printer_enabled {
            caps.push(Capability::Printer);
        }
        caps
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(key, value).map(Duration::from_secs)
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

/// Environment entries that are valid UTF-8; anything else cannot be an `RDP_*` key
fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TEST_CONFIG: &str = r#"
# RDP host node
RDP_HOST=127.0.0.1
RDP_PORT = 13389
export RDP_ENCRYPTION_LEVEL="fips"
RDP_AUDIO_ENABLED=false
RDP_PRINTER_ENABLED='true'
RDP_IDLE_TIMEOUT=120
RDP_UNKNOWN_KEY=whatever
"#;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3389);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.encryption_level, EncryptionLevel::High);
        assert!(config.clipboard_enabled);
        assert!(!config.printer_enabled);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_config() {
        let config = ServerConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:13389");
        assert_eq!(config.encryption_level, EncryptionLevel::Fips);
        assert!(!config.audio_enabled);
        assert!(config.printer_enabled);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        // untouched keys keep defaults
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_supported_capabilities_follow_flags() {
        let config = ServerConfig::parse(TEST_CONFIG).unwrap();
        let caps = config.supported_capabilities();

        assert!(caps.contains(&Capability::BitmapCache));
        assert!(caps.contains(&Capability::Compression));
        assert!(caps.contains(&Capability::Clipboard));
        assert!(caps.contains(&Capability::Printer));
        assert!(!caps.contains(&Capability::Audio));
    }

    #[test]
    fn test_invalid_values() {
        assert!(ServerConfig::from_pairs([("RDP_PORT", "not-a-port")]).is_err());
        assert!(ServerConfig::from_pairs([("RDP_AUDIO_ENABLED", "maybe")]).is_err());
        assert!(ServerConfig::from_pairs([("RDP_ENCRYPTION_LEVEL", "ultra")]).is_err());
        assert!(ServerConfig::from_pairs([("RDP_BUFFER_SIZE", "70000")]).is_err());
        assert!(ServerConfig::from_pairs([("RDP_HEARTBEAT_INTERVAL", "0")]).is_err());
    }

    #[test]
    fn test_missing_separator() {
        let result = ServerConfig::parse("RDP_PORT 3389\n");
        assert!(matches!(
            result,
            Err(ConfigError::ParseError { line: 1, .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TEST_CONFIG.as_bytes()).unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 13389);
    }

    #[test]
    fn test_file_not_found() {
        let result = ServerConfig::from_file("/nonexistent/rdphost.env");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_environment_is_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let vars = vec![
            (OsString::from("LANG_RAW"), OsString::from_vec(vec![0xff, 0xfe])),
            (OsString::from_vec(vec![0xc3, 0x28]), OsString::from("x")),
            (OsString::from("RDP_PORT"), OsString::from("4000")),
        ];

        let config = ServerConfig::from_pairs(utf8_vars(vars)).unwrap();
        assert_eq!(config.port, 4000);
    }
}
