//! Configuration system for the Ferry CLI.

use ferry_core::{Identity, Multiaddr, NodeConfig, ProtocolId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ferry CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity settings
    #[serde(default)]
    pub node: NodeSection,
    /// Network settings
    #[serde(default)]
    pub network: NetworkSection,
    /// Protocol settings
    #[serde(default)]
    pub protocol: ProtocolSection,
    /// Request/echo exchange settings
    #[serde(default)]
    pub exchange: ExchangeSection,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// File holding the hex Ed25519 seed
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Address `ferry listen` binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Disable Nagle's algorithm
    #[serde(default = "default_true")]
    pub nodelay: bool,
    /// Dial timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSection {
    /// Application protocol dialed and served
    #[serde(default = "default_app_protocol")]
    pub app_protocol: String,
    /// Negotiation timeout in seconds
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,
    /// Handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSection {
    /// Seconds to wait for each response frame
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    /// Largest application frame in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level used when neither `-v` nor `RUST_LOG` is given
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_key_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".ferry/identity.key")
}

fn default_listen_addr() -> String {
    "/ip4/0.0.0.0/tcp/9999/ws".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dial_timeout() -> u64 {
    30
}

fn default_app_protocol() -> String {
    ferry_core::DEFAULT_APP_PROTOCOL.to_string()
}

fn default_negotiation_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_response_timeout() -> u64 {
    30
}

fn default_max_frame_len() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            nodelay: true,
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            app_protocol: default_app_protocol(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for ExchangeSection {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("ferry/config.toml")
    }

    /// Load `path`, or the defaults if `path` is the default location and
    /// nothing is there yet.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file is missing, or if any
    /// file cannot be read or parsed.
    pub fn resolve(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() && path == Self::default_path() {
            return Ok(Self::default());
        }
        Self::load(path).map_err(|e| anyhow::anyhow!("config {}: {}", path.display(), e))
    }

    /// Parse the listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not a valid multiaddress.
    pub fn listen_addr(&self) -> anyhow::Result<Multiaddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Parse the application protocol id
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid.
    pub fn app_protocol(&self) -> anyhow::Result<ProtocolId> {
        Ok(ProtocolId::new(self.protocol.app_protocol.clone())?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        self.app_protocol()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.network.dial_timeout_secs == 0
            || self.protocol.negotiation_timeout_secs == 0
            || self.protocol.handshake_timeout_secs == 0
            || self.exchange.response_timeout_secs == 0
        {
            anyhow::bail!("Timeouts must be at least 1 second");
        }

        if self.exchange.max_frame_len == 0 || self.exchange.max_frame_len > 16 * 1024 * 1024 {
            anyhow::bail!("Exchange frame size must be between 1 byte and 16MB");
        }

        Ok(())
    }

    /// Build the library configuration, serving the application protocol
    /// with the echo handler.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is invalid.
    pub fn to_node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::default().with_echo(self.app_protocol()?);
        config.transport.nodelay = self.network.nodelay;
        config.transport.dial_timeout = Duration::from_secs(self.network.dial_timeout_secs);
        config.negotiation.timeout = Duration::from_secs(self.protocol.negotiation_timeout_secs);
        config.security.handshake_timeout =
            Duration::from_secs(self.protocol.handshake_timeout_secs);
        config.exchange.response_timeout =
            Duration::from_secs(self.exchange.response_timeout_secs);
        config.exchange.max_frame_len = self.exchange.max_frame_len;
        config.validate()?;
        Ok(config)
    }
}

/// Load the identity seed stored at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no valid seed.
pub fn load_identity(path: &Path) -> anyhow::Result<Identity> {
    let contents = zeroize::Zeroizing::new(fs::read_to_string(path)?);
    Ok(Identity::from_hex_seed(contents.trim())?)
}

/// Write the identity seed of `identity` to `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_identity(identity: &Identity, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let seed = identity.to_hex_seed();
    fs::write(path, format!("{}\n", seed.as_str()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
