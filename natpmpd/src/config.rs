//! Configuration for the daemon.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use natpmpd_proto::SERVER_PORT;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

/// Daemon configuration.
///
/// Usually loaded from a TOML file with [`Config::load`]:
///
/// ```toml
/// interface = "eth0"
/// listen = ["192.168.1.1:5351", "[fd00::1]:0"]
///
/// [firewall]
/// table = "natpmpd"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Interface whose first IPv4 address is the external address.
    pub interface: String,
    /// Addresses to listen for requests on.
    ///
    /// A port of `0` is replaced by [`SERVER_PORT`].
    #[serde(default)]
    pub listen: Vec<SocketAddr>,
    /// Log at debug level.
    #[serde(default)]
    pub verbose: bool,
    /// Where redirect rules are written.
    #[serde(default)]
    pub firewall: FirewallConfig,
}

/// The nftables location redirect rules are written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirewallConfig {
    /// Table family, `ip` or `inet`.
    pub family: String,
    /// Table owned by the daemon.
    pub table: String,
    /// Nat chain inside [`Self::table`] holding the redirects.
    pub chain: String,
    /// The `nft` binary.
    pub nft_path: PathBuf,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            family: "ip".to_string(),
            table: "natpmpd".to_string(),
            chain: "prerouting".to_string(),
            nft_path: PathBuf::from("nft"),
        }
    }
}

/// Errors loading a [`Config`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("unable to read config {}", path.display()))]
    Read {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("config must be valid toml"))]
    Parse { source: toml::de::Error },
    #[snafu(display("invalid config: {reason}"))]
    Invalid { reason: String },
}

impl Config {
    /// Load and validate the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        s.parse()
    }

    fn validate(mut self) -> Result<Self, ConfigError> {
        if self.interface.trim().is_empty() {
            return Err(InvalidSnafu {
                reason: "interface must not be empty",
            }
            .build());
        }
        if self.listen.is_empty() {
            return Err(InvalidSnafu {
                reason: "at least one listen address is required",
            }
            .build());
        }
        for addr in self.listen.iter_mut() {
            if addr.port() == 0 {
                addr.set_port(SERVER_PORT);
            }
        }
        if !matches!(self.firewall.family.as_str(), "ip" | "inet") {
            return Err(InvalidSnafu {
                reason: format!("unsupported firewall family {:?}", self.firewall.family),
            }
            .build());
        }
        Ok(self)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s).context(ParseSnafu)?;
        config.validate()
    }
}
