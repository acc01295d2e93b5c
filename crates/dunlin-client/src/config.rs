//! Client configuration

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dunlin_core::error::{DcError, Result};
use dunlin_core::types::{Dialect, EncryptionMode};
use dunlin_core::DEFAULT_HUB_PORT;

/// Parsed hub target: dialect and TLS selected by the URL scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubUrl {
    pub dialect: Dialect,
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl FromStr for HubUrl {
    type Err = DcError;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| DcError::ConfigInvalid(format!("hub url has no scheme: {}", s)))?;
        let (dialect, tls) = match scheme {
            "nmdc" | "dchub" => (Dialect::Nmdc, false),
            "nmdcs" => (Dialect::Nmdc, true),
            "adc" => (Dialect::Adc, false),
            "adcs" => (Dialect::Adc, true),
            other => {
                return Err(DcError::ConfigInvalid(format!(
                    "unsupported hub scheme: {}",
                    other
                )))
            }
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse()
                    .map_err(|_| DcError::ConfigInvalid(format!("bad hub port: {}", p)))?,
            ),
            None => (rest.to_string(), DEFAULT_HUB_PORT),
        };
        if host.is_empty() {
            return Err(DcError::ConfigInvalid(format!("hub url has no host: {}", s)));
        }
        Ok(HubUrl {
            dialect,
            tls,
            host,
            port,
        })
    }
}

/// Verbosity of the client's tracing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Directive for a `tracing_subscriber::EnvFilter`; the embedder owns
    /// the subscriber, one per process, and scopes this client with it.
    pub fn env_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

fn default_upload_slots() -> u32 {
    3
}

fn default_read_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_invite_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_tth_max_leaves() -> usize {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection target, `nmdc://`, `nmdcs://`, `adc://` or `adcs://`.
    pub hub_url: String,

    /// Displayed identity, 1 to 35 bytes without whitespace.
    pub nick: String,

    /// Enables authenticated registration when the hub challenges.
    #[serde(default)]
    pub password: String,

    /// Address advertised to peers; autodetected from the hub socket when
    /// absent.
    #[serde(default)]
    pub ip: Option<IpAddr>,

    /// Listening ports; required unless `passive`.
    #[serde(default)]
    pub tcp_port: u16,
    #[serde(default)]
    pub udp_port: u16,
    /// TLS listening port; required when active and encryption is not
    /// disabled.
    #[serde(default)]
    pub tcp_tls_port: u16,

    /// Do not listen; every peer connection is hub-mediated.
    #[serde(default)]
    pub passive: bool,

    #[serde(default)]
    pub encryption: EncryptionMode,

    /// Never offer or accept on-the-wire zlib for transfers.
    #[serde(default)]
    pub disable_compression: bool,

    /// When set, the hub is only dialed by an explicit `hub_connect()`.
    #[serde(default)]
    pub manual_hub_connect: bool,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default = "default_upload_slots")]
    pub upload_slots: u32,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_invite_timeout")]
    pub invite_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Cap on serialized hash-tree leaves per shared file.
    #[serde(default = "default_tth_max_leaves")]
    pub tth_max_leaves: usize,
}

impl ClientConfig {
    /// Minimal configuration for a passive client.
    pub fn new(hub_url: impl Into<String>, nick: impl Into<String>) -> Self {
        ClientConfig {
            hub_url: hub_url.into(),
            nick: nick.into(),
            password: String::new(),
            ip: None,
            tcp_port: 0,
            udp_port: 0,
            tcp_tls_port: 0,
            passive: false,
            encryption: EncryptionMode::default(),
            disable_compression: false,
            manual_hub_connect: false,
            log_level: LogLevel::default(),
            upload_slots: default_upload_slots(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            invite_timeout_secs: default_invite_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            tth_max_leaves: default_tth_max_leaves(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| DcError::ConfigInvalid(e.to_string()))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Check the whole configuration and parse the hub target.
    pub fn validate(&self) -> Result<HubUrl> {
        let url: HubUrl = self.hub_url.parse()?;

        if self.nick.is_empty() || self.nick.len() > 35 {
            return Err(DcError::ConfigInvalid(
                "nick must be 1 to 35 bytes".into(),
            ));
        }
        if self.nick.chars().any(|c| c.is_whitespace()) {
            return Err(DcError::ConfigInvalid(
                "nick must not contain whitespace".into(),
            ));
        }
        if self.nick.contains('$') || self.nick.contains('|') {
            return Err(DcError::ConfigInvalid(
                "nick must not contain protocol delimiters".into(),
            ));
        }

        if !self.passive {
            if self.tcp_port == 0 || self.udp_port == 0 {
                return Err(DcError::ConfigInvalid(
                    "active mode requires tcp_port and udp_port".into(),
                ));
            }
            if self.encryption != EncryptionMode::DisableEncryption && self.tcp_tls_port == 0 {
                return Err(DcError::ConfigInvalid(
                    "active mode with encryption requires tcp_tls_port".into(),
                ));
            }
            if self.tcp_tls_port != 0 && self.tcp_tls_port == self.tcp_port {
                return Err(DcError::ConfigInvalid(
                    "tcp_tls_port must differ from tcp_port".into(),
                ));
            }
        }

        if self.upload_slots == 0 {
            return Err(DcError::ConfigInvalid(
                "upload_slots must be at least 1".into(),
            ));
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_url_schemes() {
        let u: HubUrl = "nmdc://example.org:4111".parse().unwrap();
        assert_eq!(u.dialect, Dialect::Nmdc);
        assert!(!u.tls);
        assert_eq!(u.port, 4111);

        let u: HubUrl = "adcs://example.org".parse().unwrap();
        assert_eq!(u.dialect, Dialect::Adc);
        assert!(u.tls);
        assert_eq!(u.port, DEFAULT_HUB_PORT);

        assert!("http://example.org".parse::<HubUrl>().is_err());
        assert!("example.org:411".parse::<HubUrl>().is_err());
    }

    #[test]
    fn nick_rules() {
        let mut conf = ClientConfig::new("nmdc://h:411", "good_nick");
        conf.passive = true;
        conf.validate().unwrap();

        conf.nick = "has space".into();
        assert!(conf.validate().is_err());
        conf.nick = "".into();
        assert!(conf.validate().is_err());
        conf.nick = "x".repeat(36);
        assert!(conf.validate().is_err());
        conf.nick = "pipe|nick".into();
        assert!(conf.validate().is_err());
    }

    #[test]
    fn active_mode_needs_ports() {
        let mut conf = ClientConfig::new("nmdc://h", "nick");
        conf.encryption = EncryptionMode::DisableEncryption;
        assert!(conf.validate().is_err());
        conf.tcp_port = 3000;
        conf.udp_port = 3000;
        conf.validate().unwrap();

        conf.encryption = EncryptionMode::PreferEncryption;
        assert!(conf.validate().is_err());
        conf.tcp_tls_port = 3001;
        conf.validate().unwrap();
    }

    #[test]
    fn toml_roundtrip() {
        let conf = ClientConfig::new("adc://hub:1511", "tester");
        let text = toml::to_string(&conf).unwrap();
        let back: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.hub_url, conf.hub_url);
        assert_eq!(back.upload_slots, conf.upload_slots);
    }
}
