//! Configuration file data model.
//!
//! Every field has a default so a missing or partial `config.toml` is fine.
//! Values given on the command line take precedence over these.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Root of `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// One of `quiet`, `error`, `warn`, `info`, `debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub irc: IrcConfig,
    #[serde(default = "default_dcc")]
    pub dcc: DccConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            irc: IrcConfig::default(),
            dcc: default_dcc(),
        }
    }
}

/// IRC server connection defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrcConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub nickname: Option<String>,
    /// Sent once after registering, e.g. `NickServ IDENTIFY secret`.
    #[serde(default)]
    pub login_command: Option<String>,
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

impl Default for IrcConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            tls: false,
            nickname: None,
            login_command: None,
            accept_invalid_certs: true,
        }
    }
}

/// DCC transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DccConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Ceiling such as `"500KByte"`; unset means unlimited.
    #[serde(default)]
    pub max_transfer_speed: Option<String>,
    #[serde(default = "default_true")]
    pub confirm_offsets: bool,
    #[serde(default)]
    pub verify_checksums: bool,
    #[serde(default = "default_true")]
    pub allow_all_certs: bool,
    #[serde(default)]
    pub accept_all_nicks: bool,
    /// Address advertised to bots for passive transfers.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: Ipv4Addr,
    /// 0 picks an ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_log_level() -> String {
    "warn".into()
}
fn default_port() -> u16 {
    6667
}
fn default_true() -> bool {
    true
}
fn default_download_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Downloads")
}
fn default_listen_ip() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_dcc() -> DccConfig {
    DccConfig {
        download_dir: default_download_dir(),
        max_transfer_speed: None,
        confirm_offsets: true,
        verify_checksums: false,
        allow_all_certs: true,
        accept_all_nicks: false,
        listen_ip: default_listen_ip(),
        listen_port: 0,
        tick_interval_ms: default_tick_interval_ms(),
    }
}
