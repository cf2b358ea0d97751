pub mod cli;
pub mod model;
pub mod nickname;

use anyhow::{bail, Context, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

pub use cli::Cli;
pub use model::AppConfig;

use crate::dcc::progress::parse_speed;

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dccfetch")
        .join("config.toml")
}

pub fn load_config() -> Result<AppConfig> {
    let path = config_path();
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Quiet,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn from_name(name: &str) -> Result<Self> {
        Ok(match name.trim().to_ascii_lowercase().as_str() {
            "quiet" | "off" => LogLevel::Quiet,
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            other => bail!("unknown log_level {:?}", other),
        })
    }

    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Quiet => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// One `/msg <bot> <command>` to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdccRequest {
    pub bot: String,
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct IrcSettings {
    pub server: String,
    pub port: u16,
    pub tls: bool,
    pub nickname: String,
    pub accept_invalid_certs: bool,
}

/// Read-only settings consumed by the DCC engine.
#[derive(Debug, Clone)]
pub struct DccSettings {
    pub download_dir: PathBuf,
    pub listen_ip: Ipv4Addr,
    pub listen_port: u16,
    /// Bytes per second, 0 for unlimited.
    pub max_speed: u64,
    pub confirm_offsets: bool,
    pub accept_all_certs: bool,
    pub verify_checksums: bool,
    pub tick_interval: Duration,
}

/// Everything the run needs, built once from the config file and CLI.
#[derive(Debug, Clone)]
pub struct Settings {
    pub irc: IrcSettings,
    pub dcc: DccSettings,
    pub channels: Vec<String>,
    pub downloads: Vec<XdccRequest>,
    pub login_command: Option<String>,
    pub send_delay: Option<Duration>,
    pub accept_all_nicks: bool,
    pub log_level: LogLevel,
    /// Problems worth reporting once logging is up.
    pub warnings: Vec<String>,
}

impl Settings {
    /// Merge the command line over the config file.
    pub fn resolve(cli: Cli, file: AppConfig) -> Result<Self> {
        let downloads = parse_downloads(&cli.downloads);
        if downloads.is_empty() {
            bail!("no downloads given; expected \"<bot> <command>[, <bot> <command>...]\"");
        }
        let channels = parse_channels(&cli.channels);

        let log_level = if cli.quiet {
            LogLevel::Quiet
        } else if cli.verbose {
            LogLevel::Debug
        } else if cli.information {
            LogLevel::Info
        } else {
            LogLevel::from_name(&file.log_level)?
        };

        let mut warnings = Vec::new();
        let throttle = cli.throttle.or(file.dcc.max_transfer_speed);
        let max_speed = match throttle.as_deref() {
            Some(text) => parse_speed(text).unwrap_or_else(|| {
                warnings.push(format!("Ignoring unusable speed limit {:?}", text));
                0
            }),
            None => 0,
        };

        if file.dcc.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be greater than zero");
        }

        let login_command = cli.login.or(file.irc.login_command);
        if let Some(login) = &login_command {
            if split_login_command(login).is_none() {
                bail!("login command {:?} must look like \"<nick> <message>\"", login);
            }
        }

        let nickname = cli
            .nick
            .or(file.irc.nickname)
            .unwrap_or_else(nickname::generate_nickname);

        Ok(Self {
            irc: IrcSettings {
                server: cli.server,
                port: cli.port.unwrap_or(file.irc.port),
                tls: cli.tls || file.irc.tls,
                nickname,
                accept_invalid_certs: file.irc.accept_invalid_certs,
            },
            dcc: DccSettings {
                download_dir: cli.directory.unwrap_or(file.dcc.download_dir),
                listen_ip: cli.listen_ip.unwrap_or(file.dcc.listen_ip),
                listen_port: cli.listen_port.unwrap_or(file.dcc.listen_port),
                max_speed,
                confirm_offsets: file.dcc.confirm_offsets && !cli.dont_confirm_offsets,
                accept_all_certs: cli.accept_all_certs || file.dcc.allow_all_certs,
                verify_checksums: cli.checksum_verify || file.dcc.verify_checksums,
                tick_interval: Duration::from_millis(file.dcc.tick_interval_ms),
            },
            channels,
            downloads,
            login_command,
            send_delay: cli.delay.map(Duration::from_secs),
            accept_all_nicks: cli.accept_all_nicks || file.dcc.accept_all_nicks,
            log_level,
            warnings,
        })
    }
}

/// `"Bot xdcc send #1, Other xdcc send #5"` -> one request per entry.
pub fn parse_downloads(list: &str) -> Vec<XdccRequest> {
    list.split(',')
        .filter_map(|entry| {
            let (bot, command) = entry.trim().split_once(' ')?;
            let command = command.trim();
            if bot.is_empty() || command.is_empty() {
                return None;
            }
            Some(XdccRequest {
                bot: bot.to_string(),
                command: command.to_string(),
            })
        })
        .collect()
}

pub fn parse_channels(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// `"NickServ IDENTIFY pw"` -> `("NickServ", "IDENTIFY pw")`.
pub fn split_login_command(login: &str) -> Option<(&str, &str)> {
    let (target, text) = login.trim().split_once(char::is_whitespace)?;
    let text = text.trim();
    if target.is_empty() || text.is_empty() {
        return None;
    }
    Some((target, text))
}
