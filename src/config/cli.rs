use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Download files from XDCC bots on IRC
#[derive(Debug, Parser)]
#[command(name = "dccfetch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// IRC server to connect to
    pub server: String,

    /// Comma-separated channels to join, e.g. "#chan1, #chan2"
    pub channels: String,

    /// Comma-separated "<bot> <command>" pairs, e.g. "Bot xdcc send #12, Bot xdcc send #13"
    pub downloads: String,

    /// IRC server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Connect to the IRC server over TLS
    #[arg(long)]
    pub tls: bool,

    /// Directory downloads are written to
    #[arg(short = 'd', long)]
    pub directory: Option<PathBuf>,

    /// Nickname to use (random when omitted)
    #[arg(short, long)]
    pub nick: Option<String>,

    /// Login command sent after connecting, e.g. "NickServ IDENTIFY secret"
    #[arg(short, long)]
    pub login: Option<String>,

    /// Stay connected after downloading to verify MD5 checksums
    #[arg(short = 'c', long)]
    pub checksum_verify: bool,

    /// Accept DCC offers from any nick, not just the requested bots
    #[arg(long)]
    pub accept_all_nicks: bool,

    /// Accept any certificate on SSEND transfers
    #[arg(long)]
    pub accept_all_certs: bool,

    /// Do not send file offset confirmations
    #[arg(long)]
    pub dont_confirm_offsets: bool,

    /// Maximum total download speed, e.g. 500KByte or 2MByte
    #[arg(long, value_name = "SPEED")]
    pub throttle: Option<String>,

    /// Seconds to wait before sending the XDCC requests
    #[arg(long, value_name = "SECONDS")]
    pub delay: Option<u64>,

    /// IPv4 address advertised to bots for passive transfers
    #[arg(long)]
    pub listen_ip: Option<Ipv4Addr>,

    /// Port to listen on for passive transfers
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Suppress all logging
    #[arg(short, long, conflicts_with_all = ["verbose", "information"])]
    pub quiet: bool,

    /// Detailed logging
    #[arg(short, long, conflicts_with = "information")]
    pub verbose: bool,

    /// Informational logging, including transfer progress
    #[arg(short, long)]
    pub information: bool,
}
