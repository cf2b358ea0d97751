//! DCC CTCP wire parser.
//!
//! Turns the body of a CTCP `DCC ...` message into a typed [`DccRequest`] and
//! renders requests back into the same textual form. Parsing walks an ordered
//! table of grammar rules and the first rule whose field count and field
//! types match wins:
//!
//! ```text
//! DCC SEND   <name> <ip> <port> <size> [<token>]   active offer, or passive when port = 0
//! DCC SSEND  <name> <ip> <port> <size>             active offer over TLS
//! DCC ACCEPT <name> <port> <position>              resume ack for an active transfer
//! DCC ACCEPT <name> 0 <position> <token>           resume ack for a passive transfer
//! DCC RESUME <name> <port> <position> [<token>]    resume request
//! DCC SEND   <name> <ip> <port>                    offer without a size
//! ```
//!
//! The IP address is the IPv4 address as a decimal `u32` in network byte order.

use crate::dcc::error::{DccError, Result};
use std::fmt;
use std::net::Ipv4Addr;

/// Filename placed in outgoing RESUME requests; senders match on port or
/// token, never on the name.
pub const RESUME_FILENAME: &str = "file.ext";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccRequest {
    Send(DccOffer),
    Accept(ResumePosition),
    Resume(ResumePosition),
}

/// A file offer (`SEND`/`SSEND`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DccOffer {
    pub filename: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    /// 0 when the sender did not announce a size.
    pub size: u64,
    pub token: Option<u64>,
    pub secure: bool,
}

impl DccOffer {
    /// A reverse offer: the sender wants us to listen.
    pub fn is_passive(&self) -> bool {
        self.port == 0 && self.token.is_some()
    }
}

/// How a resume request or acknowledgement is correlated with a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResumeKey {
    Port(u16),
    Token(u64),
}

impl fmt::Display for ResumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeKey::Port(port) => write!(f, "port {}", port),
            ResumeKey::Token(token) => write!(f, "token {}", token),
        }
    }
}

/// Body shared by `ACCEPT` and `RESUME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePosition {
    pub filename: String,
    pub key: ResumeKey,
    pub position: u64,
}

/// Bounds for one numeric field of a rule.
#[derive(Clone, Copy)]
struct Field {
    name: &'static str,
    max: u64,
}

const IP: Field = Field { name: "ip", max: u32::MAX as u64 };
const PORT: Field = Field { name: "port", max: u16::MAX as u64 };
const SIZE: Field = Field { name: "size", max: u64::MAX };
const POSITION: Field = Field { name: "position", max: u64::MAX };
const TOKEN: Field = Field { name: "token", max: u64::MAX };

/// Numeric captures of a matched rule, looked up by field name.
struct Captures<'a> {
    fields: &'a [Field],
    values: Vec<u64>,
}

impl Captures<'_> {
    fn get(&self, name: &str) -> Option<u64> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| self.values[i])
    }
}

struct Rule {
    verb: &'static str,
    fields: &'static [Field],
    build: fn(String, &Captures<'_>) -> Option<DccRequest>,
}

const RULES: &[Rule] = &[
    Rule { verb: "SEND", fields: &[IP, PORT, SIZE, TOKEN], build: build_send },
    Rule { verb: "SEND", fields: &[IP, PORT, SIZE], build: build_send },
    Rule { verb: "SSEND", fields: &[IP, PORT, SIZE], build: build_ssend },
    Rule { verb: "ACCEPT", fields: &[PORT, POSITION, TOKEN], build: build_accept },
    Rule { verb: "ACCEPT", fields: &[PORT, POSITION], build: build_accept },
    Rule { verb: "RESUME", fields: &[PORT, POSITION, TOKEN], build: build_resume },
    Rule { verb: "RESUME", fields: &[PORT, POSITION], build: build_resume },
    Rule { verb: "SEND", fields: &[IP, PORT], build: build_send },
];

fn offer(filename: String, caps: &Captures<'_>, secure: bool) -> Option<DccRequest> {
    let port = caps.get("port")? as u16;
    let token = caps.get("token");
    // Port 0 is only meaningful for a passive offer, which must carry a token.
    if port == 0 && token.is_none() {
        return None;
    }
    Some(DccRequest::Send(DccOffer {
        filename,
        ip: Ipv4Addr::from(caps.get("ip")? as u32),
        port,
        size: caps.get("size").unwrap_or(0),
        token,
        secure,
    }))
}

fn build_send(filename: String, caps: &Captures<'_>) -> Option<DccRequest> {
    offer(filename, caps, false)
}

fn build_ssend(filename: String, caps: &Captures<'_>) -> Option<DccRequest> {
    offer(filename, caps, true)
}

fn resume_position(filename: String, caps: &Captures<'_>) -> Option<ResumePosition> {
    let port = caps.get("port")? as u16;
    let key = match (port, caps.get("token")) {
        (0, Some(token)) => ResumeKey::Token(token),
        (0, None) => return None,
        (port, None) => ResumeKey::Port(port),
        // A token only makes sense on the passive form.
        (_, Some(_)) => return None,
    };
    Some(ResumePosition {
        filename,
        key,
        position: caps.get("position")?,
    })
}

fn build_accept(filename: String, caps: &Captures<'_>) -> Option<DccRequest> {
    resume_position(filename, caps).map(DccRequest::Accept)
}

fn build_resume(filename: String, caps: &Captures<'_>) -> Option<DccRequest> {
    resume_position(filename, caps).map(DccRequest::Resume)
}

/// Split off the filename, honouring double quotes around names with spaces.
fn split_filename(rest: &str) -> Option<(String, &str)> {
    let (name, tail) = if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"')?;
        (&quoted[..end], &quoted[end + 1..])
    } else {
        match rest.find(' ') {
            Some(space) => (&rest[..space], &rest[space..]),
            None => (rest, ""),
        }
    };
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), tail))
}

fn capture<'a>(fields: &'a [Field], numbers: &[&str]) -> Option<Captures<'a>> {
    if numbers.len() != fields.len() {
        return None;
    }
    let values = fields
        .iter()
        .zip(numbers)
        .map(|(field, raw)| raw.parse::<u64>().ok().filter(|v| *v <= field.max))
        .collect::<Option<Vec<u64>>>()?;
    Some(Captures { fields, values })
}

/// Parse a CTCP body such as `DCC SEND file.bin 3232235777 5000 1024`.
pub fn parse(ctcp: &str) -> Result<DccRequest> {
    let protocol_error = || DccError::Protocol(ctcp.to_string());

    let body = ctcp.trim().strip_prefix("DCC ").ok_or_else(protocol_error)?;
    let (verb, rest) = body.split_once(' ').ok_or_else(protocol_error)?;
    let (filename, tail) = split_filename(rest.trim_start()).ok_or_else(protocol_error)?;
    let numbers: Vec<&str> = tail.split_whitespace().collect();

    RULES
        .iter()
        .filter(|rule| rule.verb.eq_ignore_ascii_case(verb))
        .find_map(|rule| {
            let caps = capture(rule.fields, &numbers)?;
            (rule.build)(filename.clone(), &caps)
        })
        .ok_or_else(protocol_error)
}

fn write_name(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if name.contains(' ') {
        write!(f, "\"{}\"", name)
    } else {
        f.write_str(name)
    }
}

fn write_position(f: &mut fmt::Formatter<'_>, resume: &ResumePosition) -> fmt::Result {
    write_name(f, &resume.filename)?;
    match resume.key {
        ResumeKey::Port(port) => write!(f, " {} {}", port, resume.position),
        ResumeKey::Token(token) => write!(f, " 0 {} {}", resume.position, token),
    }
}

impl fmt::Display for DccRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DccRequest::Send(offer) => {
                f.write_str(if offer.secure { "DCC SSEND " } else { "DCC SEND " })?;
                write_name(f, &offer.filename)?;
                write!(f, " {} {} {}", u32::from(offer.ip), offer.port, offer.size)?;
                if let Some(token) = offer.token {
                    write!(f, " {}", token)?;
                }
                Ok(())
            }
            DccRequest::Accept(resume) => {
                f.write_str("DCC ACCEPT ")?;
                write_position(f, resume)
            }
            DccRequest::Resume(resume) => {
                f.write_str("DCC RESUME ")?;
                write_position(f, resume)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(text: &str) -> DccOffer {
        match parse(text) {
            Ok(DccRequest::Send(offer)) => offer,
            other => panic!("expected SEND, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_active_send() {
        let offer = send("DCC SEND file.bin 3232235777 5000 1024");
        assert_eq!(offer.filename, "file.bin");
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(offer.port, 5000);
        assert_eq!(offer.size, 1024);
        assert_eq!(offer.token, None);
        assert!(!offer.secure);
        assert!(!offer.is_passive());
    }

    #[test]
    fn test_parse_passive_send() {
        let offer = send("DCC SEND movie.mkv 2130706433 0 734003200 42");
        assert!(offer.is_passive());
        assert_eq!(offer.token, Some(42));
        assert_eq!(offer.size, 734003200);
        assert_eq!(offer.ip, Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_parse_active_send_with_token_is_not_passive() {
        let offer = send("DCC SEND a.txt 16909060 4000 10 9");
        assert!(!offer.is_passive());
        assert_eq!(offer.token, Some(9));
    }

    #[test]
    fn test_parse_quoted_filename() {
        let offer = send("DCC SEND \"my holiday video.avi\" 16909060 4000 99");
        assert_eq!(offer.filename, "my holiday video.avi");
        assert_eq!(offer.ip, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(offer.size, 99);
    }

    #[test]
    fn test_parse_ssend() {
        let offer = send("DCC SSEND secret.tar 16909060 4000 2048");
        assert!(offer.secure);
        assert_eq!(offer.port, 4000);
    }

    #[test]
    fn test_parse_send_without_size() {
        let offer = send("DCC SEND stream.log 16909060 4000");
        assert_eq!(offer.size, 0);
        assert_eq!(offer.port, 4000);
    }

    #[test]
    fn test_parse_accept_forms() {
        assert_eq!(
            parse("DCC ACCEPT file.ext 5000 1048576").ok(),
            Some(DccRequest::Accept(ResumePosition {
                filename: "file.ext".into(),
                key: ResumeKey::Port(5000),
                position: 1048576,
            }))
        );
        assert_eq!(
            parse("DCC ACCEPT file.ext 0 512 77").ok(),
            Some(DccRequest::Accept(ResumePosition {
                filename: "file.ext".into(),
                key: ResumeKey::Token(77),
                position: 512,
            }))
        );
    }

    #[test]
    fn test_parse_resume_request() {
        assert_eq!(
            parse("DCC RESUME file.ext 0 100 3").ok(),
            Some(DccRequest::Resume(ResumePosition {
                filename: "file.ext".into(),
                key: ResumeKey::Token(3),
                position: 100,
            }))
        );
    }

    #[test]
    fn test_malformed_is_protocol_error() {
        for text in [
            "DCC SEND",
            "DCC SEND file.bin",
            "DCC SEND file.bin notanip 5000 10",
            "DCC SEND file.bin 1 70000 10",
            "DCC SEND file.bin 16909060 0 10",
            "DCC SSEND secret.bin 16909060 0 5 7",
            "DCC SSEND secret.bin 16909060 0 5",
            "DCC SSEND secret.bin 16909060 4000 5 7",
            "DCC SEND file.bin 99999999999 5000 10",
            "DCC SEND \"unterminated 1 2 3",
            "DCC ACCEPT file.ext 0 100",
            "DCC ACCEPT file.ext 5000 100 7",
            "DCC CHAT chat 16909060 4000",
            "PING 12345",
            "",
        ] {
            assert!(
                matches!(parse(text), Err(DccError::Protocol(_))),
                "{:?} should not parse",
                text
            );
        }
    }

    #[test]
    fn test_encode_parse_is_idempotent() {
        let inputs = [
            "DCC SEND file.bin 3232235777 5000 1024",
            "DCC SEND \"two words.txt\" 16909060 0 55 12",
            "DCC SSEND x 16909060 4000 2048",
            "DCC ACCEPT file.ext 5000 100",
            "DCC ACCEPT file.ext 0 100 8",
            "DCC RESUME file.ext 6000 300",
            "DCC RESUME file.ext 0 300 9",
        ];
        for text in inputs {
            let first = parse(text).unwrap();
            let encoded = first.to_string();
            assert_eq!(encoded, text);
            assert_eq!(parse(&encoded).unwrap(), first);
        }
    }
}
