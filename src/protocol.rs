use std::fmt;
use std::io::{Error, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// reply for a file the tracker knows no live seeder for, and the payload a
/// seeder returns when asked for a file it does not hold
pub const FILE_NOT_FOUND: &str = "file not found";
/// reply to any datagram that does not match the request table
pub const BAD_REQUEST: &str = "bad request";

/// Listening endpoint of a peer. Two values with the same host and port are
/// the same peer; equality and hashing are derived from the fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> PeerAddr {
        PeerAddr {
            host: host.into(),
            port,
        }
    }

    /// Resolves to a connectable socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "address did not resolve"))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<PeerAddr, Error> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            Error::new(ErrorKind::InvalidData, "address should look like host:port")
        })?;
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(Error::new(ErrorKind::InvalidData, "bad host"));
        }
        let port = port
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidData, "bad port"))?;
        Ok(PeerAddr {
            host: host.to_string(),
            port,
        })
    }
}

/// A request datagram as seen by the tracker. One variant per message kind;
/// anything that does not parse into a variant is answered with
/// [`BAD_REQUEST`].
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `active <host:port>` — liveness heartbeat, no reply
    Active(PeerAddr),
    /// `get <file>` — asks for a live seeder of the file
    Get(String),
    /// `seed <file> <host:port>` — announces a seeder, no reply
    Seed { file: String, addr: PeerAddr },
    /// `log <text>` — client-submitted log line, kept verbatim, no reply
    Log(String),
}

impl Request {
    /// Strict parse of one datagram. Extra tokens, missing fields and
    /// malformed addresses are all rejected; only `log` takes freeform text.
    pub fn parse(raw: &str) -> Result<Request, Error> {
        let raw = raw.trim_end_matches(&['\r', '\n'][..]);
        match raw.split_once(' ') {
            Some(("active", rest)) => Ok(Request::Active(single_token(rest)?.parse()?)),
            Some(("get", rest)) => Ok(Request::Get(single_token(rest)?.to_string())),
            Some(("seed", rest)) => {
                let mut parts = rest.split_whitespace();
                let file = parts
                    .next()
                    .ok_or_else(|| Error::new(ErrorKind::InvalidData, "missing file name"))?;
                let addr = parts
                    .next()
                    .ok_or_else(|| Error::new(ErrorKind::InvalidData, "missing address"))?
                    .parse()?;
                if parts.next().is_some() {
                    return Err(Error::new(ErrorKind::InvalidData, "trailing data"));
                }
                Ok(Request::Seed {
                    file: file.to_string(),
                    addr,
                })
            }
            Some(("log", rest)) => Ok(Request::Log(rest.to_string())),
            _ => Err(Error::new(ErrorKind::InvalidData, "unknown request")),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Request::Active(addr) => format!("active {}", addr),
            Request::Get(file) => format!("get {}", file),
            Request::Seed { file, addr } => format!("seed {} {}", file, addr),
            Request::Log(text) => format!("log {}", text),
        }
    }
}

/// A tracker reply to a `get` request (the only request kind that gets one,
/// besides the bad-request fallback).
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `receive_from <host:port>` — fetch the file from this seeder
    ReceiveFrom(PeerAddr),
    FileNotFound,
    BadRequest,
}

impl Reply {
    pub fn parse(raw: &str) -> Result<Reply, Error> {
        let raw = raw.trim_end_matches(&['\r', '\n'][..]);
        if raw == FILE_NOT_FOUND {
            return Ok(Reply::FileNotFound);
        }
        if raw == BAD_REQUEST {
            return Ok(Reply::BadRequest);
        }
        match raw.strip_prefix("receive_from ") {
            Some(addr) => Ok(Reply::ReceiveFrom(single_token(addr)?.parse()?)),
            None => Err(Error::new(ErrorKind::InvalidData, "unknown reply")),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Reply::ReceiveFrom(addr) => format!("receive_from {}", addr),
            Reply::FileNotFound => FILE_NOT_FOUND.to_string(),
            Reply::BadRequest => BAD_REQUEST.to_string(),
        }
    }
}

/// Exactly one whitespace-free token, nothing trailing.
fn single_token(rest: &str) -> Result<&str, Error> {
    let mut parts = rest.split_whitespace();
    let token = parts
        .next()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "missing field"))?;
    if parts.next().is_some() {
        return Err(Error::new(ErrorKind::InvalidData, "trailing data"));
    }
    Ok(token)
}
