//! Common types used throughout the dispatcher-core library

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DispatcherError, Result};

/// Identifier of a destination set (group)
pub type SetId = u32;

/// Destination selection algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// 0 - hash over the Call-ID
    HashCallId,
    /// 1 - hash over the From URI
    HashFromUri,
    /// 2 - hash over the To URI
    HashToUri,
    /// 3 - hash over the Request-URI
    HashRequestUri,
    /// 4 - round robin
    RoundRobin,
    /// 5 - hash over the authentication username, round robin without credentials
    HashAuthUsername,
    /// 6 - uniform random
    Random,
    /// 7 - hash over the value of the configured hash expression
    HashExpression,
    /// 8 - always the first destination
    Serial,
    /// 9 - weight based distribution table
    Weight,
    /// 10 - least loaded destination, tracked per call
    CallLoad,
}

impl Algorithm {
    pub fn id(&self) -> u32 {
        match self {
            Algorithm::HashCallId => 0,
            Algorithm::HashFromUri => 1,
            Algorithm::HashToUri => 2,
            Algorithm::HashRequestUri => 3,
            Algorithm::RoundRobin => 4,
            Algorithm::HashAuthUsername => 5,
            Algorithm::Random => 6,
            Algorithm::HashExpression => 7,
            Algorithm::Serial => 8,
            Algorithm::Weight => 9,
            Algorithm::CallLoad => 10,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        let alg = match id {
            0 => Algorithm::HashCallId,
            1 => Algorithm::HashFromUri,
            2 => Algorithm::HashToUri,
            3 => Algorithm::HashRequestUri,
            4 => Algorithm::RoundRobin,
            5 => Algorithm::HashAuthUsername,
            6 => Algorithm::Random,
            7 => Algorithm::HashExpression,
            8 => Algorithm::Serial,
            9 => Algorithm::Weight,
            10 => Algorithm::CallLoad,
            _ => return None,
        };
        Some(alg)
    }
}

impl TryFrom<u32> for Algorithm {
    type Error = DispatcherError;

    fn try_from(id: u32) -> Result<Self> {
        Algorithm::from_id(id)
            .ok_or_else(|| DispatcherError::Config(format!("unknown algorithm {}", id)))
    }
}

/// How the selected destination is applied to the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    /// Set the destination URI (outbound proxy), keep the Request-URI
    DestinationUri,
    /// Replace the Request-URI with the destination URI
    RequestUri,
    /// Rewrite only host:port of the Request-URI
    HostPort,
}

/// Which destinations the health monitor keeps probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbingMode {
    /// Only destinations flagged for probing in the list are probed; failures
    /// do not add the flag
    #[default]
    None,
    /// Probe every destination that is not administratively disabled
    All,
    /// Failing destinations get the probing flag and keep it after recovery
    OnlyFlagged,
}

/// SIP transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    Tls,
    Sctp,
    Ws,
    Wss,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
            Transport::Sctp => "sctp",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = DispatcherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            "sctp" => Ok(Transport::Sctp),
            "ws" => Ok(Transport::Ws),
            "wss" => Ok(Transport::Wss),
            other => Err(DispatcherError::Config(format!("unknown transport '{}'", other))),
        }
    }
}

/// Local socket a request is forced out of, written as `proto:host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketSpec {
    pub transport: Transport,
    pub host: String,
    pub port: Option<u16>,
}

impl fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for SocketSpec {
    type Err = DispatcherError;

    /// Accepts `proto:host[:port]` or `host[:port]` (udp implied). IPv6 hosts
    /// must be bracketed.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || DispatcherError::Config(format!("bad socket '{}'", s));
        let s = s.trim();
        if s.is_empty() {
            return Err(bad());
        }

        let (transport, rest) = match s.split_once(':') {
            Some((proto, rest)) if proto.parse::<Transport>().is_ok() && !proto.starts_with('[') => {
                (proto.parse::<Transport>()?, rest)
            }
            _ => (Transport::Udp, s),
        };

        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(bad)?;
            let host = &rest[..end + 2];
            let tail = &stripped[end + 1..];
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse::<u16>().map_err(|_| bad())?),
                None if tail.is_empty() => None,
                None => return Err(bad()),
            };
            (host.to_string(), port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, p)) => (host.to_string(), Some(p.parse::<u16>().map_err(|_| bad())?)),
                None => (rest.to_string(), None),
            }
        };

        if host.is_empty() || (host.contains(':') && !host.starts_with('[')) {
            return Err(bad());
        }
        Ok(SocketSpec { transport, host, port })
    }
}
