//! # SIP URI handling for destinations
//!
//! Destinations and the hash keys taken from requests are SIP URIs of the form
//!
//! ```text
//! sip:user:password@host:port;uri-parameters?headers
//! ```
//!
//! Only the parts the dispatcher needs are modelled: scheme, user, host, port,
//! parameters (for `transport=`) and the raw header tail, which is kept so a
//! rewritten URI prints back faithfully.
//!
//! ```rust
//! use rvoip_dispatcher_core::uri::SipUri;
//! use rvoip_dispatcher_core::Transport;
//!
//! let uri: SipUri = "sip:alice@example.com:5080;transport=tcp".parse().unwrap();
//! assert_eq!(uri.user.as_deref(), Some("alice"));
//! assert_eq!(uri.host, "example.com");
//! assert_eq!(uri.port, Some(5080));
//! assert_eq!(uri.transport(), Transport::Tcp);
//! ```

use std::fmt;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, opt, recognize, rest},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};

use crate::error::{DispatcherError, Result};
use crate::types::Transport;

/// Default port for `sip:` URIs
pub const SIP_PORT: u16 = 5060;
/// Default port for `sips:` URIs
pub const SIPS_PORT: u16 = 5061;

/// Longest hostname accepted in a destination URI
pub const MAX_HOST_LEN: usize = 254;

/// SIP URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Sip => SIP_PORT,
            Scheme::Sips => SIPS_PORT,
        }
    }
}

/// A parsed SIP or SIPS URI
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Host as written, IPv6 references keep their brackets
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
    pub headers: Option<String>,
}

impl SipUri {
    /// Parse a destination URI, prefixing `sip:` when the scheme is missing.
    ///
    /// Returns the parsed URI and whether the scheme had to be added.
    pub fn parse_lenient(input: &str) -> Result<(Self, bool)> {
        match input.parse::<SipUri>() {
            Ok(uri) => Ok((uri, false)),
            Err(err) => {
                let lower = input.to_ascii_lowercase();
                if input.len() > 4 && !lower.starts_with("sip:") && !lower.starts_with("sips:") {
                    let fixed = format!("sip:{}", input);
                    let uri = fixed.parse::<SipUri>()?;
                    Ok((uri, true))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Port to use when none is written
    pub fn default_port(&self) -> u16 {
        self.scheme.default_port()
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.default_port())
    }

    /// Transport from the `transport` parameter, TLS for `sips:`, UDP otherwise
    pub fn transport(&self) -> Transport {
        if let Some(proto) = self.param("transport") {
            if let Ok(transport) = proto.parse() {
                return transport;
            }
        }
        match self.scheme {
            Scheme::Sips => Transport::Tls,
            Scheme::Sip => Transport::Udp,
        }
    }

    /// Value of a URI parameter, names compared case-insensitively
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// `true` for bracketed IPv6 references such as `[2001:db8::1]`
    pub fn is_ipv6_reference(&self) -> bool {
        self.host.starts_with('[') && self.host.ends_with(']')
    }

    /// Host with the brackets of an IPv6 reference removed
    pub fn bare_host(&self) -> &str {
        if self.is_ipv6_reference() {
            &self.host[1..self.host.len() - 1]
        } else {
            &self.host
        }
    }

    /// Host part of the hash key: the port is only included when it is written
    /// and differs from the scheme default.
    pub fn hash_host_key(&self) -> String {
        match self.port {
            Some(port) if port != self.default_port() => format!("{}:{}", self.host, port),
            _ => self.host.clone(),
        }
    }

    /// Copy of this URI with host and port taken from `target`
    pub fn with_host_port_of(&self, target: &SipUri) -> SipUri {
        let mut uri = self.clone();
        uri.host = target.host.clone();
        uri.port = target.port;
        uri
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "{}", user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = DispatcherError;

    fn from_str(s: &str) -> Result<Self> {
        let input = s.trim();
        let (_, uri) = all_consuming(sip_uri)(input)
            .map_err(|e| DispatcherError::invalid_uri(s, format!("{:?}", e)))?;
        if uri.host.is_empty() {
            return Err(DispatcherError::invalid_uri(s, "no host present"));
        }
        Ok(uri)
    }
}

fn scheme(input: &str) -> IResult<&str, Scheme> {
    alt((
        map(tag_no_case("sips:"), |_| Scheme::Sips),
        map(tag_no_case("sip:"), |_| Scheme::Sip),
    ))(input)
}

fn userinfo(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    terminated(
        pair(is_not(":@?"), opt(preceded(char(':'), is_not("@?")))),
        char('@'),
    )(input)
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'
}

fn host(input: &str) -> IResult<&str, &str> {
    alt((
        recognize(delimited(char('['), is_not("]"), char(']'))),
        take_while1(is_host_char),
    ))(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    preceded(char(':'), map_res(digit1, |d: &str| d.parse::<u16>()))(input)
}

fn is_param_char(c: char) -> bool {
    !matches!(c, ';' | '=' | '?' | '>' | ' ' | '\t')
}

fn param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        char(';'),
        pair(
            take_while1(is_param_char),
            opt(preceded(char('='), take_while(is_param_char))),
        ),
    )(input)
}

fn sip_uri(input: &str) -> IResult<&str, SipUri> {
    let (input, (scheme, userinfo, host, port, params, headers)) = tuple((
        scheme,
        opt(userinfo),
        host,
        opt(port),
        many0(param),
        opt(preceded(char('?'), rest)),
    ))(input)?;

    let (user, password) = match userinfo {
        Some((user, password)) => (Some(user.to_string()), password.map(str::to_string)),
        None => (None, None),
    };

    Ok((
        input,
        SipUri {
            scheme,
            user,
            password,
            host: host.to_string(),
            port,
            params: params
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.map(str::to_string)))
                .collect(),
            headers: headers.map(str::to_string),
        },
    ))
}
