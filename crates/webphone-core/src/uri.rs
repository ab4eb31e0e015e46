//! SIP URI construction for identities and dial targets

use std::fmt;

use thiserror::Error;

/// Why a user/host pair could not form a SIP URI
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("empty user part")]
    EmptyUser,
    #[error("invalid character {0:?} in user part")]
    InvalidUser(char),
    #[error("empty host")]
    EmptyHost,
    #[error("invalid host {0:?}")]
    InvalidHost(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

/// A validated `sip:user@host[:port]` URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    user: String,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    /// Build `sip:<user>@<host>` from a user part and a domain (optionally with port)
    pub fn new(user: &str, domain: &str) -> Result<Self, UriError> {
        let user = user.trim();
        if user.is_empty() {
            return Err(UriError::EmptyUser);
        }
        if let Some(bad) = user
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '@' | '<' | '>' | '"' | ':'))
        {
            return Err(UriError::InvalidUser(bad));
        }

        let domain = domain.trim();
        if domain.is_empty() {
            return Err(UriError::EmptyHost);
        }
        let (host, port) = split_host_port(domain)?;
        Ok(Self {
            user: user.to_string(),
            host,
            port,
        })
    }

    /// The user part
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The host part (IPv6 hosts keep their brackets)
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:{}@{}", self.user, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

fn split_host_port(domain: &str) -> Result<(String, Option<u16>), UriError> {
    if let Some(rest) = domain.strip_prefix('[') {
        let (addr, tail) = rest
            .split_once(']')
            .ok_or_else(|| UriError::InvalidHost(domain.to_string()))?;
        if addr.is_empty() || !addr.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.') {
            return Err(UriError::InvalidHost(domain.to_string()));
        }
        let port = match tail {
            "" => None,
            t => Some(parse_port(t.strip_prefix(':').unwrap_or(t))?),
        };
        return Ok((format!("[{addr}]"), port));
    }

    let (host, port) = match domain.split_once(':') {
        Some((host, port)) => (host, Some(parse_port(port)?)),
        None => (domain, None),
    };
    let valid = !host.is_empty()
        && !host.starts_with('.')
        && !host.starts_with('-')
        && !host.contains("..")
        && host.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        return Err(UriError::InvalidHost(host.to_string()));
    }
    Ok((host.to_ascii_lowercase(), port))
}

fn parse_port(port: &str) -> Result<u16, UriError> {
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(UriError::InvalidPort(port.to_string())),
    }
}
