//! SIP URI parsing and formatting

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::Error;

/// URI scheme. Only `sip` and `sips` are meaningful to the PBX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
        }
    }
}

/// A SIP or SIPS URI: `sip:user@host:port;params`.
///
/// URI headers (`?name=value`) are accepted on input and discarded; the PBX
/// never generates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl Uri {
    /// Build a plain `sip:user@host` URI.
    pub fn sip(user: impl Into<String>, host: impl Into<String>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: Some(user.into()),
            host: host.into(),
            port: None,
            params: Vec::new(),
        }
    }

    /// Build a `sip:user@ip:port` URI from a socket address.
    pub fn sip_addr(user: impl Into<String>, addr: SocketAddr) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: Some(user.into()),
            host: addr.ip().to_string(),
            port: Some(addr.port()),
            params: Vec::new(),
        }
    }

    /// Look up a URI parameter by name (case-insensitive).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// The `transport` parameter, lowercased, if present.
    pub fn transport(&self) -> Option<String> {
        self.param("transport").map(|t| t.to_ascii_lowercase())
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.params.push((name.into(), value));
        self
    }

    /// Host and port as a `host:port` string, defaulting the port to 5060.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(5060))
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(Error::InvalidUri(format!("unsupported scheme in {s:?}")));
        };

        // Strip URI headers, split off parameters.
        let rest = rest.split('?').next().unwrap_or(rest);
        let mut parts = rest.split(';');
        let authority = parts
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::InvalidUri(format!("empty authority in {s:?}")))?;

        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, hp)) => (Some(user.to_string()), hp),
            None => (None, authority),
        };

        let (host, port) = split_host_port(host_port)
            .ok_or_else(|| Error::InvalidUri(format!("bad host in {s:?}")))?;

        let params = parts
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((n, v)) => (n.to_string(), Some(v.to_string())),
                None => (p.to_string(), None),
            })
            .collect();

        Ok(Uri {
            scheme,
            user,
            host,
            port,
            params,
        })
    }
}

/// Split `host[:port]`, keeping IPv6 reference brackets intact.
fn split_host_port(s: &str) -> Option<(String, Option<u16>)> {
    if s.is_empty() {
        return None;
    }
    if let Some(end) = s.strip_prefix('[').and_then(|r| r.find(']')) {
        let host = s[..end + 2].to_string();
        let port = match s[end + 2..].strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None => None,
        };
        return Some((host, port));
    }
    match s.split_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok())),
        Some(_) => None,
        None => Some((s.to_string(), None)),
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{name}={v}")?,
                None => write!(f, ";{name}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri: Uri = "sip:201@pbx.example.com:5080;transport=tcp".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("201"));
        assert_eq!(uri.host, "pbx.example.com");
        assert_eq!(uri.port, Some(5080));
        assert_eq!(uri.transport().as_deref(), Some("tcp"));
    }

    #[test]
    fn parses_hostonly_uri() {
        let uri: Uri = "sip:10.0.0.5".parse().unwrap();
        assert_eq!(uri.user, None);
        assert_eq!(uri.host, "10.0.0.5");
        assert_eq!(uri.port, None);
    }

    #[test]
    fn round_trips() {
        let text = "sip:alice@host.net:5061;transport=tls;lr";
        let uri: Uri = text.parse().unwrap();
        assert_eq!(uri.to_string(), text);
    }

    #[test]
    fn rejects_other_schemes() {
        assert!("tel:+6129999".parse::<Uri>().is_err());
        assert!("sip:".parse::<Uri>().is_err());
    }

    #[test]
    fn keeps_ipv6_brackets() {
        let uri: Uri = "sip:bob@[2001:db8::1]:5060".parse().unwrap();
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.port, Some(5060));
    }
}
