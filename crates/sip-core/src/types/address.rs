//! Address headers (From, To, Contact) with their parameters

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::types::uri::Uri;

/// A name-addr as carried by From, To and Contact headers:
/// `"Display" <sip:uri>;param=value`.
///
/// Without angle brackets, everything after the first `;` is treated as
/// header parameters rather than URI parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Vec<(String, Option<String>)>,
}

impl Address {
    pub fn new(uri: Uri) -> Self {
        Address {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        if let Some(entry) = self
            .params
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.params.push((name.to_string(), value));
        }
    }

    /// The dialog `tag` parameter.
    pub fn tag(&self) -> Option<&str> {
        self.param("tag")
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.set_param("tag", Some(tag.into()));
    }

    /// Per-contact `expires` parameter, if present and numeric.
    pub fn expires(&self) -> Option<u32> {
        self.param("expires").and_then(|v| v.parse().ok())
    }

    /// Vendor push token carried on mobile Contact headers (`pn-tok`).
    pub fn push_token(&self) -> Option<&str> {
        self.param("pn-tok")
    }

    /// Push platform (`pn-type`), e.g. `apns` or `fcm`.
    pub fn push_platform(&self) -> Option<&str> {
        self.param("pn-type")
    }

    /// Stable device identifier (`pn-device`), used to match re-registrations
    /// from the same handset.
    pub fn device_id(&self) -> Option<&str> {
        self.param("pn-device")
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidHeader {
                name: "address",
                reason: "empty value".into(),
            });
        }

        let (display_name, rest) = if let Some(rest) = s.strip_prefix('"') {
            let end = rest.find('"').ok_or_else(|| Error::InvalidHeader {
                name: "address",
                reason: "unterminated quoted display name".into(),
            })?;
            (Some(rest[..end].to_string()), rest[end + 1..].trim_start())
        } else if let Some(lt) = s.find('<') {
            let name = s[..lt].trim();
            (
                (!name.is_empty()).then(|| name.to_string()),
                s[lt..].trim_start(),
            )
        } else {
            (None, s)
        };

        if let Some(rest) = rest.strip_prefix('<') {
            let gt = rest.find('>').ok_or_else(|| Error::InvalidHeader {
                name: "address",
                reason: "unterminated angle bracket".into(),
            })?;
            let uri = rest[..gt].parse()?;
            let params = parse_params(&rest[gt + 1..]);
            Ok(Address {
                display_name,
                uri,
                params,
            })
        } else {
            let (uri_part, param_part) = match rest.split_once(';') {
                Some((u, p)) => (u, p),
                None => (rest, ""),
            };
            Ok(Address {
                display_name,
                uri: uri_part.parse()?,
                params: parse_params(param_part),
            })
        }
    }
}

fn parse_params(s: &str) -> Vec<(String, Option<String>)> {
    s.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((n, v)) => (n.to_string(), Some(v.trim_matches('"').to_string())),
            None => (p.to_string(), None),
        })
        .collect()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{name}\" ")?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(v) if v.contains(' ') => write!(f, ";{name}=\"{v}\"")?,
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
    fn parses_name_addr_with_tag() {
        let addr: Address = "\"Alice\" <sip:alice@example.com>;tag=88ab4c".parse().unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
        assert_eq!(addr.tag(), Some("88ab4c"));
    }

    #[test]
    fn parses_bare_uri_with_header_params() {
        let addr: Address = "sip:202@10.1.2.3:5060;tag=x1".parse().unwrap();
        assert_eq!(addr.uri.port, Some(5060));
        assert_eq!(addr.tag(), Some("x1"));
        assert!(addr.uri.params.is_empty());
    }

    #[test]
    fn parses_push_contact_params() {
        let addr: Address =
            "<sip:202@192.168.1.20:43211;transport=tcp>;pn-tok=abc123;pn-type=apns;pn-device=ios-7f;expires=600"
                .parse()
                .unwrap();
        assert_eq!(addr.push_token(), Some("abc123"));
        assert_eq!(addr.push_platform(), Some("apns"));
        assert_eq!(addr.device_id(), Some("ios-7f"));
        assert_eq!(addr.expires(), Some(600));
        assert_eq!(addr.uri.transport().as_deref(), Some("tcp"));
    }

    #[test]
    fn set_tag_replaces_existing() {
        let mut addr: Address = "<sip:a@b>;tag=old".parse().unwrap();
        addr.set_tag("new");
        assert_eq!(addr.tag(), Some("new"));
        assert_eq!(addr.params.len(), 1);
    }

    #[test]
    fn display_round_trip() {
        let text = "\"Bob\" <sip:bob@example.org:5061>;tag=z9";
        let addr: Address = text.parse().unwrap();
        assert_eq!(addr.to_string(), text);
    }
}
