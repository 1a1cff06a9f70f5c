//! Header names, the header collection and typed accessors

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::address::Address;
use crate::types::method::Method;

/// Known SIP header names. Unknown headers are preserved verbatim in
/// [`HeaderName::Other`] so proxied messages keep their full header set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    MaxForwards,
    Expires,
    MinExpires,
    ContentType,
    ContentLength,
    Authorization,
    WwwAuthenticate,
    ProxyAuthorization,
    ProxyAuthenticate,
    UserAgent,
    Allow,
    Supported,
    SessionExpires,
    MinSe,
    Event,
    SubscriptionState,
    ReferTo,
    Reason,
    Route,
    RecordRoute,
    Other(String),
}

impl HeaderName {
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::Contact => "Contact",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Expires => "Expires",
            HeaderName::MinExpires => "Min-Expires",
            HeaderName::ContentType => "Content-Type",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::Authorization => "Authorization",
            HeaderName::WwwAuthenticate => "WWW-Authenticate",
            HeaderName::ProxyAuthorization => "Proxy-Authorization",
            HeaderName::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::Allow => "Allow",
            HeaderName::Supported => "Supported",
            HeaderName::SessionExpires => "Session-Expires",
            HeaderName::MinSe => "Min-SE",
            HeaderName::Event => "Event",
            HeaderName::SubscriptionState => "Subscription-State",
            HeaderName::ReferTo => "Refer-To",
            HeaderName::Reason => "Reason",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::Other(s) => s,
        }
    }

    /// Resolve a wire header name, accepting RFC 3261 compact forms.
    pub fn parse(s: &str) -> HeaderName {
        let s = s.trim();
        if s.len() == 1 {
            return match s.to_ascii_lowercase().as_str() {
                "v" => HeaderName::Via,
                "f" => HeaderName::From,
                "t" => HeaderName::To,
                "i" => HeaderName::CallId,
                "m" => HeaderName::Contact,
                "c" => HeaderName::ContentType,
                "l" => HeaderName::ContentLength,
                "k" => HeaderName::Supported,
                "o" => HeaderName::Event,
                "r" => HeaderName::ReferTo,
                _ => HeaderName::Other(s.to_string()),
            };
        }
        match s.to_ascii_lowercase().as_str() {
            "via" => HeaderName::Via,
            "from" => HeaderName::From,
            "to" => HeaderName::To,
            "call-id" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "contact" => HeaderName::Contact,
            "max-forwards" => HeaderName::MaxForwards,
            "expires" => HeaderName::Expires,
            "min-expires" => HeaderName::MinExpires,
            "content-type" => HeaderName::ContentType,
            "content-length" => HeaderName::ContentLength,
            "authorization" => HeaderName::Authorization,
            "www-authenticate" => HeaderName::WwwAuthenticate,
            "proxy-authorization" => HeaderName::ProxyAuthorization,
            "proxy-authenticate" => HeaderName::ProxyAuthenticate,
            "user-agent" => HeaderName::UserAgent,
            "allow" => HeaderName::Allow,
            "supported" => HeaderName::Supported,
            "session-expires" => HeaderName::SessionExpires,
            "min-se" => HeaderName::MinSe,
            "event" => HeaderName::Event,
            "subscription-state" => HeaderName::SubscriptionState,
            "refer-to" => HeaderName::ReferTo,
            "reason" => HeaderName::Reason,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            _ => HeaderName::Other(s.to_string()),
        }
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header collection. Multiple values for the same name are kept in
/// arrival order, which matters for Via stacking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(HeaderName, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.push((name, value.into()));
    }

    /// Replace every occurrence of `name` with a single value.
    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.retain(|(n, _)| *n != name);
        self.0.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &HeaderName) {
        self.0.retain(|(n, _)| n != name);
    }

    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a HeaderName) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &str)> {
        self.0.iter().map(|(n, v)| (n, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // Typed accessors for the headers the core needs end-to-end.

    pub fn call_id(&self) -> Result<&str> {
        self.get(&HeaderName::CallId)
            .ok_or(Error::MissingHeader("Call-ID"))
    }

    /// CSeq as `(sequence, method)`.
    pub fn cseq(&self) -> Result<(u32, Method)> {
        let raw = self.get(&HeaderName::CSeq).ok_or(Error::MissingHeader("CSeq"))?;
        let (seq, method) = raw
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::InvalidHeader {
                name: "CSeq",
                reason: format!("expected '<seq> <method>', got {raw:?}"),
            })?;
        let seq = seq.parse().map_err(|_| Error::InvalidHeader {
            name: "CSeq",
            reason: format!("non-numeric sequence {seq:?}"),
        })?;
        Ok((seq, method.trim().parse()?))
    }

    pub fn from_addr(&self) -> Result<Address> {
        self.get(&HeaderName::From)
            .ok_or(Error::MissingHeader("From"))?
            .parse()
    }

    pub fn to_addr(&self) -> Result<Address> {
        self.get(&HeaderName::To)
            .ok_or(Error::MissingHeader("To"))?
            .parse()
    }

    /// All Contact addresses across every Contact header, honouring
    /// comma-separated lists. A wildcard (`*`) contact yields an empty list;
    /// callers check [`Headers::contact_is_wildcard`] first.
    pub fn contacts(&self) -> Result<Vec<Address>> {
        let mut out = Vec::new();
        for value in self.get_all(&HeaderName::Contact) {
            if value.trim() == "*" {
                continue;
            }
            for part in split_list(value) {
                out.push(part.parse()?);
            }
        }
        Ok(out)
    }

    pub fn contact_is_wildcard(&self) -> bool {
        self.get_all(&HeaderName::Contact)
            .any(|v| v.trim() == "*")
    }

    pub fn expires(&self) -> Option<u32> {
        self.get(&HeaderName::Expires).and_then(|v| v.trim().parse().ok())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get(&HeaderName::ContentLength)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn top_via(&self) -> Result<Via> {
        self.get(&HeaderName::Via)
            .ok_or(Error::MissingHeader("Via"))?
            .parse()
    }
}

/// Split a comma-separated header value, ignoring commas inside quotes and
/// angle brackets.
fn split_list(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                let part = value[start..i].trim();
                if !part.is_empty() {
                    parts.push(part);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = value[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

/// A single Via header value: `SIP/2.0/UDP host:port;params`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl Via {
    /// The RFC 3261 magic cookie every branch value starts with.
    pub const BRANCH_COOKIE: &'static str = "z9hG4bK";

    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Via {
            transport: transport.into(),
            host: host.into(),
            port: Some(port),
            params: Vec::new(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.params.push(("branch".into(), Some(branch.into())));
        self
    }

    pub fn branch(&self) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("branch"))
            .and_then(|(_, v)| v.as_deref())
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix("SIP/2.0/")
            .ok_or_else(|| Error::InvalidHeader {
                name: "Via",
                reason: format!("missing protocol prefix in {s:?}"),
            })?;
        let (transport, rest) = rest.split_once(char::is_whitespace).ok_or_else(|| {
            Error::InvalidHeader {
                name: "Via",
                reason: "missing sent-by".into(),
            }
        })?;
        let mut parts = rest.trim().split(';');
        let sent_by = parts.next().unwrap_or_default().trim();
        let (host, port) = match sent_by.rsplit_once(':') {
            Some((h, p))
                if !p.is_empty()
                    && p.chars().all(|c| c.is_ascii_digit())
                    && (!h.contains(':') || h.ends_with(']')) =>
            {
                (h.to_string(), p.parse().ok())
            }
            _ => (sent_by.to_string(), None),
        };
        let params = parts
            .filter(|p| !p.trim().is_empty())
            .map(|p| match p.trim().split_once('=') {
                Some((n, v)) => (n.to_string(), Some(v.to_string())),
                None => (p.trim().to_string(), None),
            })
            .collect();
        Ok(Via {
            transport: transport.to_string(),
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
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
    fn compact_forms_resolve() {
        assert_eq!(HeaderName::parse("i"), HeaderName::CallId);
        assert_eq!(HeaderName::parse("v"), HeaderName::Via);
        assert_eq!(HeaderName::parse("X-Custom"), HeaderName::Other("X-Custom".into()));
    }

    #[test]
    fn cseq_parses() {
        let mut h = Headers::new();
        h.push(HeaderName::CSeq, "314159 INVITE");
        assert_eq!(h.cseq().unwrap(), (314159, Method::Invite));
    }

    #[test]
    fn multiple_contacts_split() {
        let mut h = Headers::new();
        h.push(
            HeaderName::Contact,
            "<sip:a@1.2.3.4>;expires=60, \"B, Jr\" <sip:b@5.6.7.8>",
        );
        let contacts = h.contacts().unwrap();
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].expires(), Some(60));
        assert_eq!(contacts[1].display_name.as_deref(), Some("B, Jr"));
    }

    #[test]
    fn wildcard_contact_detected() {
        let mut h = Headers::new();
        h.push(HeaderName::Contact, "*");
        assert!(h.contact_is_wildcard());
        assert!(h.contacts().unwrap().is_empty());
    }

    #[test]
    fn via_round_trip() {
        let text = "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc123;rport";
        let via: Via = text.parse().unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bKabc123"));
        assert_eq!(via.to_string(), text);
    }

    #[test]
    fn set_replaces_all_occurrences() {
        let mut h = Headers::new();
        h.push(HeaderName::Via, "SIP/2.0/UDP a:5060");
        h.push(HeaderName::Via, "SIP/2.0/UDP b:5060");
        h.set(HeaderName::Via, "SIP/2.0/UDP c:5060");
        assert_eq!(h.get_all(&HeaderName::Via).count(), 1);
    }
}
