//! SIP request methods

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// SIP request method.
///
/// The variants cover every method the PBX handles; anything else is carried
/// as [`Method::Other`] so the dispatcher can answer it with 405 instead of
/// failing the parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Notify,
    Refer,
    Other(String),
}

impl Method {
    /// Methods accepted by the core, in the order advertised by `Allow`.
    pub const SUPPORTED: [Method; 9] = [
        Method::Invite,
        Method::Ack,
        Method::Cancel,
        Method::Bye,
        Method::Options,
        Method::Register,
        Method::Info,
        Method::Notify,
        Method::Refer,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Other(s) => s,
        }
    }

    /// Whether the core knows how to process this method at all.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Method::Other(_))
    }

    /// Render the `Allow` header value listing all supported methods.
    pub fn allow_header_value() -> String {
        Method::SUPPORTED
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_uppercase() || b == b'-') {
            return Err(Error::Parse(format!("invalid method token: {s:?}")));
        }
        Ok(match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "CANCEL" => Method::Cancel,
            "BYE" => Method::Bye,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            other => Method::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods() {
        assert_eq!("INVITE".parse::<Method>().unwrap(), Method::Invite);
        assert_eq!("REGISTER".parse::<Method>().unwrap(), Method::Register);
    }

    #[test]
    fn unknown_method_is_preserved() {
        let m = "PUBLISH".parse::<Method>().unwrap();
        assert_eq!(m, Method::Other("PUBLISH".into()));
        assert!(!m.is_supported());
    }

    #[test]
    fn lowercase_method_is_rejected() {
        assert!("invite".parse::<Method>().is_err());
    }

    #[test]
    fn allow_value_lists_invite_first() {
        assert!(Method::allow_header_value().starts_with("INVITE"));
    }
}
