//! SDP offer/answer model
//!
//! Only the subset the media proxy needs: one audio section, RTP/AVP,
//! payload numbers 0 (PCMU), 8 (PCMA), 111 (Opus) and 101 (telephone-event).
//! Unknown attributes are preserved and re-emitted so endpoints keep any
//! hints they sent each other.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Audio payload types the PBX understands natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    Pcmu,
    Pcma,
    Opus,
    TelephoneEvent,
}

impl PayloadType {
    pub fn number(self) -> u8 {
        match self {
            PayloadType::Pcmu => 0,
            PayloadType::Pcma => 8,
            PayloadType::Opus => 111,
            PayloadType::TelephoneEvent => 101,
        }
    }

    pub fn from_number(pt: u8) -> Option<Self> {
        match pt {
            0 => Some(PayloadType::Pcmu),
            8 => Some(PayloadType::Pcma),
            111 => Some(PayloadType::Opus),
            101 => Some(PayloadType::TelephoneEvent),
            _ => None,
        }
    }

    /// Canonical `a=rtpmap` value for this payload.
    pub fn rtpmap(self) -> &'static str {
        match self {
            PayloadType::Pcmu => "PCMU/8000",
            PayloadType::Pcma => "PCMA/8000",
            PayloadType::Opus => "opus/48000/2",
            PayloadType::TelephoneEvent => "telephone-event/8000",
        }
    }

    /// True for the G.711 family, which the relay can transcode.
    pub fn is_g711(self) -> bool {
        matches!(self, PayloadType::Pcmu | PayloadType::Pcma)
    }
}

/// `o=` line fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub sess_id: u64,
    pub sess_version: u64,
    pub addr: IpAddr,
}

impl Default for Origin {
    fn default() -> Self {
        Origin {
            username: "-".into(),
            sess_id: 0,
            sess_version: 0,
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

/// Stream direction attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }
}

/// One `m=` section with its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<u8>,
    pub connection: Option<IpAddr>,
    pub rtpmap: Vec<(u8, String)>,
    pub fmtp: Vec<(u8, String)>,
    pub direction: Option<Direction>,
    pub ptime: Option<u32>,
    pub extra_attributes: Vec<String>,
}

impl MediaDescription {
    /// The rtpmap encoding for a payload number, falling back to the static
    /// assignments for well-known numbers.
    pub fn encoding(&self, pt: u8) -> Option<String> {
        self.rtpmap
            .iter()
            .find(|(n, _)| *n == pt)
            .map(|(_, enc)| enc.clone())
            .or_else(|| PayloadType::from_number(pt).map(|p| p.rtpmap().to_string()))
    }

    /// Intersect the offered formats with the allowed payload set, keeping
    /// the offerer's preference order. Telephone-event is kept whenever the
    /// intersection is non-empty.
    pub fn intersect(&self, allowed: &[PayloadType]) -> Vec<u8> {
        let mut kept: Vec<u8> = self
            .formats
            .iter()
            .copied()
            .filter(|pt| {
                PayloadType::from_number(*pt)
                    .map(|p| p != PayloadType::TelephoneEvent && allowed.contains(&p))
                    .unwrap_or(false)
            })
            .collect();
        if !kept.is_empty() && self.formats.contains(&PayloadType::TelephoneEvent.number()) {
            kept.push(PayloadType::TelephoneEvent.number());
        }
        kept
    }
}

/// A parsed SDP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<IpAddr>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// Build a minimal audio offer/answer the proxy emits on its own behalf.
    pub fn audio(addr: IpAddr, port: u16, formats: &[u8]) -> Self {
        SessionDescription {
            origin: Origin {
                username: "flowpbx".into(),
                sess_id: rand_session_id(),
                sess_version: 1,
                addr,
            },
            session_name: "flowpbx".into(),
            connection: Some(addr),
            media: vec![MediaDescription {
                media_type: "audio".into(),
                port,
                protocol: "RTP/AVP".into(),
                formats: formats.to_vec(),
                connection: None,
                rtpmap: formats
                    .iter()
                    .filter_map(|&pt| {
                        PayloadType::from_number(pt).map(|p| (pt, p.rtpmap().to_string()))
                    })
                    .collect(),
                fmtp: if formats.contains(&PayloadType::TelephoneEvent.number()) {
                    vec![(PayloadType::TelephoneEvent.number(), "0-16".into())]
                } else {
                    Vec::new()
                },
                direction: Some(Direction::SendRecv),
                ptime: Some(20),
                extra_attributes: Vec::new(),
            }],
        }
    }

    /// First audio section, if any.
    pub fn audio_media(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// The effective connection address for the audio section.
    pub fn audio_endpoint(&self) -> Option<(IpAddr, u16)> {
        let media = self.audio_media()?;
        let addr = media.connection.or(self.connection)?;
        Some((addr, media.port))
    }

    /// Point every connection line and the audio port at the proxy, leaving
    /// payload lists and rtpmap associations untouched.
    pub fn rewrite_for_proxy(&mut self, addr: IpAddr, audio_port: u16) {
        self.origin.addr = addr;
        self.origin.sess_version += 1;
        self.connection = Some(addr);
        for media in &mut self.media {
            media.connection = None;
            if media.media_type == "audio" {
                media.port = audio_port;
            }
        }
    }
}

fn rand_session_id() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen_range(1_000_000..u64::MAX / 2)
}

impl FromStr for SessionDescription {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut origin = None;
        let mut session_name = String::from("-");
        let mut connection = None;
        let mut media: Vec<MediaDescription> = Vec::new();
        let mut seen_version = false;

        for line in s.lines().map(str::trim_end) {
            if line.is_empty() {
                continue;
            }
            let (kind, value) = line.split_once('=').ok_or_else(|| {
                Error::InvalidSdp(format!("line without '=': {line:?}"))
            })?;
            match kind {
                "v" => {
                    if value.trim() != "0" {
                        return Err(Error::InvalidSdp(format!("unsupported version {value}")));
                    }
                    seen_version = true;
                }
                "o" => origin = Some(parse_origin(value)?),
                "s" => session_name = value.to_string(),
                "c" => {
                    let addr = parse_connection(value)?;
                    match media.last_mut() {
                        Some(m) => m.connection = Some(addr),
                        None => connection = Some(addr),
                    }
                }
                "m" => media.push(parse_media(value)?),
                "a" => {
                    if let Some(m) = media.last_mut() {
                        parse_media_attribute(m, value);
                    }
                    // Session-level attributes are not interpreted.
                }
                // t=, b=, k= and friends carry nothing the proxy acts on.
                _ => {}
            }
        }

        if !seen_version {
            return Err(Error::InvalidSdp("missing v= line".into()));
        }
        Ok(SessionDescription {
            origin: origin.unwrap_or_default(),
            session_name,
            connection,
            media,
        })
    }
}

fn parse_origin(value: &str) -> Result<Origin> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(Error::InvalidSdp(format!("bad o= line: {value:?}")));
    }
    Ok(Origin {
        username: fields[0].to_string(),
        sess_id: fields[1].parse().unwrap_or(0),
        sess_version: fields[2].parse().unwrap_or(0),
        addr: fields[5]
            .parse()
            .map_err(|_| Error::InvalidSdp(format!("bad origin address {:?}", fields[5])))?,
    })
}

fn parse_connection(value: &str) -> Result<IpAddr> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    match fields.as_slice() {
        ["IN", "IP4" | "IP6", addr] => addr
            .parse()
            .map_err(|_| Error::InvalidSdp(format!("bad c= address {addr:?}"))),
        _ => Err(Error::InvalidSdp(format!("bad c= line: {value:?}"))),
    }
}

fn parse_media(value: &str) -> Result<MediaDescription> {
    let mut fields = value.split_whitespace();
    let media_type = fields
        .next()
        .ok_or_else(|| Error::InvalidSdp("empty m= line".into()))?;
    let port = fields
        .next()
        .and_then(|p| p.split('/').next())
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::InvalidSdp(format!("bad m= port in {value:?}")))?;
    let protocol = fields
        .next()
        .ok_or_else(|| Error::InvalidSdp(format!("missing protocol in {value:?}")))?;
    let formats = fields
        .map(|f| {
            f.parse()
                .map_err(|_| Error::InvalidSdp(format!("non-numeric format {f:?}")))
        })
        .collect::<Result<Vec<u8>>>()?;

    Ok(MediaDescription {
        media_type: media_type.to_string(),
        port,
        protocol: protocol.to_string(),
        formats,
        connection: None,
        rtpmap: Vec::new(),
        fmtp: Vec::new(),
        direction: None,
        ptime: None,
        extra_attributes: Vec::new(),
    })
}

fn parse_media_attribute(media: &mut MediaDescription, value: &str) {
    let (name, rest) = match value.split_once(':') {
        Some((n, r)) => (n, Some(r)),
        None => (value, None),
    };
    match (name, rest) {
        ("rtpmap", Some(rest)) => {
            if let Some((pt, enc)) = rest.split_once(' ') {
                if let Ok(pt) = pt.parse() {
                    media.rtpmap.push((pt, enc.trim().to_string()));
                }
            }
        }
        ("fmtp", Some(rest)) => {
            if let Some((pt, params)) = rest.split_once(' ') {
                if let Ok(pt) = pt.parse() {
                    media.fmtp.push((pt, params.trim().to_string()));
                }
            }
        }
        ("ptime", Some(rest)) => media.ptime = rest.trim().parse().ok(),
        ("sendrecv", None) => media.direction = Some(Direction::SendRecv),
        ("sendonly", None) => media.direction = Some(Direction::SendOnly),
        ("recvonly", None) => media.direction = Some(Direction::RecvOnly),
        ("inactive", None) => media.direction = Some(Direction::Inactive),
        _ => media.extra_attributes.push(value.to_string()),
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v=0\r")?;
        let ip_kind = |addr: &IpAddr| if addr.is_ipv4() { "IP4" } else { "IP6" };
        writeln!(
            f,
            "o={} {} {} IN {} {}\r",
            self.origin.username,
            self.origin.sess_id,
            self.origin.sess_version,
            ip_kind(&self.origin.addr),
            self.origin.addr
        )?;
        writeln!(f, "s={}\r", self.session_name)?;
        if let Some(addr) = &self.connection {
            writeln!(f, "c=IN {} {}\r", ip_kind(addr), addr)?;
        }
        writeln!(f, "t=0 0\r")?;
        for media in &self.media {
            write!(
                f,
                "m={} {} {}",
                media.media_type, media.port, media.protocol
            )?;
            for pt in &media.formats {
                write!(f, " {pt}")?;
            }
            writeln!(f, "\r")?;
            if let Some(addr) = &media.connection {
                writeln!(f, "c=IN {} {}\r", ip_kind(addr), addr)?;
            }
            for (pt, enc) in &media.rtpmap {
                writeln!(f, "a=rtpmap:{pt} {enc}\r")?;
            }
            for (pt, params) in &media.fmtp {
                writeln!(f, "a=fmtp:{pt} {params}\r")?;
            }
            if let Some(ptime) = media.ptime {
                writeln!(f, "a=ptime:{ptime}\r")?;
            }
            if let Some(direction) = media.direction {
                writeln!(f, "a={}\r", direction.as_str())?;
            }
            for attr in &media.extra_attributes {
                writeln!(f, "a={attr}\r")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OFFER: &str = "v=0\r\n\
        o=phone 1234 1 IN IP4 192.168.1.20\r\n\
        s=call\r\n\
        c=IN IP4 192.168.1.20\r\n\
        t=0 0\r\n\
        m=audio 49170 RTP/AVP 0 8 111 101\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=rtpmap:101 telephone-event/8000\r\n\
        a=fmtp:101 0-16\r\n\
        a=sendrecv\r\n";

    #[test]
    fn parses_offer() {
        let sdp: SessionDescription = OFFER.parse().unwrap();
        assert_eq!(
            sdp.audio_endpoint(),
            Some(("192.168.1.20".parse().unwrap(), 49170))
        );
        let audio = sdp.audio_media().unwrap();
        assert_eq!(audio.formats, vec![0, 8, 111, 101]);
        assert_eq!(audio.encoding(111).as_deref(), Some("opus/48000/2"));
    }

    #[test]
    fn intersect_keeps_offer_order_and_dtmf() {
        let sdp: SessionDescription = OFFER.parse().unwrap();
        let audio = sdp.audio_media().unwrap();
        let kept = audio.intersect(&[PayloadType::Pcma, PayloadType::Pcmu]);
        assert_eq!(kept, vec![0, 8, 101]);
    }

    #[test]
    fn intersect_empty_when_no_codec_shared() {
        let sdp: SessionDescription = "v=0\r\nm=audio 4000 RTP/AVP 111 101\r\n"
            .parse()
            .unwrap();
        let audio = sdp.audio_media().unwrap();
        assert!(audio.intersect(&[PayloadType::Pcmu]).is_empty());
    }

    #[test]
    fn rewrite_points_at_proxy_and_preserves_rtpmap() {
        let mut sdp: SessionDescription = OFFER.parse().unwrap();
        let before_rtpmap = sdp.audio_media().unwrap().rtpmap.clone();
        sdp.rewrite_for_proxy("203.0.113.9".parse().unwrap(), 10002);
        assert_eq!(
            sdp.audio_endpoint(),
            Some(("203.0.113.9".parse().unwrap(), 10002))
        );
        assert_eq!(sdp.audio_media().unwrap().rtpmap, before_rtpmap);
        assert_eq!(sdp.audio_media().unwrap().formats, vec![0, 8, 111, 101]);
    }

    #[test]
    fn display_round_trips() {
        let sdp: SessionDescription = OFFER.parse().unwrap();
        let reparsed: SessionDescription = sdp.to_string().parse().unwrap();
        assert_eq!(sdp, reparsed);
    }

    #[test]
    fn rejects_bad_version() {
        assert!("v=1\r\n".parse::<SessionDescription>().is_err());
        assert!("m=audio x RTP/AVP 0\r\n".parse::<SessionDescription>().is_err());
    }

    #[test]
    fn proxy_offer_contains_expected_lines() {
        let sdp = SessionDescription::audio("10.0.0.1".parse().unwrap(), 10004, &[8, 101]);
        let text = sdp.to_string();
        assert!(text.contains("m=audio 10004 RTP/AVP 8 101\r"));
        assert!(text.contains("a=rtpmap:8 PCMA/8000\r"));
        assert!(text.contains("a=fmtp:101 0-16\r"));
    }
}
