//! Wire-format SIP message parser
//!
//! The parser is strict: a message that cannot be fully interpreted is an
//! error, never a partially-populated value. Obsolete header line folding is
//! accepted on input (continuation lines are unfolded into the previous
//! header) since several deskphone firmwares still emit it.

use bytes::Bytes;
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::digit1,
    sequence::tuple,
    IResult,
};

use crate::error::{Error, Result};
use crate::types::headers::{HeaderName, Headers};
use crate::types::message::{Message, Request, Response};
use crate::types::status::StatusCode;
use crate::SIP_VERSION;

/// Parse a complete SIP message from a datagram or framed stream segment.
pub fn parse_message(input: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(input)
        .map_err(|_| Error::Parse("message is not valid UTF-8".into()))?;

    let (head, body_raw) = match text.split_once("\r\n\r\n") {
        Some((head, body)) => (head, body.as_bytes()),
        None => return Err(Error::Parse("missing header terminator".into())),
    };

    let mut lines = head.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::Parse("empty start line".into()))?;

    let headers = parse_headers(lines)?;

    // The body is bounded by Content-Length when present; a length that
    // exceeds the available bytes means a truncated message.
    let body = match headers.content_length() {
        Some(len) if len > body_raw.len() => {
            return Err(Error::Parse(format!(
                "Content-Length {len} exceeds available body of {}",
                body_raw.len()
            )));
        }
        Some(len) => Bytes::copy_from_slice(&body_raw[..len]),
        None => Bytes::copy_from_slice(body_raw),
    };

    if start_line.starts_with(SIP_VERSION) {
        let (status, reason) = parse_status_line(start_line)?;
        let response = Response {
            status,
            reason,
            headers,
            body,
        };
        response.headers.call_id()?;
        response.headers.cseq()?;
        Ok(Message::Response(response))
    } else {
        let (method, uri) = parse_request_line(start_line)?;
        let request = Request {
            method: method.parse()?,
            uri: uri.parse()?,
            headers,
            body,
        };
        // A request without the dialog-identifying headers is useless to
        // every downstream component; fail it here.
        request.headers.call_id()?;
        request.headers.cseq()?;
        request.headers.from_addr()?;
        request.headers.to_addr()?;
        Ok(Message::Request(request))
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut current: Option<(HeaderName, String)> = None;

    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            match &mut current {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(Error::Parse("continuation before first header".into())),
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.push(name, value);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Parse(format!("header line without colon: {line:?}")))?;
        if name.trim().is_empty() {
            return Err(Error::Parse("empty header name".into()));
        }
        current = Some((HeaderName::parse(name), value.trim().to_string()));
    }
    if let Some((name, value)) = current {
        headers.push(name, value);
    }
    Ok(headers)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace())(input)
}

fn parse_request_line(line: &str) -> Result<(&str, &str)> {
    let result: IResult<&str, (&str, &str, &str, &str, &str)> =
        tuple((token, tag(" "), token, tag(" "), tag(SIP_VERSION)))(line);
    match result {
        Ok(("", (method, _, uri, _, _))) => Ok((method, uri)),
        _ => Err(Error::Parse(format!("malformed request line: {line:?}"))),
    }
}

fn parse_status_line(line: &str) -> Result<(StatusCode, String)> {
    let result: IResult<&str, (&str, &str, &str)> =
        tuple((tag(SIP_VERSION), tag(" "), digit1))(line);
    match result {
        Ok((rest, (_, _, code))) => {
            let code: u16 = code
                .parse()
                .map_err(|_| Error::Parse(format!("bad status code in {line:?}")))?;
            if !(100..700).contains(&code) {
                return Err(Error::Parse(format!("status code out of range: {code}")));
            }
            Ok((StatusCode(code), rest.trim().to_string()))
        }
        Err(_) => Err(Error::Parse(format!("malformed status line: {line:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::method::Method;
    use pretty_assertions::assert_eq;

    const REGISTER: &str = "REGISTER sip:pbx.local SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.20:5060;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:201@pbx.local>;tag=456248\r\n\
        To: <sip:201@pbx.local>\r\n\
        Call-ID: 843817637684230@998sdasdh09\r\n\
        CSeq: 1826 REGISTER\r\n\
        Contact: <sip:201@192.168.1.20:5060>\r\n\
        Expires: 7200\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn parses_register_request() {
        let msg = parse_message(REGISTER.as_bytes()).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.method, Method::Register);
        assert_eq!(req.uri.host, "pbx.local");
        assert_eq!(req.headers.expires(), Some(7200));
        assert_eq!(req.headers.cseq().unwrap(), (1826, Method::Register));
    }

    #[test]
    fn parses_response_with_body() {
        let text = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\r\n\
            From: <sip:a@x>;tag=1\r\n\
            To: <sip:b@y>;tag=2\r\n\
            Call-ID: c1\r\n\
            CSeq: 2 INVITE\r\n\
            Content-Type: application/sdp\r\n\
            Content-Length: 4\r\n\r\nv=0\r\n";
        let msg = parse_message(text.as_bytes()).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body.as_ref(), b"v=0\r");
    }

    #[test]
    fn unfolds_continuation_lines() {
        let text = "OPTIONS sip:pbx.local SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
            From: <sip:a@x>;tag=1\r\n\
            To: <sip:b@y>\r\n\
            Call-ID: c2\r\n\
            CSeq: 1 OPTIONS\r\n\
            Subject: first part\r\n\
            \tsecond part\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = parse_message(text.as_bytes()).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(
            req.headers.get(&HeaderName::Other("Subject".into())),
            Some("first part second part")
        );
    }

    #[test]
    fn truncated_body_is_rejected() {
        let text = "SIP/2.0 200 OK\r\n\
            From: <sip:a@x>;tag=1\r\nTo: <sip:b@y>\r\nCall-ID: c1\r\nCSeq: 1 BYE\r\n\
            Content-Length: 10\r\n\r\nshort";
        assert!(parse_message(text.as_bytes()).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_message(b"\x00\x01\x02").is_err());
        assert!(parse_message(b"GET / HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_message(b"INVITE\r\n\r\n").is_err());
    }

    #[test]
    fn request_without_call_id_is_rejected() {
        let text = "INVITE sip:x@y SIP/2.0\r\n\
            From: <sip:a@x>;tag=1\r\nTo: <sip:b@y>\r\nCSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        assert!(parse_message(text.as_bytes()).is_err());
    }

    #[test]
    fn serialises_back_to_wire_form() {
        let msg = parse_message(REGISTER.as_bytes()).unwrap();
        let bytes = msg.to_bytes();
        let reparsed = parse_message(&bytes).unwrap();
        assert_eq!(msg, reparsed);
    }
}
