//! SIP requests, responses and the message envelope

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::headers::{HeaderName, Headers};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;
use crate::SIP_VERSION;

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.set(HeaderName::ContentType, content_type);
        self.body = body.into();
        self
    }

    /// Build a response to this request, copying the headers a UAS must
    /// mirror: all Vias, From, To, Call-ID and CSeq.
    pub fn response(&self, status: StatusCode) -> Response {
        let mut headers = Headers::new();
        for via in self.headers.get_all(&HeaderName::Via) {
            headers.push(HeaderName::Via, via);
        }
        for name in [HeaderName::From, HeaderName::To, HeaderName::CallId, HeaderName::CSeq] {
            if let Some(value) = self.headers.get(&name) {
                headers.push(name, value);
            }
        }
        Response {
            status,
            reason: status.reason().to_string(),
            headers,
            body: Bytes::new(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.uri.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(SIP_VERSION.as_bytes());
        buf.put_slice(b"\r\n");
        write_headers_and_body(&mut buf, &self.headers, &self.body);
        buf.freeze()
    }
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.set(HeaderName::ContentType, content_type);
        self.body = body.into();
        self
    }

    /// Ensure the To header carries a tag, generating one when absent.
    /// Returns the tag in effect.
    pub fn ensure_to_tag(&mut self) -> String {
        if let Ok(mut to) = self.headers.to_addr() {
            if let Some(tag) = to.tag() {
                return tag.to_string();
            }
            let tag = crate::random_token(10);
            to.set_tag(tag.clone());
            self.headers.set(HeaderName::To, to.to_string());
            tag
        } else {
            String::new()
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(SIP_VERSION.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.as_u16().to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.reason.as_bytes());
        buf.put_slice(b"\r\n");
        write_headers_and_body(&mut buf, &self.headers, &self.body);
        buf.freeze()
    }
}

fn write_headers_and_body(buf: &mut BytesMut, headers: &Headers, body: &Bytes) {
    let mut wrote_length = false;
    for (name, value) in headers.iter() {
        if *name == HeaderName::ContentLength {
            // Content-Length always reflects the actual body.
            buf.put_slice(b"Content-Length: ");
            buf.put_slice(body.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            wrote_length = true;
            continue;
        }
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    if !wrote_length {
        buf.put_slice(b"Content-Length: ");
        buf.put_slice(body.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
}

/// Either kind of SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(r) => r.to_bytes(),
            Message::Response(r) => r.to_bytes(),
        }
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Request(_) => None,
            Message::Response(r) => Some(r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        Request::new(Method::Invite, "sip:100@pbx.local".parse().unwrap())
            .with_header(HeaderName::Via, "SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKtest")
            .with_header(HeaderName::From, "<sip:caller@10.0.0.2>;tag=from1")
            .with_header(HeaderName::To, "<sip:100@pbx.local>")
            .with_header(HeaderName::CallId, "call-1@10.0.0.2")
            .with_header(HeaderName::CSeq, "1 INVITE")
    }

    #[test]
    fn request_serialises_with_content_length() {
        let bytes = sample_request().to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("INVITE sip:100@pbx.local SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_mirrors_request_headers() {
        let req = sample_request();
        let resp = req.response(StatusCode::RINGING);
        assert_eq!(resp.headers.call_id().unwrap(), "call-1@10.0.0.2");
        assert_eq!(resp.headers.cseq().unwrap(), (1, Method::Invite));
        assert_eq!(
            resp.headers.get(&HeaderName::Via).unwrap(),
            "SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKtest"
        );
    }

    #[test]
    fn ensure_to_tag_is_stable() {
        let req = sample_request();
        let mut resp = req.response(StatusCode::OK);
        let tag = resp.ensure_to_tag();
        assert!(!tag.is_empty());
        assert_eq!(resp.ensure_to_tag(), tag);
    }

    #[test]
    fn content_length_tracks_body() {
        let resp = sample_request()
            .response(StatusCode::OK)
            .with_body("application/sdp", &b"v=0\r\n"[..]);
        let text = String::from_utf8(resp.to_bytes().to_vec()).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Content-Type: application/sdp\r\n"));
    }
}
