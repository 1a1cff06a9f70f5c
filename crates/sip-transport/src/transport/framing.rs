//! Content-Length delimited framing for stream transports

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Upper bound on a single framed message, guarding the connection buffer.
pub(crate) const MAX_FRAME: usize = 64 * 1024;

/// Try to pull one complete SIP message off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Leading CRLF pairs (SIP
/// stream keep-alives) are consumed silently.
pub(crate) fn extract_frame(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    while buf.len() >= 2 && &buf[..2] == b"\r\n" {
        buf.advance(2);
    }
    if buf.is_empty() {
        return Ok(None);
    }

    let head_end = match find_header_end(buf) {
        Some(end) => end,
        None => {
            if buf.len() > MAX_FRAME {
                return Err(Error::FrameTooLarge {
                    size: buf.len(),
                    limit: MAX_FRAME,
                });
            }
            return Ok(None);
        }
    };

    let body_len = content_length(&buf[..head_end]).unwrap_or(0);
    let total = head_end + 4 + body_len;
    if total > MAX_FRAME {
        return Err(Error::FrameTooLarge {
            size: total,
            limit: MAX_FRAME,
        });
    }
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(buf.split_to(total).freeze()))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Scan the raw header block for Content-Length (or its compact form `l`).
fn content_length(head: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(head).ok()?;
    for line in text.split("\r\n").skip(1) {
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn incomplete_head_waits() {
        let mut b = buf(b"OPTIONS sip:x SIP/2.0\r\nCall-ID: 1\r\n");
        assert!(extract_frame(&mut b).unwrap().is_none());
    }

    #[test]
    fn frame_without_body() {
        let wire = b"OPTIONS sip:x SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let mut b = buf(wire);
        let frame = extract_frame(&mut b).unwrap().unwrap();
        assert_eq!(frame.as_ref(), wire.as_ref());
        assert!(b.is_empty());
    }

    #[test]
    fn frame_with_body_and_pipelined_next() {
        let mut b = buf(b"INVITE sip:x SIP/2.0\r\nl: 4\r\n\r\nabcdOPTIONS");
        let frame = extract_frame(&mut b).unwrap().unwrap();
        assert!(frame.ends_with(b"abcd"));
        assert_eq!(b.as_ref(), b"OPTIONS");
    }

    #[test]
    fn keepalive_crlf_skipped() {
        let mut b = buf(b"\r\n\r\nBYE sip:x SIP/2.0\r\nl: 0\r\n\r\n");
        let frame = extract_frame(&mut b).unwrap().unwrap();
        assert!(frame.starts_with(b"BYE"));
    }

    #[test]
    fn body_not_yet_complete_waits() {
        let mut b = buf(b"INVITE sip:x SIP/2.0\r\nContent-Length: 10\r\n\r\nabc");
        assert!(extract_frame(&mut b).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut big = BytesMut::from(&b"INVITE sip:x SIP/2.0\r\nContent-Length: 100000\r\n\r\n"[..]);
        assert!(matches!(
            extract_frame(&mut big),
            Err(Error::FrameTooLarge { .. })
        ));
    }
}
