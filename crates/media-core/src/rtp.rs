//! RTP packet encoding/decoding and the telephone-event payload

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Fixed RTP header length without CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

/// Samples per 20 ms frame at 8 kHz.
pub const FRAME_SAMPLES: usize = 160;

/// 20 ms frame duration used across the relay and the mixer.
pub const FRAME_DURATION: std::time::Duration = std::time::Duration::from_millis(20);

/// Parsed 12-byte RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// One RTP packet, payload zero-copied out of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parse a datagram. Header extensions and padding are honoured;
    /// CSRC lists are skipped.
    pub fn parse(data: &[u8]) -> Result<RtpPacket> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Error::BadRtp(format!("short packet: {} bytes", data.len())));
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(Error::BadRtp(format!("unsupported version {version}")));
        }
        let padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if has_extension {
            if data.len() < offset + 4 {
                return Err(Error::BadRtp("truncated extension header".into()));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }
        if data.len() < offset {
            return Err(Error::BadRtp("header overruns packet".into()));
        }

        let mut end = data.len();
        if padding {
            let pad = *data.last().unwrap_or(&0) as usize;
            if pad == 0 || offset + pad > end {
                return Err(Error::BadRtp("invalid padding length".into()));
            }
            end -= pad;
        }

        Ok(RtpPacket {
            header: RtpHeader {
                payload_type,
                marker,
                sequence,
                timestamp,
                ssrc,
            },
            payload: Bytes::copy_from_slice(&data[offset..end]),
        })
    }

    /// Serialise to wire bytes with no CSRCs, extension or padding.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + self.payload.len());
        buf.put_u8(0x80);
        buf.put_u8((self.header.payload_type & 0x7f) | if self.header.marker { 0x80 } else { 0 });
        buf.put_u16(self.header.sequence);
        buf.put_u32(self.header.timestamp);
        buf.put_u32(self.header.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// RFC 2833/4733 telephone-event payload (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    pub end: bool,
    pub volume: u8,
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn parse(payload: &[u8]) -> Result<TelephoneEvent> {
        if payload.len() < 4 {
            return Err(Error::BadRtp("telephone-event payload too short".into()));
        }
        Ok(TelephoneEvent {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3f,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let [d0, d1] = self.duration.to_be_bytes();
        [
            self.event,
            (self.volume & 0x3f) | if self.end { 0x80 } else { 0 },
            d0,
            d1,
        ]
    }

    /// The DTMF digit for this event code, if it names one.
    pub fn digit(&self) -> Option<char> {
        match self.event {
            0..=9 => Some((b'0' + self.event) as char),
            10 => Some('*'),
            11 => Some('#'),
            12..=15 => Some((b'A' + self.event - 12) as char),
            _ => None,
        }
    }

    /// Event code for a DTMF digit character.
    pub fn code_for(digit: char) -> Option<u8> {
        match digit.to_ascii_uppercase() {
            '0'..='9' => Some(digit as u8 - b'0'),
            '*' => Some(10),
            '#' => Some(11),
            'A'..='D' => Some(digit.to_ascii_uppercase() as u8 - b'A' + 12),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let packet = RtpPacket {
            header: RtpHeader {
                payload_type: 8,
                marker: true,
                sequence: 4242,
                timestamp: 160_000,
                ssrc: 0xdead_beef,
            },
            payload: Bytes::from_static(&[0x55; 160]),
        };
        let parsed = RtpPacket::parse(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn rejects_short_and_wrong_version() {
        assert!(RtpPacket::parse(&[0x80, 0]).is_err());
        let mut bytes = vec![0u8; 20];
        bytes[0] = 0x40; // version 1
        assert!(RtpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn skips_csrc_and_extension() {
        // Header with 1 CSRC and a 1-word extension.
        let mut bytes = vec![0u8; 0];
        bytes.push(0x80 | 0x10 | 0x01);
        bytes.push(0);
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&9u32.to_be_bytes()); // CSRC
        bytes.extend_from_slice(&[0, 0, 0, 1]); // extension: id 0, 1 word
        bytes.extend_from_slice(&[0xaa; 4]); // extension body
        bytes.extend_from_slice(&[1, 2, 3]); // payload
        let packet = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(packet.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn telephone_event_digits() {
        let event = TelephoneEvent::parse(&[5, 0x8a, 0x01, 0x40]).unwrap();
        assert_eq!(event.digit(), Some('5'));
        assert!(event.end);
        assert_eq!(event.volume, 10);
        assert_eq!(event.duration, 320);

        assert_eq!(TelephoneEvent::parse(&[10, 0, 0, 0]).unwrap().digit(), Some('*'));
        assert_eq!(TelephoneEvent::parse(&[11, 0, 0, 0]).unwrap().digit(), Some('#'));
        assert_eq!(TelephoneEvent::parse(&[20, 0, 0, 0]).unwrap().digit(), None);
    }

    #[test]
    fn digit_codes_round_trip() {
        for d in ['0', '9', '*', '#', 'A', 'D'] {
            let code = TelephoneEvent::code_for(d).unwrap();
            let event = TelephoneEvent {
                event: code,
                end: true,
                volume: 10,
                duration: 160,
            };
            assert_eq!(TelephoneEvent::parse(&event.to_bytes()).unwrap().digit(), Some(d));
        }
    }
}
