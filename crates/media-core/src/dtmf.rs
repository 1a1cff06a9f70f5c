//! DTMF event surfacing
//!
//! Digits reach the flow engine on two paths: RFC 2833 telephone-event
//! packets picked out of the RTP stream, and SIP INFO bodies parsed by the
//! signaling layer. Both feed the same per-call channel and are
//! deduplicated by (timestamp, digit).

use tokio::sync::mpsc;
use tracing::trace;

use crate::rtp::TelephoneEvent;

/// How a digit arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfSource {
    Rtp,
    SipInfo,
}

/// One finalised DTMF digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    pub digit: char,
    /// RTP timestamp for RFC 2833 events; wall-derived milliseconds for
    /// SIP INFO.
    pub timestamp: u32,
    pub source: DtmfSource,
}

/// Parse the body of a SIP INFO carrying DTMF.
///
/// Accepts both `application/dtmf-relay` (`Signal=5`) and bare
/// `application/dtmf` bodies (just the digit).
pub fn parse_info_body(body: &str) -> Option<char> {
    let body = body.trim();
    if body.len() == 1 {
        let c = body.chars().next()?;
        return TelephoneEvent::code_for(c).map(|_| c.to_ascii_uppercase());
    }
    for line in body.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if key.trim().eq_ignore_ascii_case("signal") {
                let c = value.trim().chars().next()?;
                return TelephoneEvent::code_for(c).map(|_| c.to_ascii_uppercase());
            }
        }
    }
    None
}

/// Per-call DTMF fan-in with duplicate suppression.
///
/// RFC 2833 senders repeat the end-of-event packet three times for loss
/// robustness; INFO and in-band paths can double-report the same digit.
pub struct DtmfDetector {
    tx: mpsc::Sender<DtmfEvent>,
    last: Option<(u32, char)>,
}

impl DtmfDetector {
    /// Create a detector and the receiving half handed to the flow engine.
    pub fn channel(capacity: usize) -> (DtmfDetector, mpsc::Receiver<DtmfEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (DtmfDetector { tx, last: None }, rx)
    }

    /// Feed an RTP telephone-event payload. Only end-of-event packets
    /// finalise a digit.
    pub fn on_telephone_event(&mut self, event: TelephoneEvent, rtp_timestamp: u32) {
        if !event.end {
            return;
        }
        let digit = match event.digit() {
            Some(digit) => digit,
            None => return,
        };
        self.push(DtmfEvent {
            digit,
            timestamp: rtp_timestamp,
            source: DtmfSource::Rtp,
        });
    }

    /// Feed a digit from a SIP INFO body.
    pub fn on_info_digit(&mut self, digit: char, timestamp: u32) {
        self.push(DtmfEvent {
            digit,
            timestamp,
            source: DtmfSource::SipInfo,
        });
    }

    fn push(&mut self, event: DtmfEvent) {
        if self.last == Some((event.timestamp, event.digit)) {
            trace!("suppressing duplicate DTMF {}", event.digit);
            return;
        }
        self.last = Some((event.timestamp, event.digit));
        // A full buffer means the flow task is not collecting; dropping is
        // correct, queuing stale digits is not.
        let _ = self.tx.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(end: bool) -> TelephoneEvent {
        TelephoneEvent {
            event: 5,
            end,
            volume: 10,
            duration: 160,
        }
    }

    #[tokio::test]
    async fn end_packets_finalise_digits() {
        let (mut detector, mut rx) = DtmfDetector::channel(8);
        detector.on_telephone_event(event(false), 1000);
        detector.on_telephone_event(event(false), 1000);
        detector.on_telephone_event(event(true), 1000);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.digit, '5');
        assert_eq!(got.source, DtmfSource::Rtp);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_end_packets_deduplicated() {
        let (mut detector, mut rx) = DtmfDetector::channel(8);
        for _ in 0..3 {
            detector.on_telephone_event(event(true), 2000);
        }
        assert_eq!(rx.recv().await.unwrap().digit, '5');
        assert!(rx.try_recv().is_err());

        // A new timestamp is a new key press.
        detector.on_telephone_event(event(true), 3600);
        assert_eq!(rx.recv().await.unwrap().digit, '5');
    }

    #[tokio::test]
    async fn info_and_rtp_share_dedup() {
        let (mut detector, mut rx) = DtmfDetector::channel(8);
        detector.on_info_digit('7', 500);
        detector.on_info_digit('7', 500);
        assert_eq!(rx.recv().await.unwrap().source, DtmfSource::SipInfo);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn info_body_parsing() {
        assert_eq!(parse_info_body("Signal=5\r\nDuration=160"), Some('5'));
        assert_eq!(parse_info_body("signal = *"), Some('*'));
        assert_eq!(parse_info_body("4"), Some('4'));
        assert_eq!(parse_info_body("Signal=x"), None);
        assert_eq!(parse_info_body(""), None);
    }
}
