//! Dialog identity and state

use std::fmt;

use flowpbx_sip_core::{Headers, StatusCode};

/// RFC 3261 dialog identity: Call-ID plus both tags. The remote tag is
/// empty for early server-side state before the peer is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        DialogId {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Extract the UAS-perspective dialog id from an in-dialog request:
    /// our tag is on To, the peer's on From.
    pub fn from_uas_request(headers: &Headers) -> Option<DialogId> {
        let call_id = headers.call_id().ok()?.to_string();
        let to = headers.to_addr().ok()?;
        let from = headers.from_addr().ok()?;
        Some(DialogId {
            call_id,
            local_tag: to.tag().unwrap_or_default().to_string(),
            remote_tag: from.tag().unwrap_or_default().to_string(),
        })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Why a dialog ended. Every dialog reaches exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    /// We sent BYE.
    LocalBye,
    /// The peer sent BYE.
    RemoteBye,
    /// The caller cancelled before answer.
    Cancelled,
    /// A final non-2xx ended the attempt.
    Rejected(StatusCode),
    /// Negotiated session timer lapsed without a refresh.
    SessionExpired,
    /// Another forked leg won the race.
    CompletedElsewhere,
    /// Transport or internal failure.
    Failed(String),
}

impl TerminationCause {
    /// Short cause string recorded in the call detail record.
    pub fn as_str(&self) -> &str {
        match self {
            TerminationCause::LocalBye => "normal clearing",
            TerminationCause::RemoteBye => "normal clearing",
            TerminationCause::Cancelled => "originator cancel",
            TerminationCause::Rejected(_) => "call rejected",
            TerminationCause::SessionExpired => "session expired",
            TerminationCause::CompletedElsewhere => "call completed elsewhere",
            TerminationCause::Failed(_) => "failure",
        }
    }
}

/// Server-side call state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UasState {
    /// INVITE received, provisional responses flowing.
    Proceeding,
    /// 200 sent, waiting for ACK.
    Answered,
    /// ACK seen; dialog confirmed.
    Confirmed,
    /// Final; the cause is recorded once and never changes.
    Terminated(TerminationCause),
}

impl UasState {
    pub fn name(&self) -> &'static str {
        match self {
            UasState::Proceeding => "proceeding",
            UasState::Answered => "answered",
            UasState::Confirmed => "confirmed",
            UasState::Terminated(_) => "terminated",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, UasState::Terminated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpbx_sip_core::HeaderName;

    #[test]
    fn uas_dialog_id_from_headers() {
        let mut headers = Headers::new();
        headers.push(HeaderName::CallId, "abc");
        headers.push(HeaderName::From, "<sip:a@x>;tag=ft");
        headers.push(HeaderName::To, "<sip:b@y>;tag=tt");
        let id = DialogId::from_uas_request(&headers).unwrap();
        assert_eq!(id.call_id, "abc");
        assert_eq!(id.local_tag, "tt");
        assert_eq!(id.remote_tag, "ft");
    }

    #[test]
    fn termination_cause_strings() {
        assert_eq!(TerminationCause::SessionExpired.as_str(), "session expired");
        assert_eq!(
            TerminationCause::CompletedElsewhere.as_str(),
            "call completed elsewhere"
        );
    }
}
