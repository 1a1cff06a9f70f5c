//! Server-side (UAS) call handling
//!
//! Each inbound INVITE gets a [`ServerCall`]: the dialog state machine for
//! the caller-facing leg. SIP events for the call are serialised through a
//! per-call mailbox task owned by the [`DialogManager`](crate::DialogManager);
//! the call surfaces hangup/cancel/DTMF to its owner as [`CallSignal`]s.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use flowpbx_sip_core::{
    random_token, Address, HeaderName, Method, Request, Response, StatusCode, Uri,
};
use flowpbx_sip_transport::TransportHandle;

use crate::dialog::{DialogId, TerminationCause, UasState};
use crate::error::{Error, Result};

/// Smallest session-timer interval we accept.
const MIN_SESSION_EXPIRES: u32 = 90;

/// Events a call surfaces to its owning task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSignal {
    /// CANCEL before answer; the 487 has already been sent.
    Cancelled,
    /// In-dialog BYE from the peer; the 200 has already been sent.
    ByeReceived,
    /// DTMF digit via SIP INFO.
    Digit(char),
    /// Session timer lapsed without a refresh.
    SessionExpired,
}

/// The UAS leg of one inbound call.
pub struct ServerCall {
    request: Request,
    handle: TransportHandle,
    local_tag: String,
    contact: Address,
    state: Mutex<UasState>,
    local_cseq: AtomicU32,
    signals: mpsc::Sender<CallSignal>,
    /// Negotiated session-timer interval, if any.
    session_interval: Mutex<Option<Duration>>,
    /// Bumped on every refresh; the timer task watches it.
    refresh_tx: watch::Sender<u32>,
    /// Answer SDP, replayed on refresh re-INVITEs.
    answer_sdp: Mutex<Option<Bytes>>,
}

impl ServerCall {
    pub fn new(
        request: Request,
        handle: TransportHandle,
        contact: Address,
    ) -> (Arc<ServerCall>, mpsc::Receiver<CallSignal>) {
        let (signals, signals_rx) = mpsc::channel(16);
        let (refresh_tx, _) = watch::channel(0);
        let call = Arc::new(ServerCall {
            request,
            handle,
            local_tag: random_token(10),
            contact,
            state: Mutex::new(UasState::Proceeding),
            local_cseq: AtomicU32::new(0),
            signals,
            session_interval: Mutex::new(None),
            refresh_tx,
            answer_sdp: Mutex::new(None),
        });
        (call, signals_rx)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn call_id(&self) -> &str {
        self.request.headers.get(&HeaderName::CallId).unwrap_or("")
    }

    pub fn dialog_id(&self) -> DialogId {
        let remote_tag = self
            .request
            .headers
            .from_addr()
            .ok()
            .and_then(|f| f.tag().map(str::to_string))
            .unwrap_or_default();
        DialogId::new(self.call_id(), self.local_tag.clone(), remote_tag)
    }

    pub fn state(&self) -> UasState {
        self.state.lock().clone()
    }

    /// The transport path back to the caller.
    pub fn transport(&self) -> &TransportHandle {
        &self.handle
    }

    fn response(&self, status: StatusCode) -> Response {
        let mut resp = self.request.response(status);
        if let Ok(mut to) = resp.headers.to_addr() {
            if to.tag().is_none() {
                to.set_tag(self.local_tag.clone());
                resp.headers.set(HeaderName::To, to.to_string());
            }
        }
        resp
    }

    /// 100 Trying; fired straight off the dispatch path.
    pub async fn send_trying(&self) -> Result<()> {
        self.handle.send(&self.response(StatusCode::TRYING).into()).await?;
        Ok(())
    }

    /// 180 Ringing.
    pub async fn ring(&self) -> Result<()> {
        if self.state.lock().is_terminated() {
            return Ok(());
        }
        self.handle
            .send(&self.response(StatusCode::RINGING).into())
            .await?;
        Ok(())
    }

    /// 183 with early media SDP.
    pub async fn progress(&self, sdp: Bytes) -> Result<()> {
        if self.state.lock().is_terminated() {
            return Ok(());
        }
        let resp = self
            .response(StatusCode::SESSION_PROGRESS)
            .with_body("application/sdp", sdp);
        self.handle.send(&resp.into()).await?;
        Ok(())
    }

    /// Answer with the committed SDP. Valid once, from `Proceeding`.
    pub async fn answer(&self, sdp: Bytes) -> Result<()> {
        {
            let mut state = self.state.lock();
            match &*state {
                UasState::Proceeding => *state = UasState::Answered,
                other => {
                    return Err(Error::InvalidState {
                        state: other.name(),
                        needed: "proceeding",
                    })
                }
            }
        }
        // Honour a requested session timer at answer time.
        if let Some(interval) = self.requested_session_interval() {
            *self.session_interval.lock() = Some(interval);
        }

        let mut resp = self
            .response(StatusCode::OK)
            .with_body("application/sdp", sdp.clone());
        resp.headers
            .push(HeaderName::Contact, self.contact.to_string());
        if let Some(interval) = *self.session_interval.lock() {
            resp.headers.push(
                HeaderName::SessionExpires,
                format!("{};refresher=uac", interval.as_secs()),
            );
        }
        *self.answer_sdp.lock() = Some(sdp);
        self.handle.send(&resp.into()).await?;
        Ok(())
    }

    /// Final non-2xx. Valid from `Proceeding`.
    pub async fn reject(&self, status: StatusCode) -> Result<()> {
        {
            let mut state = self.state.lock();
            match &*state {
                UasState::Proceeding => {
                    *state = UasState::Terminated(TerminationCause::Rejected(status))
                }
                other => {
                    return Err(Error::InvalidState {
                        state: other.name(),
                        needed: "proceeding",
                    })
                }
            }
        }
        self.handle.send(&self.response(status).into()).await?;
        Ok(())
    }

    /// Hang up a confirmed call from our side.
    pub async fn bye(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match &*state {
                UasState::Answered | UasState::Confirmed => {
                    *state = UasState::Terminated(TerminationCause::LocalBye)
                }
                UasState::Terminated(_) => return Ok(()),
                other => {
                    return Err(Error::InvalidState {
                        state: other.name(),
                        needed: "confirmed",
                    })
                }
            }
        }
        let bye = self.in_dialog_request(Method::Bye);
        self.handle.send(&bye.into()).await?;
        Ok(())
    }

    /// Blind transfer: REFER the caller at `target`.
    pub async fn refer(&self, target: &Uri) -> Result<()> {
        if !matches!(*self.state.lock(), UasState::Confirmed | UasState::Answered) {
            return Err(Error::InvalidState {
                state: self.state.lock().name(),
                needed: "confirmed",
            });
        }
        let mut refer = self.in_dialog_request(Method::Refer);
        refer
            .headers
            .push(HeaderName::ReferTo, format!("<{target}>"));
        self.handle.send(&refer.into()).await?;
        Ok(())
    }

    /// Build an in-dialog request towards the caller.
    fn in_dialog_request(&self, method: Method) -> Request {
        let cseq = self.local_cseq.fetch_add(1, Ordering::AcqRel) + 1;
        // Target the caller's advertised contact, falling back to the
        // request source learned by the transport.
        let target_uri = self
            .request
            .headers
            .contacts()
            .ok()
            .and_then(|c| c.into_iter().next())
            .map(|c| c.uri)
            .unwrap_or_else(|| Uri::sip_addr("caller", self.handle.peer()));

        let method_name = method.as_str().to_string();
        let mut req = Request::new(method, target_uri);
        req.headers.push(
            HeaderName::Via,
            format!(
                "SIP/2.0/{} {};branch={}{}",
                self.handle.kind().via_token(),
                self.contact.uri.host_port(),
                flowpbx_sip_core::types::headers::Via::BRANCH_COOKIE,
                random_token(12)
            ),
        );
        req.headers.push(HeaderName::MaxForwards, "70");
        // From is our To (with our tag), To is their From.
        if let Ok(mut local) = self.request.headers.to_addr() {
            local.set_tag(self.local_tag.clone());
            req.headers.push(HeaderName::From, local.to_string());
        }
        if let Some(remote) = self.request.headers.get(&HeaderName::From) {
            req.headers.push(HeaderName::To, remote);
        }
        req.headers.push(HeaderName::CallId, self.call_id().to_string());
        req.headers
            .push(HeaderName::CSeq, format!("{cseq} {method_name}"));
        req.headers
            .push(HeaderName::Contact, self.contact.to_string());
        req
    }

    /// Session-Expires requested by the caller, when acceptable.
    fn requested_session_interval(&self) -> Option<Duration> {
        let raw = self.request.headers.get(&HeaderName::SessionExpires)?;
        let secs: u32 = raw.split(';').next()?.trim().parse().ok()?;
        (secs >= MIN_SESSION_EXPIRES).then(|| Duration::from_secs(secs.into()))
    }

    // Mailbox-side handlers. Called only from the per-call mailbox task, so
    // events for one dialog are processed strictly in order.

    pub(crate) async fn handle_ack(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if *state == UasState::Answered {
            *state = UasState::Confirmed;
            drop(state);
            debug!(call_id = %self.call_id(), "dialog confirmed");
            if let Some(interval) = *self.session_interval.lock() {
                self.spawn_session_timer(interval);
            }
        }
    }

    pub(crate) async fn handle_cancel(&self, cancel: &Request, reply: &TransportHandle) {
        // The CANCEL transaction is answered regardless of state.
        let _ = reply.send(&cancel.response(StatusCode::OK).into()).await;

        let cancelled = {
            let mut state = self.state.lock();
            if *state == UasState::Proceeding {
                *state = UasState::Terminated(TerminationCause::Cancelled);
                true
            } else {
                false
            }
        };
        if cancelled {
            let _ = self
                .handle
                .send(&self.response(StatusCode::REQUEST_TERMINATED).into())
                .await;
            let _ = self.signals.send(CallSignal::Cancelled).await;
        }
    }

    pub(crate) async fn handle_bye(&self, bye: &Request, reply: &TransportHandle) {
        let accepted = {
            let mut state = self.state.lock();
            if state.is_terminated() {
                false
            } else {
                *state = UasState::Terminated(TerminationCause::RemoteBye);
                true
            }
        };
        let status = if accepted {
            StatusCode::OK
        } else {
            StatusCode::CALL_DOES_NOT_EXIST
        };
        let _ = reply.send(&bye.response(status).into()).await;
        if accepted {
            let _ = self.signals.send(CallSignal::ByeReceived).await;
        }
    }

    pub(crate) async fn handle_reinvite(&self, reinvite: &Request, reply: &TransportHandle) {
        if self.state.lock().is_terminated() {
            let _ = reply
                .send(&reinvite.response(StatusCode::CALL_DOES_NOT_EXIST).into())
                .await;
            return;
        }
        // Session refresh: replay the committed answer.
        let _ = self.refresh_tx.send_modify(|gen| *gen += 1);
        let sdp = self.answer_sdp.lock().clone().unwrap_or_default();
        let mut resp = reinvite.response(StatusCode::OK);
        if let Ok(mut to) = resp.headers.to_addr() {
            if to.tag().is_none() {
                to.set_tag(self.local_tag.clone());
                resp.headers.set(HeaderName::To, to.to_string());
            }
        }
        resp.headers
            .push(HeaderName::Contact, self.contact.to_string());
        if !sdp.is_empty() {
            resp = resp.with_body("application/sdp", sdp);
        }
        let _ = reply.send(&resp.into()).await;
    }

    pub(crate) async fn handle_info(&self, info: &Request, reply: &TransportHandle) {
        let _ = reply.send(&info.response(StatusCode::OK).into()).await;
        if let Ok(body) = std::str::from_utf8(&info.body) {
            if let Some(digit) = parse_info_digit(body) {
                let _ = self.signals.send(CallSignal::Digit(digit)).await;
            }
        }
    }

    fn spawn_session_timer(self: &Arc<Self>, interval: Duration) {
        let call = self.clone();
        let mut refresh = self.refresh_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = refresh.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Refreshed; restart the interval.
                    }
                    _ = tokio::time::sleep(interval) => {
                        if call.state.lock().is_terminated() {
                            break;
                        }
                        warn!(call_id = %call.call_id(), "session timer expired");
                        *call.state.lock() =
                            UasState::Terminated(TerminationCause::SessionExpired);
                        let bye = call.in_dialog_request(Method::Bye);
                        let _ = call.handle.send(&bye.into()).await;
                        let _ = call.signals.send(CallSignal::SessionExpired).await;
                        break;
                    }
                }
            }
        });
    }
}

/// Parse a DTMF digit out of a SIP INFO body (`application/dtmf-relay` or
/// bare-digit `application/dtmf`).
fn parse_info_digit(body: &str) -> Option<char> {
    let body = body.trim();
    let valid = |c: char| c.is_ascii_digit() || matches!(c.to_ascii_uppercase(), '*' | '#' | 'A'..='D');
    if body.len() == 1 {
        let c = body.chars().next()?;
        return valid(c).then(|| c.to_ascii_uppercase());
    }
    for line in body.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if key.trim().eq_ignore_ascii_case("signal") {
                let c = value.trim().chars().next()?;
                return valid(c).then(|| c.to_ascii_uppercase());
            }
        }
    }
    None
}
