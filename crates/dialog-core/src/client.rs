//! Client-side (UAC) legs: forked INVITEs and established outbound dialogs

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use flowpbx_sip_core::{random_token, Address, HeaderName, Method, Request, Response, Uri};
use flowpbx_sip_transport::TransportHandle;

use crate::error::Result;
use crate::manager::{ClientRouteGuard, DialogManager};

/// One outgoing INVITE leg. Responses arrive on the receiver registered
/// with the dialog manager; the leg itself only sends.
pub struct ClientInvite {
    request: Request,
    handle: TransportHandle,
    responses: Option<mpsc::Receiver<Response>>,
    _route: ClientRouteGuard,
}

impl ClientInvite {
    /// Wire a new leg into the manager's response routing. `request` must
    /// be a complete INVITE (Via with branch, tagged From, Call-ID, CSeq,
    /// Contact, SDP body).
    pub fn new(manager: &DialogManager, request: Request, handle: TransportHandle) -> ClientInvite {
        let call_id = request
            .headers
            .call_id()
            .unwrap_or_default()
            .to_string();
        let (tx, rx) = mpsc::channel(16);
        let route = manager.register_client_route(call_id, tx);
        ClientInvite {
            request,
            handle,
            responses: Some(rx),
            _route: route,
        }
    }

    pub fn call_id(&self) -> &str {
        self.request.headers.get(&HeaderName::CallId).unwrap_or("")
    }

    /// Take the response stream; the fork racer owns it.
    pub fn take_responses(&mut self) -> Option<mpsc::Receiver<Response>> {
        self.responses.take()
    }

    /// Fire the INVITE.
    pub async fn send(&self) -> Result<()> {
        self.handle.send(&self.request.clone().into()).await?;
        Ok(())
    }

    /// CANCEL the pending transaction. Identical Via/branch, CSeq method
    /// swapped to CANCEL.
    pub async fn cancel(&self) -> Result<()> {
        let mut cancel = Request::new(Method::Cancel, self.request.uri.clone());
        for name in [
            HeaderName::Via,
            HeaderName::From,
            HeaderName::To,
            HeaderName::CallId,
        ] {
            if let Some(value) = self.request.headers.get(&name) {
                cancel.headers.push(name, value);
            }
        }
        if let Ok((seq, _)) = self.request.headers.cseq() {
            cancel.headers.push(HeaderName::CSeq, format!("{seq} CANCEL"));
        }
        cancel.headers.push(HeaderName::MaxForwards, "70");
        debug!(call_id = %self.call_id(), "cancelling leg");
        self.handle.send(&cancel.into()).await?;
        Ok(())
    }

    /// ACK a 2xx final response.
    pub async fn ack(&self, response: &Response) -> Result<()> {
        let ack = self.build_post_answer(Method::Ack, response, None)?;
        self.handle.send(&ack.into()).await?;
        Ok(())
    }

    /// ACK then immediately BYE: the race was already won by another leg
    /// when this 200 arrived.
    pub async fn ack_and_bye(&self, response: &Response) -> Result<()> {
        self.ack(response).await?;
        let bye = self.build_post_answer(Method::Bye, response, Some("call completed elsewhere"))?;
        self.handle.send(&bye.into()).await?;
        Ok(())
    }

    /// Promote an answered leg into an established dialog.
    pub fn into_dialog(self, response: &Response) -> Result<ClientDialog> {
        let (seq, _) = self.request.headers.cseq()?;
        let target = remote_target(response).unwrap_or_else(|| self.request.uri.clone());
        let call_id = self.call_id().to_string();
        Ok(ClientDialog {
            handle: self.handle,
            call_id,
            local: self.request.headers.from_addr()?,
            remote: response.headers.to_addr()?,
            contact: self
                .request
                .headers
                .get(&HeaderName::Contact)
                .unwrap_or_default()
                .to_string(),
            target,
            cseq: AtomicU32::new(seq),
            _route: self._route,
        })
    }

    /// Build an in-dialog request after a 2xx (ACK or the immediate BYE).
    fn build_post_answer(
        &self,
        method: Method,
        response: &Response,
        reason: Option<&str>,
    ) -> Result<Request> {
        let (invite_seq, _) = self.request.headers.cseq()?;
        let (seq, new_branch) = match method {
            // ACK for 2xx reuses the INVITE CSeq number in a new transaction.
            Method::Ack => (invite_seq, true),
            _ => (invite_seq + 1, true),
        };
        let target = remote_target(response).unwrap_or_else(|| self.request.uri.clone());
        let method_name = method.as_str().to_string();
        let mut req = Request::new(method, target);
        if new_branch {
            if let Ok(via) = self.request.headers.top_via() {
                let mut via = via;
                for param in via.params.iter_mut() {
                    if param.0.eq_ignore_ascii_case("branch") {
                        param.1 = Some(format!(
                            "{}{}",
                            flowpbx_sip_core::types::headers::Via::BRANCH_COOKIE,
                            random_token(12)
                        ));
                    }
                }
                req.headers.push(HeaderName::Via, via.to_string());
            }
        }
        req.headers.push(HeaderName::MaxForwards, "70");
        if let Some(from) = self.request.headers.get(&HeaderName::From) {
            req.headers.push(HeaderName::From, from);
        }
        // To carries the peer's tag from the answer.
        if let Some(to) = response.headers.get(&HeaderName::To) {
            req.headers.push(HeaderName::To, to);
        }
        req.headers
            .push(HeaderName::CallId, self.call_id().to_string());
        req.headers
            .push(HeaderName::CSeq, format!("{seq} {method_name}"));
        if let Some(reason) = reason {
            req.headers
                .push(HeaderName::Reason, format!("SIP;text=\"{reason}\""));
        }
        Ok(req)
    }
}

/// The Contact target from a response, for in-dialog requests.
fn remote_target(response: &Response) -> Option<Uri> {
    response
        .headers
        .contacts()
        .ok()
        .and_then(|contacts| contacts.into_iter().next())
        .map(|contact| contact.uri)
}

/// An established outbound dialog (the answered callee leg).
pub struct ClientDialog {
    handle: TransportHandle,
    call_id: String,
    local: Address,
    remote: Address,
    contact: String,
    target: Uri,
    cseq: AtomicU32,
    _route: ClientRouteGuard,
}

impl ClientDialog {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn remote(&self) -> &Address {
        &self.remote
    }

    /// Hang up this leg.
    pub async fn bye(&self) -> Result<()> {
        let seq = self.cseq.fetch_add(1, Ordering::AcqRel) + 1;
        let mut bye = Request::new(Method::Bye, self.target.clone());
        bye.headers.push(
            HeaderName::Via,
            format!(
                "SIP/2.0/{} {};branch={}{}",
                self.handle.kind().via_token(),
                self.handle.local(),
                flowpbx_sip_core::types::headers::Via::BRANCH_COOKIE,
                random_token(12)
            ),
        );
        bye.headers.push(HeaderName::MaxForwards, "70");
        bye.headers.push(HeaderName::From, self.local.to_string());
        bye.headers.push(HeaderName::To, self.remote.to_string());
        bye.headers.push(HeaderName::CallId, self.call_id.clone());
        bye.headers.push(HeaderName::CSeq, format!("{seq} BYE"));
        if !self.contact.is_empty() {
            bye.headers.push(HeaderName::Contact, self.contact.clone());
        }
        self.handle.send(&bye.into()).await?;
        Ok(())
    }
}

/// Build a complete INVITE for one leg of a fork.
///
/// `target_uri` is the callee binding's contact, `dest_source` the network
/// address the REGISTER came from (where the packet actually goes).
#[allow(clippy::too_many_arguments)]
pub fn build_leg_invite(
    target_uri: Uri,
    caller_id_name: &str,
    caller_id_num: &str,
    local_host: &str,
    contact: &Address,
    sdp: bytes::Bytes,
) -> Request {
    let mut from = Address::new(Uri::sip(caller_id_num, local_host));
    if !caller_id_name.is_empty() {
        from = from.with_display_name(caller_id_name);
    }
    from.set_tag(random_token(10));

    let mut req = Request::new(Method::Invite, target_uri.clone());
    req.headers.push(
        HeaderName::Via,
        format!(
            "SIP/2.0/UDP {};branch={}{}",
            contact.uri.host_port(),
            flowpbx_sip_core::types::headers::Via::BRANCH_COOKIE,
            random_token(12)
        ),
    );
    req.headers.push(HeaderName::MaxForwards, "70");
    req.headers.push(HeaderName::From, from.to_string());
    req.headers
        .push(HeaderName::To, Address::new(target_uri).to_string());
    req.headers
        .push(HeaderName::CallId, format!("{}@flowpbx", random_token(20)));
    req.headers.push(HeaderName::CSeq, "1 INVITE");
    req.headers.push(HeaderName::Contact, contact.to_string());
    req.headers
        .push(HeaderName::Allow, Method::allow_header_value());
    req.with_body("application/sdp", sdp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leg_invite_is_complete() {
        let contact: Address = "<sip:flowpbx@192.0.2.1:5060>".parse().unwrap();
        let req = build_leg_invite(
            "sip:201@10.0.0.7:5062".parse().unwrap(),
            "Front Desk",
            "100",
            "192.0.2.1",
            &contact,
            bytes::Bytes::from_static(b"v=0\r\n"),
        );
        assert_eq!(req.method, Method::Invite);
        assert!(req.headers.from_addr().unwrap().tag().is_some());
        assert_eq!(
            req.headers.from_addr().unwrap().display_name.as_deref(),
            Some("Front Desk")
        );
        assert!(req.headers.call_id().unwrap().ends_with("@flowpbx"));
        assert_eq!(req.headers.cseq().unwrap(), (1, Method::Invite));
        assert_eq!(req.body.as_ref(), b"v=0\r\n");
    }
}
