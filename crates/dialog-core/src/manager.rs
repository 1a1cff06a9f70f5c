//! Dialog manager: per-call mailboxes and message routing

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use flowpbx_sip_core::{Address, HeaderName, Method, Request, Response, StatusCode};
use flowpbx_sip_transport::TransportHandle;

use crate::server::{CallSignal, ServerCall};

/// Capacity of each per-call mailbox.
const MAILBOX_CAPACITY: usize = 32;

enum CallEvent {
    Ack,
    Cancel(Request, TransportHandle),
    Bye(Request, TransportHandle),
    ReInvite(Request, TransportHandle),
    Info(Request, TransportHandle),
}

struct CallEntry {
    mailbox: mpsc::Sender<CallEvent>,
    call: Arc<ServerCall>,
}

/// What became of an in-dialog request handed to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Routed to a live call's mailbox.
    Delivered,
    /// No matching call; the manager already replied (481) where required.
    NoCall,
}

/// Routes SIP traffic to per-call state.
///
/// One mailbox task per server call serialises that dialog's events; client
/// transactions (forked INVITEs, trunk REGISTERs) register a Call-ID route
/// for their responses.
pub struct DialogManager {
    calls: DashMap<String, CallEntry>,
    client_routes: Arc<DashMap<String, mpsc::Sender<Response>>>,
    /// Call-IDs of established outbound legs; an inbound BYE on one of
    /// these tears the owning call down.
    leg_listeners: Arc<DashMap<String, mpsc::Sender<()>>>,
}

impl Default for DialogManager {
    fn default() -> Self {
        DialogManager::new()
    }
}

impl DialogManager {
    pub fn new() -> Self {
        DialogManager {
            calls: DashMap::new(),
            client_routes: Arc::new(DashMap::new()),
            leg_listeners: Arc::new(DashMap::new()),
        }
    }

    /// Number of live server calls.
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Create the server-side call state for an inbound INVITE and spawn
    /// its mailbox task.
    pub fn create_server_call(
        &self,
        request: Request,
        handle: TransportHandle,
        contact: Address,
    ) -> (Arc<ServerCall>, mpsc::Receiver<CallSignal>) {
        let (call, signals_rx) = ServerCall::new(request, handle, contact);
        let (mailbox_tx, mut mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.calls.insert(
            call.call_id().to_string(),
            CallEntry {
                mailbox: mailbox_tx,
                call: call.clone(),
            },
        );

        let mailbox_call = call.clone();
        tokio::spawn(async move {
            // One event at a time: dialog state transitions are serialised.
            while let Some(event) = mailbox_rx.recv().await {
                match event {
                    CallEvent::Ack => mailbox_call.handle_ack().await,
                    CallEvent::Cancel(req, reply) => {
                        mailbox_call.handle_cancel(&req, &reply).await
                    }
                    CallEvent::Bye(req, reply) => mailbox_call.handle_bye(&req, &reply).await,
                    CallEvent::ReInvite(req, reply) => {
                        mailbox_call.handle_reinvite(&req, &reply).await
                    }
                    CallEvent::Info(req, reply) => mailbox_call.handle_info(&req, &reply).await,
                }
            }
        });

        (call, signals_rx)
    }

    /// Drop a finished call. BYEs arriving afterwards get 481.
    pub fn remove_call(&self, call_id: &str) {
        self.calls.remove(call_id);
        debug!(call_id, "call removed from dialog manager");
    }

    /// Graceful shutdown: clear every live call. Answered calls get BYE,
    /// unanswered ones a 503.
    pub async fn hangup_all(&self) {
        let calls: Vec<Arc<ServerCall>> =
            self.calls.iter().map(|entry| entry.call.clone()).collect();
        for call in calls {
            match call.state() {
                crate::dialog::UasState::Proceeding => {
                    let _ = call.reject(StatusCode::SERVICE_UNAVAILABLE).await;
                }
                crate::dialog::UasState::Answered | crate::dialog::UasState::Confirmed => {
                    let _ = call.bye().await;
                }
                crate::dialog::UasState::Terminated(_) => {}
            }
        }
        self.calls.clear();
    }

    /// Route an in-dialog request (ACK, CANCEL, BYE, re-INVITE, INFO).
    pub async fn dispatch_request(&self, request: Request, handle: TransportHandle) -> Dispatch {
        let call_id = match request.headers.call_id() {
            Ok(call_id) => call_id.to_string(),
            Err(_) => return Dispatch::NoCall,
        };

        let event = match &request.method {
            Method::Ack => CallEvent::Ack,
            Method::Cancel => CallEvent::Cancel(request.clone(), handle.clone()),
            Method::Bye => CallEvent::Bye(request.clone(), handle.clone()),
            Method::Invite => CallEvent::ReInvite(request.clone(), handle.clone()),
            Method::Info => CallEvent::Info(request.clone(), handle.clone()),
            _ => return Dispatch::NoCall,
        };

        let delivered = self
            .calls
            .get(&call_id)
            .map(|entry| entry.mailbox.try_send(event).is_ok())
            .unwrap_or(false);

        if delivered {
            return Dispatch::Delivered;
        }

        // A BYE on an established outbound leg ends the owning call.
        if request.method == Method::Bye {
            if let Some(listener) = self.leg_listeners.get(&call_id) {
                let _ = handle.send(&request.response(StatusCode::OK).into()).await;
                let _ = listener.try_send(());
                return Dispatch::Delivered;
            }
        }

        // No live call. ACKs are absorbed silently; everything else that
        // expects a response gets 481 (idempotent BYE included).
        match request.method {
            Method::Ack => {}
            _ => {
                warn!(%call_id, method = %request.method, "request for unknown dialog");
                let _ = handle
                    .send(&request.response(StatusCode::CALL_DOES_NOT_EXIST).into())
                    .await;
            }
        }
        Dispatch::NoCall
    }

    /// Watch an outbound leg's Call-ID for an inbound BYE (callee hangup).
    pub fn register_leg(&self, call_id: impl Into<String>, tx: mpsc::Sender<()>) -> LegGuard {
        let call_id = call_id.into();
        self.leg_listeners.insert(call_id.clone(), tx);
        LegGuard {
            call_id,
            listeners: self.leg_listeners.clone(),
        }
    }

    /// Register interest in responses for a client transaction's Call-ID.
    pub fn register_client_route(
        &self,
        call_id: impl Into<String>,
        tx: mpsc::Sender<Response>,
    ) -> ClientRouteGuard {
        let call_id = call_id.into();
        self.client_routes.insert(call_id.clone(), tx);
        ClientRouteGuard {
            call_id,
            routes: self.client_routes.clone(),
        }
    }

    /// Deliver a response to whichever client transaction owns its Call-ID.
    /// Returns false when nothing is waiting for it.
    pub fn route_response(&self, response: Response) -> bool {
        let call_id = match response.headers.get(&HeaderName::CallId) {
            Some(call_id) => call_id.to_string(),
            None => return false,
        };
        match self.client_routes.get(&call_id) {
            Some(route) => route.try_send(response).is_ok(),
            None => false,
        }
    }
}

/// Removes the client route when the transaction finishes.
pub struct ClientRouteGuard {
    call_id: String,
    routes: Arc<DashMap<String, mpsc::Sender<Response>>>,
}

impl Drop for ClientRouteGuard {
    fn drop(&mut self) {
        self.routes.remove(&self.call_id);
    }
}

/// Removes the leg listener when the owning call finishes.
pub struct LegGuard {
    call_id: String,
    listeners: Arc<DashMap<String, mpsc::Sender<()>>>,
}

impl Drop for LegGuard {
    fn drop(&mut self) {
        self.listeners.remove(&self.call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpbx_sip_core::parse_message;
    use flowpbx_sip_core::Message;

    fn invite() -> Request {
        let wire = "INVITE sip:100@pbx.local SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKabc\r\n\
            From: \"Caller\" <sip:caller@10.0.0.2>;tag=ft1\r\n\
            To: <sip:100@pbx.local>\r\n\
            Call-ID: call-mgr-1\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:caller@10.0.0.2:5060>\r\n\
            Content-Length: 0\r\n\r\n";
        match parse_message(wire.as_bytes()).unwrap() {
            Message::Request(req) => req,
            _ => unreachable!(),
        }
    }

    async fn test_handle() -> (TransportHandle, tokio::net::UdpSocket) {
        let peer_sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = peer_sock.local_addr().unwrap();
        let (mgr, _rx) = flowpbx_sip_transport::TransportManager::bind(
            flowpbx_sip_transport::TransportConfig::new(
                "127.0.0.1:0".parse().unwrap(),
                "127.0.0.1:0".parse().unwrap(),
            ),
        )
        .await
        .unwrap();
        (mgr.udp_handle(peer), peer_sock)
    }

    fn contact() -> Address {
        "<sip:flowpbx@192.0.2.1:5060>".parse().unwrap()
    }

    #[tokio::test]
    async fn bye_without_dialog_gets_481() {
        let manager = DialogManager::new();
        let (handle, peer_sock) = test_handle().await;

        let mut bye = invite();
        bye.method = Method::Bye;
        bye.headers.set(HeaderName::CSeq, "2 BYE");

        let dispatch = manager.dispatch_request(bye, handle).await;
        assert_eq!(dispatch, Dispatch::NoCall);

        let mut buf = vec![0u8; 2048];
        let (len, _) = peer_sock.recv_from(&mut buf).await.unwrap();
        let text = std::str::from_utf8(&buf[..len]).unwrap();
        assert!(text.starts_with("SIP/2.0 481"));
    }

    #[tokio::test]
    async fn cancel_before_answer_produces_487_and_signal() {
        let manager = DialogManager::new();
        let (handle, peer_sock) = test_handle().await;

        let (call, mut signals) =
            manager.create_server_call(invite(), handle.clone(), contact());
        call.send_trying().await.unwrap();

        let mut cancel = invite();
        cancel.method = Method::Cancel;
        cancel.headers.set(HeaderName::CSeq, "1 CANCEL");
        let dispatch = manager.dispatch_request(cancel, handle).await;
        assert_eq!(dispatch, Dispatch::Delivered);

        assert_eq!(signals.recv().await, Some(CallSignal::Cancelled));

        // The peer saw: 100, 200 (for CANCEL), 487 (for INVITE).
        let mut statuses = Vec::new();
        let mut buf = vec![0u8; 2048];
        for _ in 0..3 {
            let (len, _) = peer_sock.recv_from(&mut buf).await.unwrap();
            let text = std::str::from_utf8(&buf[..len]).unwrap();
            statuses.push(text.split_whitespace().nth(1).unwrap().to_string());
        }
        assert!(statuses.contains(&"100".to_string()));
        assert!(statuses.contains(&"200".to_string()));
        assert!(statuses.contains(&"487".to_string()));
        assert!(call.state().is_terminated());
    }

    #[tokio::test]
    async fn response_routing_by_call_id() {
        let manager = DialogManager::new();
        let (tx, mut rx) = mpsc::channel(4);
        let _guard = manager.register_client_route("leg-1", tx);

        let mut resp = Response {
            status: StatusCode::RINGING,
            reason: "Ringing".into(),
            headers: Default::default(),
            body: Default::default(),
        };
        resp.headers.push(HeaderName::CallId, "leg-1");
        assert!(manager.route_response(resp.clone()));
        assert_eq!(rx.recv().await.unwrap().status, StatusCode::RINGING);

        resp.headers.set(HeaderName::CallId, "leg-2");
        assert!(!manager.route_response(resp));
    }

    #[tokio::test]
    async fn route_removed_with_guard() {
        let manager = DialogManager::new();
        let (tx, _rx) = mpsc::channel(4);
        {
            let _guard = manager.register_client_route("leg-9", tx);
        }
        let mut resp = Response {
            status: StatusCode::OK,
            reason: "OK".into(),
            headers: Default::default(),
            body: Default::default(),
        };
        resp.headers.push(HeaderName::CallId, "leg-9");
        assert!(!manager.route_response(resp));
    }
}
