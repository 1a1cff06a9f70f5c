//! PBX server: wiring, dispatch and per-call orchestration
//!
//! Owns every subsystem, runs the transport dispatch loop, and spawns one
//! task per inbound call. Requests route by method: REGISTER to the
//! registrar, INVITE to call setup, in-dialog methods to the dialog
//! manager, OPTIONS to a stateless responder, anything else to 405.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use flowpbx_dialog_core::{CallSignal, DialogManager, RingOutcome, RingState};
use flowpbx_media_core::{ConferenceManager, MediaEngine, PortPool};
use flowpbx_registrar_core::{
    Authenticator, BindingStore, NonceStore, Registrar, RegistrarConfig, RegistrarDirectory,
    SipSender, TrunkConfig, TrunkManager,
};
use flowpbx_sip_core::sdp::{PayloadType, SessionDescription};
use flowpbx_sip_core::types::auth::DigestCredentials;
use flowpbx_sip_core::{Address, HeaderName, Message, Method, Request, StatusCode, Uri};
use flowpbx_sip_transport::{
    TransportConfig, TransportEvent, TransportHandle, TransportManager,
};

use crate::call::{CallContext, CallEnv, RingTarget};
use crate::cdr::{write_record, CallRecord, CdrSink, Direction, Disposition};
use crate::cleanup;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::engine::run_flow;
use crate::flow::FlowContext;
use crate::push::PushClient;
use crate::resolver::EntityResolver;
use crate::voicemail::{Mailer, VoicemailSink};

/// Payload types the proxy negotiates, in preference order.
fn allowed_payloads() -> Vec<PayloadType> {
    let mut allowed = vec![PayloadType::Pcmu, PayloadType::Pcma];
    if cfg!(feature = "opus") {
        allowed.push(PayloadType::Opus);
    }
    allowed
}

/// Adapter: the entity repository answers registrar directory queries.
struct ResolverDirectory {
    resolver: Arc<dyn EntityResolver>,
}

#[async_trait]
impl RegistrarDirectory for ResolverDirectory {
    async fn ha1(&self, username: &str) -> Option<String> {
        self.resolver
            .extension_by_number(username)
            .await
            .map(|e| e.ha1)
    }

    async fn max_contacts(&self, username: &str) -> usize {
        self.resolver
            .extension_by_number(username)
            .await
            .map(|e| e.max_contacts)
            .unwrap_or(1)
    }
}

/// Adapter: trunk tasks send through the shared UDP socket.
struct TransportSender {
    transports: Arc<TransportManager>,
}

#[async_trait]
impl SipSender for TransportSender {
    async fn send(
        &self,
        message: Message,
        destination: std::net::SocketAddr,
    ) -> flowpbx_registrar_core::Result<()> {
        self.transports
            .send_udp(&message, destination)
            .await
            .map_err(|e| flowpbx_registrar_core::Error::Transport(e.to_string()))
    }
}

/// The assembled PBX core.
pub struct PbxServer {
    env: Arc<CallEnv>,
    registrar: Arc<Registrar>,
    auth: Arc<Authenticator>,
    cdr: Arc<dyn CdrSink>,
    events_rx: mpsc::Receiver<TransportEvent>,
}

impl PbxServer {
    /// Bind listeners, start background tasks and return the server ready
    /// to run its dispatch loop.
    pub async fn start(
        config: Config,
        resolver: Arc<dyn EntityResolver>,
        trunks: Vec<TrunkConfig>,
        cdr: Arc<dyn CdrSink>,
        voicemail: Arc<dyn VoicemailSink>,
    ) -> Result<PbxServer> {
        let config = Arc::new(config);

        let mut transport_config = TransportConfig::new(
            format!("0.0.0.0:{}", config.sip_udp_port).parse().unwrap(),
            format!("0.0.0.0:{}", config.sip_tcp_port).parse().unwrap(),
        );
        if let Some(tls_port) = config.sip_tls_port {
            transport_config.tls_addr = Some(format!("0.0.0.0:{tls_port}").parse().unwrap());
            transport_config.tls_cert_path = config.tls_cert_path.clone();
            transport_config.tls_key_path = config.tls_key_path.clone();
        }
        let (transports, events_rx) = TransportManager::bind(transport_config).await?;
        let transports = Arc::new(transports);

        let pool = PortPool::new(
            "0.0.0.0".parse().unwrap(),
            config.rtp_port_min,
            config.rtp_port_max,
        );
        let media = MediaEngine::new(pool, config.external_ip);

        let bindings = Arc::new(BindingStore::new());
        flowpbx_registrar_core::bindings::spawn_expiry_scan(bindings.clone());

        let nonces = Arc::new(NonceStore::new());
        let auth = Arc::new(Authenticator::new(config.realm.clone(), nonces));
        let directory = Arc::new(ResolverDirectory {
            resolver: resolver.clone(),
        });
        let registrar = Arc::new(Registrar::new(
            RegistrarConfig {
                realm: config.realm.clone(),
                min_expires: config.min_register_expiry,
                max_expires: config.max_register_expiry,
                default_expires: 3600,
            },
            bindings.clone(),
            auth.clone(),
            directory,
        ));

        let contact = Address::new(Uri::sip_addr(
            "flowpbx",
            std::net::SocketAddr::new(config.external_ip, config.sip_udp_port),
        ));

        let trunk_manager = Arc::new(TrunkManager::new());
        let sender: Arc<dyn SipSender> = Arc::new(TransportSender {
            transports: transports.clone(),
        });
        for trunk in trunks {
            let id = trunk.id;
            trunk_manager.add_trunk(trunk);
            trunk_manager.spawn_trunk_tasks(id, sender.clone(), contact.clone())?;
        }

        let push = match (&config.push_gateway_url, &config.license_key) {
            (Some(url), Some(key)) => Some(PushClient::new(url.clone(), key.clone())),
            _ => None,
        };
        let mailer = Mailer::from_config(&config);

        cleanup::spawn(config.clone());

        let env = Arc::new(CallEnv {
            config: config.clone(),
            resolver,
            bindings,
            dialog: Arc::new(DialogManager::new()),
            media,
            conferences: Arc::new(ConferenceManager::new()),
            ring_state: Arc::new(RingState::new()),
            trunks: trunk_manager,
            transports,
            contact,
            push,
            mailer,
            voicemail,
        });

        info!(
            udp = config.sip_udp_port,
            tcp = config.sip_tcp_port,
            rtp_pairs = env.media.pool().available(),
            external_ip = %config.external_ip,
            "flowpbx core started"
        );

        // Low-cadence health snapshot for operators tailing the logs.
        {
            let env = env.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    debug!(
                        active_calls = env.dialog.active_calls(),
                        bindings = env.bindings.total_bindings(),
                        free_rtp_pairs = env.media.pool().available(),
                        "core stats"
                    );
                }
            });
        }

        Ok(PbxServer {
            env,
            registrar,
            auth,
            cdr,
            events_rx,
        })
    }

    pub fn env(&self) -> Arc<CallEnv> {
        self.env.clone()
    }

    /// Dispatch transport events until the channel closes or shutdown is
    /// signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                TransportEvent::MessageReceived { message, handle } => {
                    self.dispatch(message, handle).await;
                }
                TransportEvent::Error { kind, error } => {
                    warn!(%kind, error, "transport error");
                }
                TransportEvent::Closed => break,
            }
        }
        info!("dispatch loop stopped");
        // Clear the floor: BYE answered calls, 503 the rest, stop listening.
        self.env.dialog.hangup_all().await;
        self.env.transports.close();
    }

    async fn dispatch(&self, message: Message, handle: TransportHandle) {
        match message {
            Message::Response(response) => {
                // Client transactions first, then trunk registrations.
                if !self.env.dialog.route_response(response.clone()) {
                    let call_id = response
                        .headers
                        .get(&HeaderName::CallId)
                        .unwrap_or("")
                        .to_string();
                    if !self.env.trunks.route_response(&call_id, response) {
                        debug!(%call_id, "response matched no transaction");
                    }
                }
            }
            Message::Request(request) => self.dispatch_request(request, handle).await,
        }
    }

    async fn dispatch_request(&self, request: Request, handle: TransportHandle) {
        let has_to_tag = request
            .headers
            .to_addr()
            .ok()
            .and_then(|to| to.tag().map(str::to_string))
            .is_some();

        match &request.method {
            Method::Register => {
                let response = self
                    .registrar
                    .handle_register(&request, handle.peer(), handle.kind())
                    .await;
                let _ = handle.send(&response.into()).await;
            }
            Method::Options => {
                let mut response = request.response(StatusCode::OK);
                response
                    .headers
                    .push(HeaderName::Allow, Method::allow_header_value());
                let _ = handle.send(&response.into()).await;
            }
            Method::Invite if !has_to_tag => {
                self.handle_invite(request, handle).await;
            }
            Method::Invite | Method::Ack | Method::Cancel | Method::Bye | Method::Info => {
                self.env.dialog.dispatch_request(request, handle).await;
            }
            method => {
                debug!(%method, "unsupported method");
                let mut response = request.response(StatusCode::METHOD_NOT_ALLOWED);
                response
                    .headers
                    .push(HeaderName::Allow, Method::allow_header_value());
                let _ = handle.send(&response.into()).await;
            }
        }
    }

    /// Admission and routing for a new INVITE; the call itself runs on its
    /// own task.
    async fn handle_invite(&self, request: Request, handle: TransportHandle) {
        let env = self.env.clone();
        let auth = self.auth.clone();
        let cdr = self.cdr.clone();
        tokio::spawn(async move {
            if let Err(err) = run_inbound_call(env, auth, cdr, request, handle).await {
                warn!(%err, "call setup failed");
            }
        });
    }
}

/// Where an INVITE is headed.
enum CallTarget {
    Did(crate::resolver::InboundNumber),
    Extension(crate::resolver::Extension),
    Conference(crate::resolver::ConferenceBridge),
}

/// Full lifecycle of one inbound call.
async fn run_inbound_call(
    env: Arc<CallEnv>,
    auth: Arc<Authenticator>,
    cdr: Arc<dyn CdrSink>,
    request: Request,
    handle: TransportHandle,
) -> Result<()> {
    let source_ip = handle.peer().ip();
    let trunk_id = env.trunks.match_inbound(source_ip);

    // Trunk calls are admitted against the channel cap; everything else
    // must be an authenticated extension.
    let mut channel_guard = None;
    if let Some(trunk) = trunk_id {
        match env.trunks.try_admit(trunk) {
            Ok(guard) => channel_guard = Some(guard),
            Err(err) => {
                warn!(trunk, %err, "trunk admission refused");
                let _ = handle
                    .send(&request.response(StatusCode::SERVICE_UNAVAILABLE).into())
                    .await;
                return Ok(());
            }
        }
    } else if !authenticate_extension_invite(&env, &auth, &request, &handle).await? {
        return Ok(());
    }

    // Destination match order: DID, extension, conference room.
    let dialled = dialled_number(&request);
    let target = if let Some(did) = env.resolver.inbound_number(&dialled).await {
        CallTarget::Did(did)
    } else if let Some(extension) = env.resolver.extension_by_number(&dialled).await {
        CallTarget::Extension(extension)
    } else if let Some(bridge) = env.resolver.conference_by_number(&dialled).await {
        CallTarget::Conference(bridge)
    } else {
        debug!(%dialled, "no destination matched");
        let _ = handle
            .send(&request.response(StatusCode::NOT_FOUND).into())
            .await;
        return Ok(());
    };

    // Negotiate media before signalling progress.
    let offer: SessionDescription = match std::str::from_utf8(&request.body)
        .ok()
        .and_then(|text| text.parse().ok())
    {
        Some(offer) => offer,
        None => {
            let _ = handle
                .send(&request.response(StatusCode::NOT_ACCEPTABLE_HERE).into())
                .await;
            return Ok(());
        }
    };
    let kept = offer
        .audio_media()
        .map(|audio| audio.intersect(&allowed_payloads()))
        .unwrap_or_default();
    let caller_payload = match kept
        .iter()
        .copied()
        .find(|pt| *pt != flowpbx_media_core::DTMF_PAYLOAD)
    {
        Some(pt) => pt,
        None => {
            let _ = handle
                .send(&request.response(StatusCode::NOT_ACCEPTABLE_HERE).into())
                .await;
            return Ok(());
        }
    };

    let session = match env.media.create_session(caller_payload).await {
        Ok(session) => session,
        Err(flowpbx_media_core::Error::PortPoolExhausted) => {
            warn!("media port pool exhausted");
            let _ = handle
                .send(&request.response(StatusCode::SERVICE_UNAVAILABLE).into())
                .await;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    if let Some((ip, port)) = offer.audio_endpoint() {
        session
            .caller_leg()
            .hint_remote(std::net::SocketAddr::new(ip, port));
    }

    // Dialog state plus the immediate 100 Trying.
    let from = request.headers.from_addr()?;
    let caller_name = from.display_name.clone().unwrap_or_default();
    let caller_num = from.uri.user.clone().unwrap_or_default();
    let call_id = request.headers.call_id()?.to_string();

    let (call, signals) =
        env.dialog
            .create_server_call(request.clone(), handle, env.contact.clone());
    call.send_trying().await?;

    let record = CallRecord::open(
        call_id.clone(),
        if trunk_id.is_some() {
            Direction::Inbound
        } else {
            Direction::Internal
        },
        caller_name.clone(),
        caller_num.clone(),
        dialled.clone(),
        trunk_id,
    );

    // Hangup plumbing: dialog signals set the cancel flag every node
    // observes; INFO digits feed the media session's DTMF stream.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    spawn_signal_pump(signals, cancel_tx, session.clone());

    let mut ctx = CallContext::new(
        env.clone(),
        call.clone(),
        session.clone(),
        FlowContext::new(caller_name, caller_num),
        record,
        cancel_rx,
    );

    // Trunk-level and global recording policy apply from the start; the
    // per-extension flag is evaluated at answer time.
    let trunk_records = trunk_id.map(|t| env.trunks.record_calls(t)).unwrap_or(false);
    if let Err(err) = ctx.maybe_start_recording(trunk_records).await {
        warn!(%err, "could not start call recording");
    }

    // Run the destination, then tear everything down.
    let end = match target {
        CallTarget::Did(did) => match env.resolver.flow(did.flow_id).await {
            Ok(flow) => run_flow(&mut ctx, &flow).await,
            Err(err) => {
                warn!(%err, "flow load failed");
                crate::flow::engine::FlowEnd {
                    disposition: Disposition::Failed,
                    cause: "no route".into(),
                }
            }
        },
        CallTarget::Extension(extension) => ring_internal(&mut ctx, extension).await,
        CallTarget::Conference(bridge) => join_conference(&mut ctx, bridge).await,
    };

    teardown(ctx, cdr, end).await;
    drop(channel_guard);
    Ok(())
}

/// Challenge/verify an INVITE that claims to come from an extension.
/// Returns false when the INVITE was already answered (challenge or 403).
async fn authenticate_extension_invite(
    env: &Arc<CallEnv>,
    auth: &Authenticator,
    request: &Request,
    handle: &TransportHandle,
) -> Result<bool> {
    use flowpbx_registrar_core::AuthOutcome;

    let claimed = request
        .headers
        .get(&HeaderName::ProxyAuthorization)
        .and_then(|raw| raw.parse::<DigestCredentials>().ok().map(|c| c.username));
    let fetched = match &claimed {
        Some(user) => env
            .resolver
            .extension_by_number(user)
            .await
            .map(|e| (user.clone(), e.ha1)),
        None => None,
    };

    let outcome = auth.verify(request, HeaderName::ProxyAuthorization, |u| {
        fetched
            .as_ref()
            .filter(|(user, _)| user == u)
            .map(|(_, ha1)| ha1.clone())
    });
    match outcome {
        AuthOutcome::Authorized(_) => Ok(true),
        AuthOutcome::Challenge(challenge) => {
            let mut response = request.response(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
            response
                .headers
                .push(HeaderName::ProxyAuthenticate, challenge.to_string());
            let _ = handle.send(&response.into()).await;
            Ok(false)
        }
        AuthOutcome::UnknownUser(user) | AuthOutcome::BadCredentials(user) => {
            warn!(%user, "INVITE authentication failed");
            let _ = handle
                .send(&request.response(StatusCode::FORBIDDEN).into())
                .await;
            Ok(false)
        }
    }
}

/// The number being dialled: the request-URI user, falling back to To.
fn dialled_number(request: &Request) -> String {
    request
        .uri
        .user
        .clone()
        .or_else(|| {
            request
                .headers
                .to_addr()
                .ok()
                .and_then(|to| to.uri.user.clone())
        })
        .unwrap_or_default()
}

/// Forward dialog signals into the per-call cancel flag and DTMF stream.
fn spawn_signal_pump(
    mut signals: mpsc::Receiver<CallSignal>,
    cancel_tx: watch::Sender<bool>,
    session: Arc<flowpbx_media_core::MediaSession>,
) {
    tokio::spawn(async move {
        let mut info_seq: u32 = 0;
        while let Some(signal) = signals.recv().await {
            match signal {
                CallSignal::Cancelled | CallSignal::ByeReceived | CallSignal::SessionExpired => {
                    let _ = cancel_tx.send(true);
                }
                CallSignal::Digit(digit) => {
                    info_seq += 1;
                    session.inject_info_digit(digit, info_seq);
                }
            }
        }
    });
}

/// Direct extension-to-extension call (no flow involved).
async fn ring_internal(
    ctx: &mut CallContext,
    extension: crate::resolver::Extension,
) -> crate::flow::engine::FlowEnd {
    use crate::flow::engine::FlowEnd;

    if extension.dnd {
        let _ = ctx.call.reject(StatusCode::TEMPORARILY_UNAVAILABLE).await;
        return FlowEnd {
            disposition: Disposition::NoAnswer,
            cause: "do not disturb".into(),
        };
    }

    let ring_timeout = Duration::from_secs(
        extension
            .ring_timeout_secs
            .unwrap_or(ctx.env.config.ring_timeout_secs),
    );
    let targets: Vec<RingTarget> = ctx
        .env
        .bindings
        .lookup(&extension.number)
        .into_iter()
        .map(|binding| RingTarget {
            member: extension.number.clone(),
            binding,
        })
        .collect();

    if targets.is_empty() {
        let _ = ctx.call.reject(StatusCode::TEMPORARILY_UNAVAILABLE).await;
        return FlowEnd {
            disposition: Disposition::NoAnswer,
            cause: "no registered devices".into(),
        };
    }

    match ctx.ring_targets(targets, ring_timeout).await {
        Ok(RingOutcome::Answered) => {
            let _ = ctx.maybe_start_recording(extension.record_calls).await;
            ctx.wait_bridged().await;
            FlowEnd {
                disposition: Disposition::Answered,
                cause: "normal clearing".into(),
            }
        }
        Ok(RingOutcome::Busy) => {
            let _ = ctx.call.reject(StatusCode::BUSY_HERE).await;
            FlowEnd {
                disposition: Disposition::Busy,
                cause: "user busy".into(),
            }
        }
        Ok(RingOutcome::Cancelled) => FlowEnd {
            disposition: Disposition::NoAnswer,
            cause: "originator cancel".into(),
        },
        Ok(_) => {
            let _ = ctx.call.reject(StatusCode::TEMPORARILY_UNAVAILABLE).await;
            FlowEnd {
                disposition: Disposition::NoAnswer,
                cause: "no answer".into(),
            }
        }
        Err(err) => {
            warn!(%err, "internal ring failed");
            FlowEnd {
                disposition: Disposition::Failed,
                cause: err.to_string(),
            }
        }
    }
}

/// Direct dial into a conference room.
async fn join_conference(
    ctx: &mut CallContext,
    bridge: crate::resolver::ConferenceBridge,
) -> crate::flow::engine::FlowEnd {
    use crate::flow::engine::FlowEnd;
    use crate::flow::{EntityRef, FlowNode, NodeKind};

    // Reuse the conference node handler through a synthetic node.
    let node = FlowNode {
        id: format!("conference-{}", bridge.id),
        kind: NodeKind::Conference,
        entity: Some(EntityRef {
            entity_type: "conference".into(),
            id: bridge.id,
        }),
        config: Default::default(),
    };
    ctx.flow.enter_node(&node.id);
    match crate::nodes::execute(ctx, &node).await {
        Ok(_) => FlowEnd {
            disposition: Disposition::Answered,
            cause: "normal clearing".into(),
        },
        Err(Error::Cancelled) => FlowEnd {
            disposition: Disposition::Answered,
            cause: "originator cancel".into(),
        },
        Err(err) => FlowEnd {
            disposition: Disposition::Failed,
            cause: err.to_string(),
        },
    }
}

/// Release everything a call held and close its record. Runs on every exit
/// path, including node failures.
async fn teardown(
    mut ctx: CallContext,
    cdr: Arc<dyn CdrSink>,
    end: crate::flow::engine::FlowEnd,
) {
    let call_id = ctx.record.call_id.clone();
    debug!(%call_id, cause = %end.cause, "tearing down call");

    // Hang up whichever sides are still live.
    if let Some(callee) = ctx.callee.take() {
        let _ = callee.bye().await;
    }
    match ctx.call.state() {
        flowpbx_dialog_core::UasState::Proceeding => {
            let status = if end.disposition == Disposition::Failed {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::TEMPORARILY_UNAVAILABLE
            };
            let _ = ctx.call.reject(status).await;
        }
        flowpbx_dialog_core::UasState::Answered | flowpbx_dialog_core::UasState::Confirmed => {
            let _ = ctx.call.bye().await;
        }
        flowpbx_dialog_core::UasState::Terminated(_) => {}
    }

    // Flush any call recording before the ports are released.
    ctx.session.take_recorder();
    if let Some(recorder) = ctx.recorder.take() {
        let _ = recorder.finish().await;
    }
    ctx.session.shutdown().await;
    ctx.env.dialog.remove_call(&call_id);

    ctx.record.flow_path = std::mem::take(&mut ctx.flow.path);
    ctx.record.close(end.disposition, end.cause);
    write_record(cdr, ctx.record.clone());
    info!(
        %call_id,
        disposition = ?ctx.record.disposition,
        duration = ctx.record.duration_secs,
        "call closed"
    );
}
