//! End-to-end flow engine tests over local sockets

use std::sync::Arc;

use tokio::sync::watch;

use flowpbx_call_engine::call::{CallContext, CallEnv};
use flowpbx_call_engine::cdr::{CallRecord, Direction, Disposition};
use flowpbx_call_engine::flow::engine::run_flow;
use flowpbx_call_engine::flow::{EntityRef, FlowContext, FlowEdge, FlowGraph, FlowNode, NodeKind};
use flowpbx_call_engine::resolver::{StaticResolver, TimeRule, TimeSwitch};
use flowpbx_call_engine::{Config, JsonlVoicemailSink};
use flowpbx_dialog_core::{DialogManager, RingState};
use flowpbx_media_core::{ConferenceManager, MediaEngine, PortPool};
use flowpbx_registrar_core::{BindingStore, TrunkManager};
use flowpbx_sip_core::{parse_message, Message};
use flowpbx_sip_transport::{TransportConfig, TransportManager};

fn invite_wire() -> String {
    let body = "v=0\r\n\
        o=t 1 1 IN IP4 127.0.0.1\r\n\
        s=t\r\n\
        c=IN IP4 127.0.0.1\r\n\
        t=0 0\r\n\
        m=audio 49170 RTP/AVP 8 101\r\n\
        a=rtpmap:8 PCMA/8000\r\n";
    format!(
        "INVITE sip:0255501000@pbx.local SIP/2.0\r\n\
        Via: SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKtest1\r\n\
        From: \"Test Caller\" <sip:0400000001@127.0.0.1>;tag=ft-test\r\n\
        To: <sip:0255501000@pbx.local>\r\n\
        Call-ID: flow-test-1\r\n\
        CSeq: 1 INVITE\r\n\
        Contact: <sip:0400000001@127.0.0.1:5080>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

fn business_hours_switch() -> TimeSwitch {
    TimeSwitch {
        id: 3,
        name: "hours".into(),
        timezone: "Australia/Sydney".into(),
        rules: vec![TimeRule {
            label: "business_hours".into(),
            // Never matches: an empty day set.
            days: vec![],
            start: "08:30".into(),
            end: "17:00".into(),
        }],
    }
}

async fn test_context(
    resolver: StaticResolver,
) -> (CallContext, watch::Sender<bool>, tokio::net::UdpSocket) {
    let config = Arc::new({
        let mut config = Config::default();
        config.data_dir =
            std::env::temp_dir().join(format!("flowpbx-it-{}", uuid::Uuid::new_v4()));
        config
    });

    let (transports, _events) = TransportManager::bind(TransportConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:0".parse().unwrap(),
    ))
    .await
    .unwrap();
    let transports = Arc::new(transports);

    let peer_sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = peer_sock.local_addr().unwrap();

    let media = MediaEngine::new(
        PortPool::new("127.0.0.1".parse().unwrap(), 44_000, 44_099),
        "127.0.0.1".parse().unwrap(),
    );

    let env = Arc::new(CallEnv {
        config: config.clone(),
        resolver: resolver.into_arc(),
        bindings: Arc::new(BindingStore::new()),
        dialog: Arc::new(DialogManager::new()),
        media: media.clone(),
        conferences: Arc::new(ConferenceManager::new()),
        ring_state: Arc::new(RingState::new()),
        trunks: Arc::new(TrunkManager::new()),
        transports: transports.clone(),
        contact: "<sip:flowpbx@127.0.0.1:5060>".parse().unwrap(),
        push: None,
        mailer: None,
        voicemail: Arc::new(JsonlVoicemailSink::new(&config.data_dir)),
    });

    let request = match parse_message(invite_wire().as_bytes()).unwrap() {
        Message::Request(request) => request,
        _ => unreachable!(),
    };
    let (call, _signals) = env.dialog.create_server_call(
        request,
        transports.udp_handle(peer),
        env.contact.clone(),
    );
    let session = media.create_session(8).await.unwrap();

    let record = CallRecord::open(
        "flow-test-1",
        Direction::Inbound,
        "Test Caller",
        "0400000001",
        "0255501000",
        Some(1),
    );
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctx = CallContext::new(
        env,
        call,
        session,
        FlowContext::new("Test Caller", "0400000001"),
        record,
        cancel_rx,
    );
    (ctx, cancel_tx, peer_sock)
}

fn did_flow_to_hangup() -> FlowGraph {
    FlowGraph {
        id: 1,
        name: "after-hours".into(),
        entry_node: "in".into(),
        nodes: vec![
            FlowNode {
                id: "in".into(),
                kind: NodeKind::InboundNumber,
                entity: None,
                config: Default::default(),
            },
            FlowNode {
                id: "ts".into(),
                kind: NodeKind::TimeSwitch,
                entity: Some(EntityRef {
                    entity_type: "time_switch".into(),
                    id: 3,
                }),
                config: Default::default(),
            },
            FlowNode {
                id: "bye".into(),
                kind: NodeKind::Hangup,
                entity: None,
                config: [("cause".to_string(), serde_json::json!(200))]
                    .into_iter()
                    .collect(),
            },
        ],
        edges: vec![
            FlowEdge {
                from_node: "in".into(),
                from_port: "next".into(),
                to_node: "ts".into(),
            },
            FlowEdge {
                from_node: "ts".into(),
                from_port: "default".into(),
                to_node: "bye".into(),
            },
        ],
    }
}

#[tokio::test]
async fn flow_walks_to_hangup_and_records_path() {
    let resolver = StaticResolver {
        time_switches: vec![business_hours_switch()],
        ..Default::default()
    };
    let (mut ctx, _cancel_tx, _peer) = test_context(resolver).await;

    let end = run_flow(&mut ctx, &did_flow_to_hangup()).await;

    assert_eq!(ctx.flow.path, vec!["in", "ts", "bye"]);
    assert_eq!(end.cause, "normal clearing");
    // The hangup node answered (cause 200) then cleared the call.
    assert!(ctx.answered);
    assert!(ctx.call.state().is_terminated());

    ctx.session.shutdown().await;
}

#[tokio::test]
async fn unwired_port_ends_with_no_route() {
    let resolver = StaticResolver {
        time_switches: vec![business_hours_switch()],
        ..Default::default()
    };
    let (mut ctx, _cancel_tx, _peer) = test_context(resolver).await;

    let mut flow = did_flow_to_hangup();
    flow.edges.retain(|e| e.from_node != "ts");

    let end = run_flow(&mut ctx, &flow).await;
    assert_eq!(end.cause, "no route");
    assert_eq!(ctx.flow.path, vec!["in", "ts"]);

    ctx.session.shutdown().await;
}

#[tokio::test]
async fn cancelled_call_unwinds_before_next_node() {
    let resolver = StaticResolver {
        time_switches: vec![business_hours_switch()],
        ..Default::default()
    };
    let (mut ctx, cancel_tx, _peer) = test_context(resolver).await;
    cancel_tx.send(true).unwrap();

    let end = run_flow(&mut ctx, &did_flow_to_hangup()).await;
    assert_eq!(end.cause, "originator cancel");
    assert_eq!(end.disposition, Disposition::NoAnswer);
    assert!(ctx.flow.path.is_empty());

    ctx.session.shutdown().await;
}

#[tokio::test]
async fn missing_entity_fails_the_call() {
    // Resolver has no time switch with id 3.
    let (mut ctx, _cancel_tx, _peer) = test_context(StaticResolver::default()).await;

    let end = run_flow(&mut ctx, &did_flow_to_hangup()).await;
    assert_eq!(end.disposition, Disposition::Failed);
    // The failing node is the last entry of the traversal path.
    assert_eq!(ctx.flow.path.last().map(String::as_str), Some("ts"));

    ctx.session.shutdown().await;
}
