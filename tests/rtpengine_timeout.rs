//! RTPEngine `offer` that never replies (spec.md §8 scenario 4): the
//! call is rejected with 503 once the instance's total timeout elapses,
//! no B-leg INVITE is ever sent, and the admission reservation is
//! released.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use voice_ferry_core::core::{B2buaPolicy, CallContext, CallManager};
use voice_ferry_core::protocols::rtpengine::{RtpEngineClient, RtpEngineInstance};
use voice_ferry_core::protocols::sip::transaction::{ServerInviteTransaction, TransactionTable, TransportSender};
use voice_ferry_core::protocols::sip::{DialogTable, SipMessage, SipMethod, TransactionKey, TransportKind};
use voice_ferry_core::services::{
    DefaultAction, RouteAction, RoutingPolicy, SessionLimitConfig, SessionLimitPolicy, SessionStore,
    StoreFailurePolicy,
};

use common::{spawn_fake_rtpengine, FakeSessionStore, LoopbackTransport};

fn initial_invite(a_contact: SocketAddr, call_id: &str) -> SipMessage {
    let mut invite = SipMessage::new_request(SipMethod::Invite, "sip:bob@sbc.example.com");
    invite.headers.push("Via", format!("SIP/2.0/UDP {a_contact};branch=z9hG4bK{call_id}"));
    invite.headers.push("From", "<sip:alice@example.com>;tag=atag1");
    invite.headers.push("To", "<sip:bob@sbc.example.com>");
    invite.headers.push("Call-ID", call_id.to_string());
    invite.headers.push("CSeq", "1 INVITE");
    invite.headers.push("Contact", format!("<sip:alice@{a_contact}>"));
    invite.body = Bytes::from_static(b"v=0\r\no=alice 1 1 IN IP4 127.0.0.1\r\n");
    invite.set_content_length();
    invite
}

#[tokio::test]
async fn offer_timeout_rejects_with_503_and_never_forwards_to_b_leg() {
    let gateway_transport = LoopbackTransport::bind().await;
    let transport_sender: Arc<dyn TransportSender> = gateway_transport.clone();

    let a_uac = LoopbackTransport::bind().await;
    let a_peer = a_uac.local_addr();

    let b_uas = LoopbackTransport::bind().await;
    let b_addr = b_uas.local_addr();

    // Never answers "offer": every command is silently dropped.
    let rtpengine_addr = spawn_fake_rtpengine(|_command, _req| None).await;
    let rtpengine = RtpEngineClient::new(
        vec![RtpEngineInstance { id: "rtp1".into(), addr: rtpengine_addr, weight: 1, enabled: true }],
        Duration::from_secs(30),
    )
    .await
    .expect("rtpengine client");

    let store: Arc<dyn SessionStore> = Arc::new(FakeSessionStore::default());
    let session_limit =
        Arc::new(SessionLimitPolicy::new(SessionLimitConfig::default(), store.clone(), StoreFailurePolicy::FailOpen));

    let route = RouteAction {
        target_host: b_addr.ip().to_string(),
        target_port: b_addr.port(),
        transport: "udp".into(),
        request_uri_rewrite: None,
        header_rewrites: vec![],
    };
    let routing = Arc::new(RoutingPolicy::new(vec![], DefaultAction::Fallback, Some(route), Duration::from_millis(200)));

    let manager = CallManager::new();
    let transactions = Arc::new(TransactionTable::new());
    let dialogs = Arc::new(DialogTable::new());

    let ctx = CallContext {
        transactions: transactions.clone(),
        dialogs: dialogs.clone(),
        rtpengine,
        session_store: store.clone(),
        session_limit,
        routing,
        transport: transport_sender.clone(),
        policy: B2buaPolicy::default(),
    };

    let invite = initial_invite(a_peer, "call-timeout-1");
    let key = TransactionKey::for_server(&invite, a_peer).unwrap();
    let a_tsx = ServerInviteTransaction::new(key.clone(), a_peer, TransportKind::Udp, transport_sender.clone());
    transactions.insert_server_invite(key, a_tsx.clone());

    manager.handle_initial_invite(invite, a_peer, TransportKind::Udp, a_tsx, ctx);

    // The B-leg UAS must never see an INVITE: the offer never completes.
    // RTPEngine's own total timeout is 5s (hardcoded), so the 503 lands
    // shortly after that; give both a generous margin and run them
    // concurrently rather than serially.
    let (no_b_invite, rejection) =
        tokio::join!(tokio::time::timeout(Duration::from_secs(7), b_uas.recv()), tokio::time::timeout(Duration::from_secs(7), a_uac.recv()));

    let (response, _) = rejection.expect("503 rejection within the RTPEngine timeout margin");
    assert_eq!(response.status(), Some(503));
    assert!(no_b_invite.is_err(), "B-leg must never receive an INVITE when the offer times out");
    assert_eq!(store.count_user_sessions("alice").await.unwrap(), 0, "reservation must be released");
}
