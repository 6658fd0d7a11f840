//! Shared integration-test harness: an in-memory session store, a UDP
//! loopback transport, and helpers for driving [`CallManager`] directly
//! since `Gateway::start()` requires a live Redis connection.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use voice_ferry_core::core::{leg_key, CallEvent, CallHandle, CallManager, LegSide};
use voice_ferry_core::protocols::rtpengine::{decode, encode, BValue};
use voice_ferry_core::protocols::sip::transaction::TransportSender;
use voice_ferry_core::protocols::sip::{SipMessage, TransportKind};
use voice_ferry_core::services::session_store::{SessionRecord, SessionStore};
use voice_ferry_core::{Error, Result};

/// In-memory stand-in for `RedisSessionStore` (spec.md §11.5 test tooling).
#[derive(Default)]
pub struct FakeSessionStore {
    sessions: DashMap<String, SessionRecord>,
    user_sets: DashMap<String, Vec<String>>,
    limits: DashMap<String, u64>,
}

#[async_trait::async_trait]
impl SessionStore for FakeSessionStore {
    async fn put_session(&self, record: &SessionRecord, _ttl: Duration) -> Result<()> {
        self.user_sets.entry(record.username.clone()).or_default().push(record.session_id.clone());
        self.sessions.insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.get(session_id).map(|e| e.clone()))
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        if let Some((_, record)) = self.sessions.remove(session_id) {
            if let Some(mut set) = self.user_sets.get_mut(&record.username) {
                set.retain(|id| id != session_id);
            }
        }
        Ok(())
    }

    async fn count_user_sessions(&self, username: &str) -> Result<u64> {
        Ok(self.user_sets.get(username).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn list_user_sessions(&self, username: &str) -> Result<Vec<String>> {
        Ok(self.user_sets.get(username).map(|s| s.clone()).unwrap_or_default())
    }

    async fn oldest_user_session(&self, username: &str) -> Result<Option<SessionRecord>> {
        let ids = self.list_user_sessions(username).await?;
        let mut oldest = None;
        for id in ids {
            if let Some(record) = self.get_session(&id).await? {
                if oldest.as_ref().map(|o: &SessionRecord| record.created_at < o.created_at).unwrap_or(true) {
                    oldest = Some(record);
                }
            }
        }
        Ok(oldest)
    }

    async fn get_user_limit(&self, username: &str) -> Result<Option<u64>> {
        Ok(self.limits.get(username).map(|l| *l))
    }

    async fn set_user_limit(&self, username: &str, limit: u64) -> Result<()> {
        self.limits.insert(username.to_string(), limit);
        Ok(())
    }

    async fn delete_user_limit(&self, username: &str) -> Result<()> {
        self.limits.remove(username);
        Ok(())
    }

    async fn increment_metric(&self, _name: &str) -> Result<i64> {
        Ok(1)
    }

    async fn get_metric(&self, _name: &str) -> Result<i64> {
        Ok(0)
    }
}

/// `TransportSender` over a real bound UDP socket, so the transaction
/// layer's retransmission and the B2BUA's end-to-end ACK exercise actual
/// datagram I/O rather than an in-process mock.
pub struct LoopbackTransport {
    socket: UdpSocket,
}

impl LoopbackTransport {
    pub async fn bind() -> Arc<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind loopback socket");
        Arc::new(Self { socket })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("local addr")
    }

    pub async fn recv(&self) -> (SipMessage, SocketAddr) {
        let mut buf = vec![0u8; 65536];
        let (n, peer) = self.socket.recv_from(&mut buf).await.expect("recv datagram");
        let msg = voice_ferry_core::protocols::sip::parse_message(&buf[..n]).expect("parse datagram");
        (msg, peer)
    }

    pub async fn send_message(&self, peer: SocketAddr, msg: &SipMessage) {
        let bytes = voice_ferry_core::protocols::sip::serialize_message(msg);
        self.socket.send_to(&bytes, peer).await.expect("send datagram");
    }
}

#[async_trait::async_trait]
impl TransportSender for LoopbackTransport {
    async fn send(&self, peer: SocketAddr, _transport: TransportKind, bytes: Bytes) -> Result<()> {
        self.socket.send_to(&bytes, peer).await.map_err(Error::Io)?;
        Ok(())
    }
}

/// Minimal stand-in for `gateway.rs`'s private `route_in_dialog`: resolves
/// the owning call actor by (Call-ID, To-tag) and forwards the correctly
/// sided event. Integration tests cannot reach the gateway's dispatch loop
/// directly since it is a private function, so this replicates just enough
/// of it to deliver in-dialog events to a call spawned via
/// `CallManager::handle_initial_invite`.
pub fn route_in_dialog(msg: &SipMessage, event: CallEvent, manager: &Arc<CallManager>) {
    let call_id = msg.call_id().expect("Call-ID present");
    let to_tag = msg.to_tag().expect("To-tag present");
    let (handle, side): (CallHandle, LegSide) =
        manager.resolve_leg(&leg_key(call_id, &to_tag)).expect("call registered for this leg");
    let sided = match (side, event) {
        (LegSide::A, CallEvent::ALegRequest(m, p, t)) => CallEvent::ALegRequest(m, p, t),
        (LegSide::B, CallEvent::ALegRequest(m, p, t)) => CallEvent::BLegRequest(m, p, t),
        (_, other) => other,
    };
    handle.send(sided);
}

/// Builds a response reusing a request's `Via`/`From`/`Call-ID`/`CSeq`,
/// attaching `to_tag` to `To` and an optional `Contact`/body.
pub fn build_uas_response(
    request: &SipMessage,
    status: u16,
    reason: &str,
    to_tag: &str,
    contact: Option<&str>,
    body: &[u8],
) -> SipMessage {
    let mut response = SipMessage::new_response(status, reason);
    for via in request.headers.get_all("Via") {
        response.headers.push("Via", via.to_string());
    }
    if let Some(from) = request.headers.get("From") {
        response.headers.push("From", from.to_string());
    }
    if let Some(to) = request.headers.get("To") {
        response.headers.push("To", format!("{to};tag={to_tag}"));
    }
    if let Some(call_id) = request.headers.get("Call-ID") {
        response.headers.push("Call-ID", call_id.to_string());
    }
    if let Some(cseq) = request.headers.get("CSeq") {
        response.headers.push("CSeq", cseq.to_string());
    }
    if let Some(contact) = contact {
        response.headers.push("Contact", contact.to_string());
    }
    response.body = Bytes::copy_from_slice(body);
    response.set_content_length();
    response
}

/// Spawns a fake RTPEngine instance: reads `"<cookie> <bencode>"`
/// datagrams and answers each via `respond`, which receives the decoded
/// command name and returns the bencode dict to send back. Returning
/// `None` drops the request on the floor (simulating an unreachable
/// instance for timeout scenarios).
pub async fn spawn_fake_rtpengine<F>(respond: F) -> SocketAddr
where
    F: Fn(&str, &std::collections::BTreeMap<Vec<u8>, BValue>) -> Option<std::collections::BTreeMap<Vec<u8>, BValue>>
        + Send
        + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind fake rtpengine socket");
    let addr = socket.local_addr().expect("local addr");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let Some(space) = buf[..n].iter().position(|&b| b == b' ') else { continue };
            let cookie = String::from_utf8_lossy(&buf[..space]).to_string();
            let Ok(decoded) = decode(&buf[space + 1..n]) else { continue };
            let Some(dict) = decoded.as_dict() else { continue };
            let command = dict.get(b"command".as_slice()).and_then(|v| v.as_str()).unwrap_or("").to_string();
            if let Some(reply_dict) = respond(&command, dict) {
                let mut payload = cookie.into_bytes();
                payload.push(b' ');
                payload.extend(encode(&BValue::Dict(reply_dict)));
                let _ = socket.send_to(&payload, peer).await;
            }
        }
    });
    addr
}

/// A store of raw bytes to send verbatim from a fake RTPEngine socket,
/// used by the malformed-reply scenario where a well-formed `BValue`
/// cannot express intentionally corrupt wire bytes.
pub async fn spawn_garbage_then_ok_rtpengine(
    ok_reply: std::collections::BTreeMap<Vec<u8>, BValue>,
) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind fake rtpengine socket");
    let addr = socket.local_addr().expect("local addr");
    let seen = Arc::new(Mutex::new(HashMap::<String, ()>::new()));
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let Some(space) = buf[..n].iter().position(|&b| b == b' ') else { continue };
            let cookie = String::from_utf8_lossy(&buf[..space]).to_string();
            let mut seen = seen.lock().await;
            if seen.insert(cookie.clone(), ()).is_none() {
                let _ = socket.send_to(format!("{cookie} X not-a-dict").as_bytes(), peer).await;
            }
            let mut payload = cookie.into_bytes();
            payload.push(b' ');
            payload.extend(encode(&BValue::Dict(ok_reply.clone())));
            let _ = socket.send_to(&payload, peer).await;
        }
    });
    addr
}

pub fn ok_sdp_reply(sdp: &str) -> std::collections::BTreeMap<Vec<u8>, BValue> {
    let mut dict = BValue::dict();
    dict.insert(b"result".to_vec(), BValue::str("ok"));
    dict.insert(b"sdp".to_vec(), BValue::str(sdp));
    dict
}
