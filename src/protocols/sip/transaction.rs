//! RFC 3261 §17 transaction layer: client/server INVITE and non-INVITE
//! state machines, retransmission, and absorption of duplicates
//! (spec.md §3, §4.3).
//!
//! Grounded on `randijunior-pksip`'s `transaction/{mod.rs,client,
//! inv_client,inv_server,server}` for the state/role shape, generalized
//! into a sharded `DashMap` table (spec.md §5) driven by `tokio::time`
//! sleeps instead of pksip's `Arc<Inner>` builder pattern, matching the
//! teacher's own event-channel idiom (`services/*.rs`).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use super::message::{SipMessage, SipMethod};
use super::transport::TransportKind;
use crate::Result;

pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);

fn invite_client_timeout() -> Duration {
    T1 * 64
}

/// Matching key for a client transaction: branch + method + sent-by.
/// Matching key for a server transaction: branch + method + source.
/// Both reduce to the same triple in this implementation (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: String,
    pub peer_or_sentby: String,
}

impl TransactionKey {
    pub fn for_client(msg: &SipMessage, sent_by: SocketAddr) -> Option<Self> {
        let branch = msg.top_via_branch()?;
        let (_, method) = msg.cseq()?;
        Some(Self { branch, method, peer_or_sentby: sent_by.to_string() })
    }

    pub fn for_server(msg: &SipMessage, source: SocketAddr) -> Option<Self> {
        let branch = msg.top_via_branch()?;
        let (_, method) = msg.cseq()?;
        Some(Self { branch, method, peer_or_sentby: source.to_string() })
    }

    /// Key under which a CANCEL matches the INVITE it is cancelling:
    /// same branch, but the method field is normalized to INVITE.
    pub fn cancel_target(msg: &SipMessage, source: SocketAddr) -> Option<Self> {
        let branch = msg.top_via_branch()?;
        Some(Self { branch, method: SipMethod::Invite.to_string(), peer_or_sentby: source.to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteState {
    TryingOrProceeding,
    Completed,
    Terminated,
}

/// Categorized failure surfaced to the dialog/B2BUA layer on transaction
/// timeout or transport failure (spec.md §4.3, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionFailure {
    Timeout,
    TransportError(String),
    Cancelled,
}

/// Events a transaction emits upward to its owner (dialog layer, or the
/// transport layer directly for a dialogless stray message).
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    Provisional(SipMessage),
    Final(SipMessage),
    Failed(TransactionFailure),
    /// A server transaction received and absorbed a duplicate request.
    DuplicateAbsorbed,
}

/// Abstracts "send these bytes to this peer over this transport" so the
/// transaction layer does not depend on concrete socket types.
#[async_trait::async_trait]
pub trait TransportSender: Send + Sync {
    async fn send(&self, peer: SocketAddr, transport: TransportKind, bytes: Bytes) -> Result<()>;
}

struct RetransmitState {
    last_message: Bytes,
    peer: SocketAddr,
    transport: TransportKind,
    count: AtomicU32,
}

/// A client INVITE transaction (RFC 3261 §17.1.1).
pub struct ClientInviteTransaction {
    key: TransactionKey,
    state: Mutex<ClientInviteState>,
    retransmit: Arc<RetransmitState>,
    sender: Arc<dyn TransportSender>,
    events: mpsc::UnboundedSender<TransactionEvent>,
}

impl ClientInviteTransaction {
    pub fn spawn(
        key: TransactionKey,
        invite: Bytes,
        peer: SocketAddr,
        transport: TransportKind,
        sender: Arc<dyn TransportSender>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransactionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let tsx = Arc::new(Self {
            key,
            state: Mutex::new(ClientInviteState::Calling),
            retransmit: Arc::new(RetransmitState {
                last_message: invite,
                peer,
                transport,
                count: AtomicU32::new(0),
            }),
            sender,
            events,
        });
        tokio::spawn(tsx.clone().drive());
        (tsx, rx)
    }

    pub async fn state(&self) -> ClientInviteState {
        *self.state.lock().await
    }

    async fn drive(self: Arc<Self>) {
        if let Err(e) = self
            .sender
            .send(self.retransmit.peer, self.retransmit.transport, self.retransmit.last_message.clone())
            .await
        {
            let _ = self.events.send(TransactionEvent::Failed(TransactionFailure::TransportError(e.to_string())));
            return;
        }

        if self.retransmit.transport.is_reliable() {
            tokio::time::sleep(invite_client_timeout()).await;
            self.maybe_timeout().await;
            return;
        }

        let mut interval = T1;
        let mut elapsed = Duration::ZERO;
        loop {
            tokio::time::sleep(interval).await;
            elapsed += interval;
            if *self.state.lock().await != ClientInviteState::Calling {
                return;
            }
            if elapsed >= invite_client_timeout() {
                self.fire_timeout().await;
                return;
            }
            if let Err(e) = self
                .sender
                .send(self.retransmit.peer, self.retransmit.transport, self.retransmit.last_message.clone())
                .await
            {
                let _ = self.events.send(TransactionEvent::Failed(TransactionFailure::TransportError(e.to_string())));
                return;
            }
            self.retransmit.count.fetch_add(1, Ordering::SeqCst);
            interval = (interval * 2).min(T2);
        }
    }

    async fn maybe_timeout(&self) {
        let mut state = self.state.lock().await;
        if *state == ClientInviteState::Calling {
            *state = ClientInviteState::Terminated;
            drop(state);
            let _ = self.events.send(TransactionEvent::Failed(TransactionFailure::Timeout));
        }
    }

    async fn fire_timeout(&self) {
        self.maybe_timeout().await;
    }

    /// Feeds a response for this transaction (matched by the caller via
    /// [`TransactionKey`]).
    pub async fn on_response(&self, msg: SipMessage) {
        let mut state = self.state.lock().await;
        match *state {
            ClientInviteState::Calling | ClientInviteState::Proceeding => {
                if msg.is_provisional() {
                    *state = ClientInviteState::Proceeding;
                    drop(state);
                    let _ = self.events.send(TransactionEvent::Provisional(msg));
                } else if msg.is_final() {
                    *state = ClientInviteState::Completed;
                    drop(state);
                    let _ = self.events.send(TransactionEvent::Final(msg));
                    self.schedule_terminate_after_completed();
                }
            }
            ClientInviteState::Completed | ClientInviteState::Terminated => {
                // Non-2xx final responses may retransmit; a 2xx duplicate is
                // handled end-to-end by the dialog layer. Either way the
                // transaction itself does not re-emit.
            }
        }
    }

    fn schedule_terminate_after_completed(self: &Arc<Self> ) {
        let tsx = self.clone();
        // Timer D: wait for retransmits of non-2xx final responses on
        // unreliable transports before terminating.
        let wait = if tsx.retransmit.transport.is_reliable() { Duration::ZERO } else { Duration::from_secs(32) };
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let mut state = tsx.state.lock().await;
            *state = ClientInviteState::Terminated;
        });
    }
}

/// A client non-INVITE transaction (RFC 3261 §17.1.2).
pub struct ClientNonInviteTransaction {
    state: Mutex<NonInviteState>,
    retransmit: Arc<RetransmitState>,
    sender: Arc<dyn TransportSender>,
    events: mpsc::UnboundedSender<TransactionEvent>,
}

impl ClientNonInviteTransaction {
    pub fn spawn(
        request: Bytes,
        peer: SocketAddr,
        transport: TransportKind,
        sender: Arc<dyn TransportSender>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransactionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let tsx = Arc::new(Self {
            state: Mutex::new(NonInviteState::TryingOrProceeding),
            retransmit: Arc::new(RetransmitState {
                last_message: request,
                peer,
                transport,
                count: AtomicU32::new(0),
            }),
            sender,
            events,
        });
        tokio::spawn(tsx.clone().drive());
        (tsx, rx)
    }

    async fn drive(self: Arc<Self>) {
        if let Err(e) = self
            .sender
            .send(self.retransmit.peer, self.retransmit.transport, self.retransmit.last_message.clone())
            .await
        {
            let _ = self.events.send(TransactionEvent::Failed(TransactionFailure::TransportError(e.to_string())));
            return;
        }

        if self.retransmit.transport.is_reliable() {
            tokio::time::sleep(T1 * 64).await;
            self.fire_timeout_if_pending().await;
            return;
        }

        let mut interval = T1;
        let mut elapsed = Duration::ZERO;
        loop {
            tokio::time::sleep(interval).await;
            elapsed += interval;
            if *self.state.lock().await != NonInviteState::TryingOrProceeding {
                return;
            }
            if elapsed >= T1 * 64 {
                self.fire_timeout_if_pending().await;
                return;
            }
            let _ = self
                .sender
                .send(self.retransmit.peer, self.retransmit.transport, self.retransmit.last_message.clone())
                .await;
            self.retransmit.count.fetch_add(1, Ordering::SeqCst);
            interval = (interval * 2).min(T2);
        }
    }

    async fn fire_timeout_if_pending(&self) {
        let mut state = self.state.lock().await;
        if *state == NonInviteState::TryingOrProceeding {
            *state = NonInviteState::Terminated;
            drop(state);
            let _ = self.events.send(TransactionEvent::Failed(TransactionFailure::Timeout));
        }
    }

    pub async fn on_response(&self, msg: SipMessage) {
        let mut state = self.state.lock().await;
        match *state {
            NonInviteState::TryingOrProceeding => {
                if msg.is_provisional() {
                    drop(state);
                    let _ = self.events.send(TransactionEvent::Provisional(msg));
                } else {
                    *state = NonInviteState::Completed;
                    drop(state);
                    let _ = self.events.send(TransactionEvent::Final(msg));
                    let completed_wait = if self.retransmit.transport.is_reliable() { Duration::ZERO } else { T4 };
                    tokio::time::sleep(completed_wait).await;
                }
            }
            _ => {}
        }
    }
}

/// A server INVITE transaction (RFC 3261 §17.2.1).
pub struct ServerInviteTransaction {
    pub key: TransactionKey,
    state: Mutex<ServerInviteState>,
    last_response: Mutex<Option<Bytes>>,
    peer: SocketAddr,
    transport: TransportKind,
    sender: Arc<dyn TransportSender>,
}

impl ServerInviteTransaction {
    pub fn new(
        key: TransactionKey,
        peer: SocketAddr,
        transport: TransportKind,
        sender: Arc<dyn TransportSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(ServerInviteState::Proceeding),
            last_response: Mutex::new(None),
            peer,
            transport,
            sender,
        })
    }

    pub async fn state(&self) -> ServerInviteState {
        *self.state.lock().await
    }

    /// Sends a response for this transaction. Final non-2xx responses
    /// enter Completed and are retransmitted on timer G until an ACK is
    /// received (timer H) or the transport is reliable.
    pub async fn send_response(self: &Arc<Self>, msg: &SipMessage, bytes: Bytes) -> Result<()> {
        self.sender.send(self.peer, self.transport, bytes.clone()).await?;
        *self.last_response.lock().await = Some(bytes);

        if msg.is_final() {
            let mut state = self.state.lock().await;
            if msg.is_success() {
                // 2xx: the dialog layer owns retransmission of the 2xx
                // until ACK (end-to-end); the transaction itself just
                // terminates here per RFC 3261 §13.3.1.4.
                *state = ServerInviteState::Terminated;
            } else {
                *state = ServerInviteState::Completed;
                drop(state);
                self.clone().schedule_retransmit_g();
            }
        }
        Ok(())
    }

    fn schedule_retransmit_g(self: Arc<Self>) {
        if self.transport.is_reliable() {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(32)).await;
                let mut state = self.state.lock().await;
                if *state == ServerInviteState::Completed {
                    *state = ServerInviteState::Terminated;
                }
            });
            return;
        }
        tokio::spawn(async move {
            let mut interval = T1;
            loop {
                tokio::time::sleep(interval).await;
                let state = self.state.lock().await;
                if *state != ServerInviteState::Completed {
                    return;
                }
                drop(state);
                if let Some(bytes) = self.last_response.lock().await.clone() {
                    let _ = self.sender.send(self.peer, self.transport, bytes).await;
                }
                interval = (interval * 2).min(T2);
                if interval >= Duration::from_secs(32) {
                    let mut state = self.state.lock().await;
                    *state = ServerInviteState::Terminated;
                    return;
                }
            }
        });
    }

    /// ACK for a non-2xx final response is absorbed here (hop-by-hop);
    /// transitions Completed → Confirmed → (Timer I) Terminated.
    pub async fn on_ack(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if *state == ServerInviteState::Completed {
            *state = ServerInviteState::Confirmed;
            drop(state);
            let this = self.clone();
            tokio::spawn(async move {
                let wait = if this.transport.is_reliable() { Duration::ZERO } else { T4 };
                tokio::time::sleep(wait).await;
                *this.state.lock().await = ServerInviteState::Terminated;
            });
        }
    }

    /// Duplicate request received while Completed: replay the last
    /// response rather than re-running application logic (spec.md §8 P8).
    pub async fn replay_last_response(&self) -> Option<Bytes> {
        if *self.state.lock().await == ServerInviteState::Completed {
            self.last_response.lock().await.clone()
        } else {
            None
        }
    }
}

/// A server non-INVITE transaction (RFC 3261 §17.2.2).
pub struct ServerNonInviteTransaction {
    pub key: TransactionKey,
    state: Mutex<NonInviteState>,
    last_response: Mutex<Option<Bytes>>,
    peer: SocketAddr,
    transport: TransportKind,
    sender: Arc<dyn TransportSender>,
}

impl ServerNonInviteTransaction {
    pub fn new(
        key: TransactionKey,
        peer: SocketAddr,
        transport: TransportKind,
        sender: Arc<dyn TransportSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(NonInviteState::TryingOrProceeding),
            last_response: Mutex::new(None),
            peer,
            transport,
            sender,
        })
    }

    pub async fn send_response(self: &Arc<Self>, msg: &SipMessage, bytes: Bytes) -> Result<()> {
        self.sender.send(self.peer, self.transport, bytes.clone()).await?;
        *self.last_response.lock().await = Some(bytes);
        if msg.is_final() {
            let mut state = self.state.lock().await;
            *state = NonInviteState::Completed;
            drop(state);
            let this = self.clone();
            tokio::spawn(async move {
                let wait = if this.transport.is_reliable() { Duration::ZERO } else { T4 };
                tokio::time::sleep(wait).await;
                *this.state.lock().await = NonInviteState::Terminated;
            });
        }
        Ok(())
    }

    pub async fn replay_last_response(&self) -> Option<Bytes> {
        if *self.state.lock().await == NonInviteState::Completed {
            self.last_response.lock().await.clone()
        } else {
            None
        }
    }

    pub async fn is_terminated(&self) -> bool {
        *self.state.lock().await == NonInviteState::Terminated
    }
}

/// Sharded transaction table: spec.md §5 requires transaction tables to
/// be sharded by key with per-shard exclusion; `DashMap` already shards
/// internally so a single map satisfies that contract here.
#[derive(Default)]
pub struct TransactionTable {
    client_invite: DashMap<TransactionKey, Arc<ClientInviteTransaction>>,
    server_invite: DashMap<TransactionKey, Arc<ServerInviteTransaction>>,
    client_non_invite: DashMap<TransactionKey, Arc<ClientNonInviteTransaction>>,
    server_non_invite: DashMap<TransactionKey, Arc<ServerNonInviteTransaction>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_client_invite(&self, key: TransactionKey, tsx: Arc<ClientInviteTransaction>) {
        self.client_invite.insert(key, tsx);
    }

    pub fn get_client_invite(&self, key: &TransactionKey) -> Option<Arc<ClientInviteTransaction>> {
        self.client_invite.get(key).map(|e| e.clone())
    }

    pub fn insert_server_invite(&self, key: TransactionKey, tsx: Arc<ServerInviteTransaction>) {
        self.server_invite.insert(key, tsx);
    }

    pub fn get_server_invite(&self, key: &TransactionKey) -> Option<Arc<ServerInviteTransaction>> {
        self.server_invite.get(key).map(|e| e.clone())
    }

    pub fn insert_client_non_invite(&self, key: TransactionKey, tsx: Arc<ClientNonInviteTransaction>) {
        self.client_non_invite.insert(key, tsx);
    }

    pub fn get_client_non_invite(&self, key: &TransactionKey) -> Option<Arc<ClientNonInviteTransaction>> {
        self.client_non_invite.get(key).map(|e| e.clone())
    }

    pub fn insert_server_non_invite(&self, key: TransactionKey, tsx: Arc<ServerNonInviteTransaction>) {
        self.server_non_invite.insert(key, tsx);
    }

    pub fn get_server_non_invite(&self, key: &TransactionKey) -> Option<Arc<ServerNonInviteTransaction>> {
        self.server_non_invite.get(key).map(|e| e.clone())
    }

    pub fn remove_server_invite(&self, key: &TransactionKey) {
        self.server_invite.remove(key);
    }

    pub fn remove_client_invite(&self, key: &TransactionKey) {
        self.client_invite.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::sip::message::SipMethod;
    use std::sync::atomic::AtomicUsize;

    struct RecordingSender {
        sent: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl TransportSender for RecordingSender {
        async fn send(&self, _peer: SocketAddr, _transport: TransportKind, _bytes: Bytes) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn transaction_key_from_request() {
        let mut msg = SipMessage::new_request(SipMethod::Invite, "sip:bob@example.com");
        msg.headers.push("Via", "SIP/2.0/UDP host:5060;branch=z9hG4bK1");
        msg.headers.push("CSeq", "1 INVITE");
        let key = TransactionKey::for_client(&msg, "127.0.0.1:5060".parse().unwrap()).unwrap();
        assert_eq!(key.branch, "z9hG4bK1");
        assert_eq!(key.method, "INVITE");
    }

    #[tokio::test]
    async fn server_invite_replays_last_response_while_completed() {
        let sent = Arc::new(AtomicUsize::new(0));
        let sender = Arc::new(RecordingSender { sent: sent.clone() });
        let key = TransactionKey {
            branch: "z9hG4bK1".into(),
            method: "INVITE".into(),
            peer_or_sentby: "127.0.0.1:5060".into(),
        };
        let tsx = ServerInviteTransaction::new(key, "127.0.0.1:5060".parse().unwrap(), TransportKind::Tcp, sender);

        let resp = SipMessage::new_response(486, "Busy Here");
        tsx.send_response(&resp, Bytes::from_static(b"SIP/2.0 486 Busy Here\r\n\r\n")).await.unwrap();

        assert_eq!(tsx.state().await, ServerInviteState::Completed);
        let replay = tsx.replay_last_response().await;
        assert!(replay.is_some());
    }

    #[tokio::test]
    async fn server_invite_terminates_immediately_on_2xx() {
        let sent = Arc::new(AtomicUsize::new(0));
        let sender = Arc::new(RecordingSender { sent: sent.clone() });
        let key = TransactionKey {
            branch: "z9hG4bK2".into(),
            method: "INVITE".into(),
            peer_or_sentby: "127.0.0.1:5060".into(),
        };
        let tsx = ServerInviteTransaction::new(key, "127.0.0.1:5060".parse().unwrap(), TransportKind::Tcp, sender);

        let resp = SipMessage::new_response(200, "OK");
        tsx.send_response(&resp, Bytes::from_static(b"SIP/2.0 200 OK\r\n\r\n")).await.unwrap();
        assert_eq!(tsx.state().await, ServerInviteState::Terminated);
    }

    #[tokio::test]
    async fn client_non_invite_goes_trying_then_completed() {
        let sent = Arc::new(AtomicUsize::new(0));
        let sender = Arc::new(RecordingSender { sent: sent.clone() });
        let (tsx, mut rx) = ClientNonInviteTransaction::spawn(
            Bytes::from_static(b"OPTIONS sip:bob@example.com SIP/2.0\r\n\r\n"),
            "127.0.0.1:5060".parse().unwrap(),
            TransportKind::Tcp,
            sender,
        );
        tsx.on_response(SipMessage::new_response(200, "OK")).await;
        let evt = rx.recv().await.unwrap();
        assert!(matches!(evt, TransactionEvent::Final(_)));
    }
}
