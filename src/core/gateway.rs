//! Top-level gateway orchestrator (spec.md §4.1, §4.5): binds the SIP
//! transports, wires the transaction/dialog tables and services into a
//! [`CallContext`], and runs the inbound dispatch loop that feeds fresh
//! INVITEs to [`CallManager`] and in-dialog traffic to the owning call
//! actor.
//!
//! Grounded on the teacher's `core/gateway.rs` (`RedFireGateway`) for the
//! event-channel/`is_running`/background-task-vec lifecycle shape,
//! replacing its TDM/interface bring-up with SIP transport bind + dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::core::b2bua::{leg_key, B2buaPolicy, CallContext, CallEvent, CallManager, LegSide};
use crate::protocols::rtpengine::RtpEngineClient;
use crate::protocols::sip::transaction::{
    ServerInviteTransaction, ServerNonInviteTransaction, TransactionKey, TransactionTable, TransportSender,
};
use crate::protocols::sip::transport::{InboundDatagram, TcpTransport, UdpTransport};
use crate::protocols::sip::{parse_message, serialize_message, DialogId, DialogTable, SipMessage, SipMethod, TransportKind};
use crate::services::session_store::{RedisSessionStore, SessionStore};
use crate::services::SessionLimitPolicy;
use crate::{Error, Result};

/// Gateway status snapshot, exposed by `voice-ferry-coreadm status` and
/// the future admin surface (spec.md §11.4).
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub running: bool,
    pub uptime: Duration,
    pub node_id: String,
    pub udp_listen: Option<SocketAddr>,
    pub tcp_listen: Option<SocketAddr>,
}

/// Gateway lifecycle and call events, surfaced to whatever drives the
/// event loop (CLI, admin API, tests).
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Started,
    Stopped,
    CallStarted { call_id: String },
    CallEnded { call_id: String },
    Error { message: String },
}

/// Bridges the transaction layer's [`TransportSender`] trait over
/// whichever concrete transports are configured (spec.md §4.1: UDP is
/// mandatory, TCP optional).
struct TransportHub {
    udp: Arc<UdpTransport>,
    tcp: Option<Arc<TcpTransport>>,
}

#[async_trait::async_trait]
impl TransportSender for TransportHub {
    async fn send(&self, peer: SocketAddr, transport: TransportKind, bytes: Bytes) -> Result<()> {
        match transport {
            TransportKind::Udp => self.udp.send(peer, &bytes).await,
            TransportKind::Tcp | TransportKind::Tls => match &self.tcp {
                Some(tcp) => tcp.send(peer, &bytes).await,
                None => Err(Error::not_supported("TCP/TLS transport is not configured")),
            },
        }
    }
}

/// Top-level SIP B2BUA gateway.
pub struct Gateway {
    config: GatewayConfig,

    call_manager: Arc<CallManager>,
    transactions: Arc<TransactionTable>,
    dialogs: Arc<DialogTable>,
    transport: Option<Arc<TransportHub>>,

    event_tx: mpsc::UnboundedSender<GatewayEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<GatewayEvent>>,

    is_running: Arc<RwLock<bool>>,
    start_time: Option<Instant>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            call_manager: CallManager::new(),
            transactions: Arc::new(TransactionTable::new()),
            dialogs: Arc::new(DialogTable::new()),
            transport: None,
            event_tx,
            event_rx: Some(event_rx),
            is_running: Arc::new(RwLock::new(false)),
            start_time: None,
            tasks: Vec::new(),
        })
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<GatewayEvent>> {
        self.event_rx.take()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn get_status(&self) -> GatewayStatus {
        GatewayStatus {
            running: self.is_running().await,
            uptime: self.start_time.map(|t| t.elapsed()).unwrap_or_default(),
            node_id: self.config.general.node_id.clone(),
            udp_listen: self.config.sip.udp_addr().ok(),
            tcp_listen: self.config.sip.tcp_addr().ok().flatten(),
        }
    }

    /// Binds transports, builds the shared [`CallContext`], and spawns the
    /// inbound dispatch loop(s) (spec.md §4.1, §4.5, §6).
    pub async fn start(&mut self) -> Result<()> {
        info!("starting gateway {}", self.config.general.node_id);

        let udp_addr = self.config.sip.udp_addr()?;
        let (udp, udp_rx) = UdpTransport::bind(udp_addr).await?;
        let udp = Arc::new(udp);
        info!("SIP UDP listening on {}", udp.local_addr()?);

        let mut tcp_rx = None;
        let tcp = match self.config.sip.tcp_addr()? {
            Some(tcp_addr) => {
                let (tcp, rx) = TcpTransport::bind(tcp_addr).await?;
                let tcp = Arc::new(tcp);
                tcp_rx = Some(rx);
                info!("SIP TCP listening on {tcp_addr}");
                Some(tcp)
            }
            None => None,
        };

        let hub = Arc::new(TransportHub { udp: udp.clone(), tcp: tcp.clone() });
        self.transport = Some(hub.clone());
        let transport_sender: Arc<dyn TransportSender> = hub.clone();

        let rtpengine =
            RtpEngineClient::new(self.config.rtpengine.to_instances()?, self.config.rtpengine.ping_interval())
                .await?;

        let session_store: Arc<dyn SessionStore> = RedisSessionStore::connect(
            &self.config.session_store.redis_url,
            self.config.session_store.failure_policy.into(),
        )
        .await?;

        let session_limit = Arc::new(SessionLimitPolicy::new(
            (&self.config.session_limit).into(),
            session_store.clone(),
            self.config.session_store.failure_policy.into(),
        ));
        let routing = Arc::new(self.config.routing.build_policy()?);

        let policy = B2buaPolicy {
            forward_p_asserted_identity_from: self.config.sip.forward_p_asserted_identity_from.clone(),
            rtpengine_flags: self.config.sip.rtpengine_flags.clone(),
            idle_timeout: Duration::from_secs(self.config.general.call_idle_timeout_secs),
        };

        let ctx = CallContext {
            transactions: self.transactions.clone(),
            dialogs: self.dialogs.clone(),
            rtpengine,
            session_store,
            session_limit,
            routing,
            transport: transport_sender,
            policy,
        };

        self.tasks.push(tokio::spawn(udp.clone().run()));
        if let Some(tcp) = &tcp {
            let tcp = tcp.clone();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = tcp.run().await {
                    error!("TCP transport stopped: {e}");
                }
            }));
        }

        let manager = self.call_manager.clone();
        let transactions = self.transactions.clone();
        let sender = hub.clone();
        let events = self.event_tx.clone();
        self.tasks.push(tokio::spawn(dispatch_loop(udp_rx, manager.clone(), transactions.clone(), sender.clone(), ctx.clone(), events.clone())));

        if let Some(tcp_rx) = tcp_rx {
            self.tasks.push(tokio::spawn(dispatch_loop(tcp_rx, manager, transactions, sender, ctx, events)));
        }

        {
            let mut running = self.is_running.write().await;
            *running = true;
        }
        self.start_time = Some(Instant::now());
        let _ = self.event_tx.send(GatewayEvent::Started);
        info!("gateway started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping gateway");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        {
            let mut running = self.is_running.write().await;
            *running = false;
        }
        let _ = self.event_tx.send(GatewayEvent::Stopped);
        Ok(())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Inbound datagram dispatch: parses each datagram, matches it to an
/// existing transaction or hands it to [`CallManager`] as a fresh INVITE,
/// and routes in-dialog requests to the owning call actor (spec.md §4.3,
/// §4.5).
async fn dispatch_loop(
    mut inbound: mpsc::UnboundedReceiver<InboundDatagram>,
    manager: Arc<CallManager>,
    transactions: Arc<TransactionTable>,
    sender: Arc<TransportHub>,
    ctx: CallContext,
    events: mpsc::UnboundedSender<GatewayEvent>,
) {
    while let Some(datagram) = inbound.recv().await {
        let msg = match parse_message(&datagram.bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("discarding unparseable message from {}: {e}", datagram.peer);
                continue;
            }
        };

        if msg.is_request() {
            handle_request(msg, datagram.peer, datagram.transport, &manager, &transactions, &sender, &ctx, &events)
                .await;
        } else {
            handle_response(msg, datagram.peer, &transactions).await;
        }
    }
}

async fn handle_request(
    msg: SipMessage,
    peer: SocketAddr,
    transport: TransportKind,
    manager: &Arc<CallManager>,
    transactions: &Arc<TransactionTable>,
    sender: &Arc<TransportHub>,
    ctx: &CallContext,
    events: &mpsc::UnboundedSender<GatewayEvent>,
) {
    let transport_sender: Arc<dyn TransportSender> = sender.clone();

    match msg.method() {
        Some(SipMethod::Invite) if msg.to_tag().is_none() => {
            let Some(key) = TransactionKey::for_server(&msg, peer) else {
                warn!("initial INVITE from {peer} missing branch/CSeq, discarding");
                return;
            };
            if transactions.get_server_invite(&key).is_some() {
                // Retransmission of an INVITE already being processed;
                // the call actor has not sent a provisional yet so there
                // is nothing to replay.
                return;
            }
            let a_tsx = ServerInviteTransaction::new(key.clone(), peer, transport, transport_sender);
            transactions.insert_server_invite(key, a_tsx.clone());
            let call_id = msg.call_id().unwrap_or_default().to_string();
            manager.handle_initial_invite(msg, peer, transport, a_tsx, ctx.clone());
            let _ = events.send(GatewayEvent::CallStarted { call_id });
        }
        Some(SipMethod::Ack) => {
            if let Some(key) = TransactionKey::cancel_target(&msg, peer) {
                if let Some(a_tsx) = transactions.get_server_invite(&key) {
                    a_tsx.on_ack().await;
                }
            }
            route_in_dialog(&msg, CallEvent::ALegAck(msg.clone()), manager);
        }
        Some(SipMethod::Cancel) => handle_cancel(&msg, peer, transport, transactions, &transport_sender).await,
        Some(SipMethod::Invite) => {
            // Re-INVITE within an established dialog: validate CSeq
            // ordering against the dialog table before acknowledging at
            // the transaction layer (spec.md §4.4), then let the call
            // actor perform the media renegotiation asynchronously
            // (documented simplification, see DESIGN.md).
            let (status, reason) = in_dialog_status(&msg, &ctx.dialogs);
            let ok = respond_in_dialog(&msg, peer, transport, transactions, &transport_sender, true, status, reason).await;
            if ok && status == 200 {
                route_in_dialog(&msg, to_call_event(&msg, peer, transport), manager);
            }
        }
        Some(SipMethod::Bye) | Some(SipMethod::Info) | Some(SipMethod::Update) | Some(SipMethod::Options)
        | Some(SipMethod::Notify) => {
            let (status, reason) = in_dialog_status(&msg, &ctx.dialogs);
            let ok = respond_in_dialog(&msg, peer, transport, transactions, &transport_sender, false, status, reason).await;
            if ok && status == 200 {
                route_in_dialog(&msg, to_call_event(&msg, peer, transport), manager);
            }
        }
        _ => {
            warn!("unhandled or dialogless request {:?} from {peer}, discarding", msg.method());
        }
    }
}

fn to_call_event(msg: &SipMessage, peer: SocketAddr, transport: TransportKind) -> CallEvent {
    CallEvent::ALegRequest(msg.clone(), peer, transport)
}

/// Resolves the owning call actor by (Call-ID, To-tag) and forwards the
/// appropriately-sided event (spec.md §4.5 step 7).
fn route_in_dialog(msg: &SipMessage, event: CallEvent, manager: &Arc<CallManager>) {
    let (Some(call_id), Some(to_tag)) = (msg.call_id(), msg.to_tag()) else {
        warn!("in-dialog request missing Call-ID/To-tag, cannot route");
        return;
    };
    let Some((handle, side)) = manager.resolve_leg(&leg_key(call_id, &to_tag)) else {
        warn!("no call found for in-dialog request on call-id {call_id}");
        return;
    };
    let sided_event = match (side, event) {
        (LegSide::A, CallEvent::ALegRequest(m, p, t)) => CallEvent::ALegRequest(m, p, t),
        (LegSide::B, CallEvent::ALegRequest(m, p, t)) => CallEvent::BLegRequest(m, p, t),
        (_, other) => other,
    };
    handle.send(sided_event);
}

/// Validates an in-dialog request's CSeq against the dialog table *before*
/// any response is built (spec.md §4.4: out-of-order/duplicate CSeq yields
/// 500, not 200 OK). A dialog the table no longer holds (already torn
/// down, or a request that raced dialog removal) is let through unchecked
/// since there is nothing left to validate against. This both decides and
/// records the CSeq, so the call actor that later receives the mirrored
/// event must not re-validate it (see `mirror_in_dialog_request`).
fn in_dialog_status(msg: &SipMessage, dialogs: &Arc<DialogTable>) -> (u16, &'static str) {
    let (Some(call_id), Some(to_tag), Some(from_tag)) = (msg.call_id(), msg.to_tag(), msg.from_tag()) else {
        return (200, "OK");
    };
    let dialog_id = DialogId { call_id: call_id.to_string(), local_tag: to_tag, remote_tag: from_tag };
    if dialogs.get(&dialog_id).is_none() {
        return (200, "OK");
    }

    let mut accepted = true;
    dialogs.update(&dialog_id, |d| {
        if d.accept_in_dialog_request(msg).is_err() {
            accepted = false;
        }
    });
    if accepted {
        (200, "OK")
    } else {
        warn!("rejecting out-of-order in-dialog request on call-id {call_id}");
        (500, "Server Internal Error")
    }
}

/// Sends the in-dialog response built by the caller's CSeq check at the
/// transaction layer. `is_invite` selects the INVITE vs non-INVITE server
/// transaction state machine (spec.md §4.3).
async fn respond_in_dialog(
    msg: &SipMessage,
    peer: SocketAddr,
    transport: TransportKind,
    transactions: &Arc<TransactionTable>,
    sender: &Arc<dyn TransportSender>,
    is_invite: bool,
    status: u16,
    reason: &str,
) -> bool {
    let Some(key) = TransactionKey::for_server(msg, peer) else {
        warn!("in-dialog request from {peer} missing branch/CSeq, discarding");
        return false;
    };

    let mut response = SipMessage::new_response(status, reason);
    copy_request_headers(msg, &mut response);
    response.set_content_length();
    let bytes = serialize_message(&response);

    if is_invite {
        if let Some(existing) = transactions.get_server_invite(&key) {
            if let Some(replay) = existing.replay_last_response().await {
                let _ = sender.send(peer, transport, replay).await;
                return false;
            }
        }
        let tsx = ServerInviteTransaction::new(key.clone(), peer, transport, sender.clone());
        transactions.insert_server_invite(key, tsx.clone());
        if let Err(e) = tsx.send_response(&response, bytes).await {
            error!("failed to send in-dialog response to {peer}: {e}");
            return false;
        }
    } else {
        if let Some(existing) = transactions.get_server_non_invite(&key) {
            if let Some(replay) = existing.replay_last_response().await {
                let _ = sender.send(peer, transport, replay).await;
                return false;
            }
        }
        let tsx = ServerNonInviteTransaction::new(key.clone(), peer, transport, sender.clone());
        transactions.insert_server_non_invite(key, tsx.clone());
        if let Err(e) = tsx.send_response(&response, bytes).await {
            error!("failed to send in-dialog response to {peer}: {e}");
            return false;
        }
    }
    true
}

/// CANCEL handling (RFC 3261 §9): acknowledges the CANCEL itself and, if
/// the target INVITE is still Proceeding, sends 487 Request Terminated
/// upstream.
async fn handle_cancel(
    msg: &SipMessage,
    peer: SocketAddr,
    transport: TransportKind,
    transactions: &Arc<TransactionTable>,
    sender: &Arc<dyn TransportSender>,
) {
    let mut ok_response = SipMessage::new_response(200, "OK");
    copy_request_headers(msg, &mut ok_response);
    ok_response.set_content_length();
    let bytes = serialize_message(&ok_response);
    let tsx = ServerNonInviteTransaction::new(
        TransactionKey { branch: msg.top_via_branch().unwrap_or_default(), method: "CANCEL".into(), peer_or_sentby: peer.to_string() },
        peer,
        transport,
        sender.clone(),
    );
    let _ = tsx.send_response(&ok_response, bytes).await;

    let Some(invite_key) = TransactionKey::cancel_target(msg, peer) else { return };
    if let Some(a_tsx) = transactions.get_server_invite(&invite_key) {
        let mut terminated = SipMessage::new_response(487, "Request Terminated");
        copy_request_headers(msg, &mut terminated);
        terminated.set_content_length();
        let bytes = serialize_message(&terminated);
        if let Err(e) = a_tsx.send_response(&terminated, bytes).await {
            warn!("failed to send 487 for cancelled INVITE: {e}");
        }
    }
}

/// Copies `Via`, `From`, `To`, `Call-ID`, `CSeq` from a request onto a
/// response being built in reply to it (RFC 3261 §8.2.6).
fn copy_request_headers(request: &SipMessage, response: &mut SipMessage) {
    for via in request.headers.get_all("Via") {
        response.headers.push("Via", via.to_string());
    }
    if let Some(from) = request.headers.get("From") {
        response.headers.push("From", from.to_string());
    }
    if let Some(to) = request.headers.get("To") {
        response.headers.push("To", to.to_string());
    }
    if let Some(call_id) = request.headers.get("Call-ID") {
        response.headers.push("Call-ID", call_id.to_string());
    }
    if let Some(cseq) = request.headers.get("CSeq") {
        response.headers.push("CSeq", cseq.to_string());
    }
}

async fn handle_response(msg: SipMessage, peer: SocketAddr, transactions: &Arc<TransactionTable>) {
    let Some(key) = TransactionKey::for_client(&msg, peer) else {
        warn!("response from {peer} missing branch/CSeq, discarding");
        return;
    };

    if key.method == "INVITE" {
        if let Some(tsx) = transactions.get_client_invite(&key) {
            tsx.on_response(msg).await;
            return;
        }
    } else if let Some(tsx) = transactions.get_client_non_invite(&key) {
        tsx.on_response(msg).await;
        return;
    }
    warn!("response from {peer} matched no pending transaction (branch {})", key.branch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::sip::{Dialog, SipMethod};

    fn bye_with_cseq(seq: u32) -> SipMessage {
        let mut bye = SipMessage::new_request(SipMethod::Bye, "sip:alice@example.com");
        bye.headers.push("Via", "SIP/2.0/UDP host:5060;branch=z9hG4bK2");
        bye.headers.push("From", "<sip:bob@example.com>;tag=remote-tag");
        bye.headers.push("To", "<sip:alice@example.com>;tag=local-tag");
        bye.headers.push("Call-ID", "call-cseq-1");
        bye.headers.push("CSeq", format!("{seq} BYE"));
        bye
    }

    #[test]
    fn in_dialog_status_accepts_next_cseq_and_rejects_a_replay() {
        let mut invite = SipMessage::new_request(SipMethod::Invite, "sip:alice@example.com");
        invite.headers.push("From", "<sip:bob@example.com>;tag=remote-tag");
        invite.headers.push("To", "<sip:alice@example.com>");
        invite.headers.push("Call-ID", "call-cseq-1");
        invite.headers.push("CSeq", "1 INVITE");

        let dialog = Dialog::from_uas("call-cseq-1", "local-tag", &invite).unwrap();
        let dialogs = Arc::new(DialogTable::new());
        dialogs.insert(dialog);

        assert_eq!(in_dialog_status(&bye_with_cseq(2), &dialogs), (200, "OK"));
        // CSeq 2 was just recorded as the dialog's remote_cseq; a replay
        // or an out-of-order request carrying it again must be rejected
        // before any response is sent (spec.md §4.4).
        assert_eq!(in_dialog_status(&bye_with_cseq(2), &dialogs), (500, "Server Internal Error"));
    }

    #[test]
    fn in_dialog_status_defaults_to_ok_for_an_untracked_dialog() {
        let dialogs = Arc::new(DialogTable::new());
        assert_eq!(in_dialog_status(&bye_with_cseq(5), &dialogs), (200, "OK"));
    }

    #[test]
    fn copy_request_headers_preserves_dialog_identifiers() {
        let mut request = SipMessage::new_request(SipMethod::Bye, "sip:bob@example.com");
        request.headers.push("Via", "SIP/2.0/UDP host:5060;branch=z9hG4bK1");
        request.headers.push("From", "<sip:alice@example.com>;tag=aaa");
        request.headers.push("To", "<sip:bob@example.com>;tag=bbb");
        request.headers.push("Call-ID", "call-1");
        request.headers.push("CSeq", "2 BYE");

        let mut response = SipMessage::new_response(200, "OK");
        copy_request_headers(&request, &mut response);

        assert_eq!(response.headers.get("Call-ID"), Some("call-1"));
        assert_eq!(response.headers.get("To"), Some("<sip:bob@example.com>;tag=bbb"));
        assert_eq!(response.headers.get("CSeq"), Some("2 BYE"));
    }
}
