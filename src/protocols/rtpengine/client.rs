//! RTPEngine NG protocol client (spec.md §4.6): cookie-correlated UDP
//! RPC, instance pool, health checks, retransmission.
//!
//! Structurally grounded on the teacher's `services/media_relay.rs`
//! event-enum/session-table idiom (`MediaRelayEvent`,
//! `DashMap<String, MediaRelaySession>`), generalized from in-process
//! packet relay bookkeeping to an out-of-process NG-protocol session and
//! UDP RPC client, per spec.md §9's "UDP RPC correlation" pattern.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::bencode::{decode, encode, BValue};
use crate::{Error, Result};

const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(500);
const MAX_RETRANSMITS: u32 = 3;
const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_STALE_FACTOR: u32 = 2;

#[derive(Debug, Clone)]
pub struct RtpEngineInstance {
    pub id: String,
    pub addr: SocketAddr,
    pub weight: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtpEngineReply {
    Ok(BTreeMap<Vec<u8>, BValue>),
    Pong,
    Error(String),
}

/// Media-session key (spec.md §3 "RTPEngine Media Session"): scoped to a
/// single RTPEngine instance once selected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaSessionKey {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
}

struct InstanceHealth {
    last_pong_at: Option<Instant>,
}

struct InstanceState {
    instance: RtpEngineInstance,
    socket: Arc<UdpSocket>,
    health: std::sync::Mutex<InstanceHealth>,
    pending: DashMap<String, oneshot::Sender<RtpEngineReply>>,
}

/// Pool of configured RTPEngine instances with per-call affinity
/// (spec.md §4.6): once a call selects an instance, all subsequent
/// commands for that call go to the same instance.
pub struct RtpEngineClient {
    instances: Vec<Arc<InstanceState>>,
    call_affinity: DashMap<String, usize>,
    cookie_counter: AtomicU64,
    rr_cursor: AtomicUsize,
    ping_interval: Duration,
}

impl RtpEngineClient {
    pub async fn new(instances: Vec<RtpEngineInstance>, ping_interval: Duration) -> Result<Arc<Self>> {
        let mut states = Vec::with_capacity(instances.len());
        for instance in instances {
            let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
            socket.connect(instance.addr).await?;
            states.push(Arc::new(InstanceState {
                instance,
                socket,
                health: std::sync::Mutex::new(InstanceHealth { last_pong_at: None }),
                pending: DashMap::new(),
            }));
        }

        let client = Arc::new(Self {
            instances: states,
            call_affinity: DashMap::new(),
            cookie_counter: AtomicU64::new(1),
            rr_cursor: AtomicUsize::new(0),
            ping_interval,
        });

        for state in &client.instances {
            tokio::spawn(receive_loop(state.clone()));
        }
        let health_client = client.clone();
        tokio::spawn(async move { health_client.run_health_loop().await });

        Ok(client)
    }

    fn generate_cookie(&self) -> String {
        let n = self.cookie_counter.fetch_add(1, Ordering::Relaxed);
        format!("{n:08x}")
    }

    /// Weighted round-robin selection among enabled, healthy instances;
    /// only consulted on a call's *first* RTPEngine command (spec.md
    /// §4.6 "Selection").
    fn select_instance(&self) -> Result<usize> {
        let candidates: Vec<(usize, u32)> = self
            .instances
            .iter()
            .enumerate()
            .filter(|(_, s)| s.instance.enabled && self.is_healthy(s))
            .map(|(i, s)| (i, s.instance.weight.max(1)))
            .collect();

        if candidates.is_empty() {
            return Err(Error::rtp_engine("no healthy RTPEngine instance available"));
        }

        let total_weight: u32 = candidates.iter().map(|(_, w)| w).sum();
        let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed) as u32 % total_weight.max(1);
        let mut acc = 0u32;
        for (idx, weight) in &candidates {
            acc += weight;
            if cursor < acc {
                return Ok(*idx);
            }
        }
        Ok(candidates[0].0)
    }

    fn is_healthy(&self, state: &InstanceState) -> bool {
        let guard = state.health.lock().expect("health lock poisoned");
        match guard.last_pong_at {
            Some(t) => t.elapsed() < self.ping_interval * HEALTH_STALE_FACTOR,
            None => true, // Not yet pinged: optimistically available.
        }
    }

    fn instance_for_call(&self, call_id: &str) -> Result<usize> {
        if let Some(idx) = self.call_affinity.get(call_id) {
            return Ok(*idx);
        }
        let idx = self.select_instance()?;
        self.call_affinity.insert(call_id.to_string(), idx);
        Ok(idx)
    }

    pub fn release_call(&self, call_id: &str) {
        self.call_affinity.remove(call_id);
    }

    /// Sends `offer` with the A-leg SDP, returning the RTPEngine-rewritten
    /// SDP (spec.md §4.5 step 3).
    pub async fn offer(&self, key: &MediaSessionKey, sdp: &[u8], flags: &[&str]) -> Result<Vec<u8>> {
        self.sdp_command("offer", key, sdp, flags).await
    }

    /// Sends `answer` with the B-leg SDP (spec.md §4.5 step 6).
    pub async fn answer(&self, key: &MediaSessionKey, sdp: &[u8], flags: &[&str]) -> Result<Vec<u8>> {
        self.sdp_command("answer", key, sdp, flags).await
    }

    /// Sends `delete`, tearing down the media session (spec.md §4.5 step
    /// 8, §8 P2: at most once, at least once before resources release).
    pub async fn delete(&self, key: &MediaSessionKey) -> Result<()> {
        let mut dict = BValue::dict();
        dict.insert(b"command".to_vec(), BValue::str("delete"));
        dict.insert(b"call-id".to_vec(), BValue::str(key.call_id.clone()));
        dict.insert(b"from-tag".to_vec(), BValue::str(key.from_tag.clone()));
        if let Some(to_tag) = &key.to_tag {
            dict.insert(b"to-tag".to_vec(), BValue::str(to_tag.clone()));
        }
        self.send_request(&key.call_id, dict).await?;
        self.release_call(&key.call_id);
        Ok(())
    }

    async fn sdp_command(
        &self,
        command: &str,
        key: &MediaSessionKey,
        sdp: &[u8],
        flags: &[&str],
    ) -> Result<Vec<u8>> {
        let mut dict = BValue::dict();
        dict.insert(b"command".to_vec(), BValue::str(command));
        dict.insert(b"call-id".to_vec(), BValue::str(key.call_id.clone()));
        dict.insert(b"from-tag".to_vec(), BValue::str(key.from_tag.clone()));
        if let Some(to_tag) = &key.to_tag {
            dict.insert(b"to-tag".to_vec(), BValue::str(to_tag.clone()));
        }
        dict.insert(b"sdp".to_vec(), BValue::Bytes(sdp.to_vec()));
        if !flags.is_empty() {
            dict.insert(
                b"flags".to_vec(),
                BValue::List(flags.iter().map(|f| BValue::str(*f)).collect()),
            );
        }

        let reply = self.send_request(&key.call_id, dict).await?;
        match reply {
            RtpEngineReply::Ok(fields) => fields
                .get(b"sdp".as_slice())
                .and_then(|v| v.as_bytes())
                .map(|b| b.to_vec())
                .ok_or_else(|| Error::rtp_engine("offer/answer reply missing sdp field")),
            RtpEngineReply::Error(reason) => Err(Error::RtpEngineRejected(reason)),
            RtpEngineReply::Pong => Err(Error::rtp_engine("unexpected pong reply to SDP command")),
        }
    }

    async fn send_request(&self, call_id: &str, dict: BTreeMap<Vec<u8>, BValue>) -> Result<RtpEngineReply> {
        let idx = self.instance_for_call(call_id)?;
        let state = self.instances[idx].clone();
        self.send_with_retransmit(&state, dict, DEFAULT_TOTAL_TIMEOUT).await
    }

    async fn send_with_retransmit(
        &self,
        state: &Arc<InstanceState>,
        dict: BTreeMap<Vec<u8>, BValue>,
        total_timeout: Duration,
    ) -> Result<RtpEngineReply> {
        let cookie = self.generate_cookie();
        let mut payload = cookie.clone().into_bytes();
        payload.push(b' ');
        payload.extend(encode(&BValue::Dict(dict)));

        let (tx, mut rx) = oneshot::channel();
        state.pending.insert(cookie.clone(), tx);

        let deadline = Instant::now() + total_timeout;
        let mut attempt = 0;
        loop {
            state.socket.send(&payload).await?;
            attempt += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let per_attempt = remaining.min(RETRANSMIT_INTERVAL);
            if per_attempt.is_zero() {
                break;
            }

            match timeout(per_attempt, &mut rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => break, // sender dropped: treat as failure below.
                Err(_elapsed) => {
                    if attempt >= MAX_RETRANSMITS || Instant::now() >= deadline {
                        break;
                    }
                    continue;
                }
            }
        }

        state.pending.remove(&cookie);
        Err(Error::RtpEngineTimeout(format!("no reply for cookie {cookie} after {attempt} attempt(s)")))
    }

    async fn run_health_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.ping_interval);
        loop {
            interval.tick().await;
            for state in &self.instances {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = ping_instance(&state).await {
                        warn!("RTPEngine instance {} ping failed: {e}", state.instance.id);
                    }
                });
            }
        }
    }

    pub fn instance_health_snapshot(&self) -> Vec<(String, bool)> {
        self.instances
            .iter()
            .map(|s| (s.instance.id.clone(), self.is_healthy(s)))
            .collect()
    }
}

/// RTPEngine NG requires a *fresh* socket for health checks, to avoid
/// socket-state confusion across deployments that NAT or proxy UDP
/// (spec.md §4.6).
async fn ping_instance(state: &Arc<InstanceState>) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(state.instance.addr).await?;

    let cookie = format!("{:08x}", rand::random::<u32>());
    let mut dict = BValue::dict();
    dict.insert(b"command".to_vec(), BValue::str("ping"));
    let mut payload = cookie.clone().into_bytes();
    payload.push(b' ');
    payload.extend(encode(&BValue::Dict(dict)));

    socket.send(&payload).await?;

    let mut buf = vec![0u8; 4096];
    let n = timeout(PING_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::RtpEngineTimeout(format!("ping to {} timed out", state.instance.id)))??;

    let (reply_cookie, reply) = parse_reply(&buf[..n])?;
    if reply_cookie != cookie {
        return Err(Error::rtp_engine("ping reply cookie mismatch"));
    }
    if matches!(reply, RtpEngineReply::Pong) {
        state.health.lock().expect("health lock poisoned").last_pong_at = Some(Instant::now());
        Ok(())
    } else {
        Err(Error::rtp_engine("ping did not receive pong"))
    }
}

fn parse_reply(bytes: &[u8]) -> Result<(String, RtpEngineReply)> {
    let space = bytes
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| Error::rtp_engine("malformed reply: no cookie separator"))?;
    let cookie = std::str::from_utf8(&bytes[..space])
        .map_err(|_| Error::rtp_engine("non-UTF8 cookie"))?
        .to_string();

    let decoded = decode(&bytes[space + 1..]).map_err(|e| Error::rtp_engine(e.to_string()))?;
    let dict = decoded.as_dict().ok_or_else(|| Error::rtp_engine("reply is not a dictionary"))?;
    let result = dict
        .get(b"result".as_slice())
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::rtp_engine("reply missing result field"))?;

    let reply = match result {
        "ok" => RtpEngineReply::Ok(dict.clone()),
        "pong" => RtpEngineReply::Pong,
        "error" => {
            let reason = dict
                .get(b"error-reason".as_slice())
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            RtpEngineReply::Error(reason)
        }
        other => return Err(Error::rtp_engine(format!("unrecognized result '{other}'"))),
    };
    Ok((cookie, reply))
}

async fn receive_loop(state: Arc<InstanceState>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let n = match state.socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("RTPEngine instance {} recv error: {e}", state.instance.id);
                return;
            }
        };

        let (cookie, reply) = match parse_reply(&buf[..n]) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("discarding malformed RTPEngine reply from {}: {e}", state.instance.id);
                continue;
            }
        };

        // Responses with unknown cookies are discarded (spec.md §4.6,
        // §8 P4): `remove` only succeeds if a waiter is still pending.
        if let Some((_, waiter)) = state.pending.remove(&cookie) {
            let _ = waiter.send(reply);
        } else {
            debug!("discarding RTPEngine reply with unknown cookie {cookie}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_session_key_hashable_and_comparable() {
        let a = MediaSessionKey { call_id: "c1".into(), from_tag: "f1".into(), to_tag: None };
        let b = MediaSessionKey { call_id: "c1".into(), from_tag: "f1".into(), to_tag: None };
        assert_eq!(a, b);
    }

    #[test]
    fn parses_ok_reply() {
        let mut dict = BValue::dict();
        dict.insert(b"result".to_vec(), BValue::str("ok"));
        dict.insert(b"sdp".to_vec(), BValue::str("v=0"));
        let mut payload = b"abcd1234 ".to_vec();
        payload.extend(encode(&BValue::Dict(dict)));

        let (cookie, reply) = parse_reply(&payload).unwrap();
        assert_eq!(cookie, "abcd1234");
        match reply {
            RtpEngineReply::Ok(fields) => {
                assert_eq!(fields.get(b"sdp".as_slice()).and_then(|v| v.as_str()), Some("v=0"));
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn parses_pong_reply() {
        let raw = b"b4c1f0a2 d6:result4:ponge";
        let (cookie, reply) = parse_reply(raw).unwrap();
        assert_eq!(cookie, "b4c1f0a2");
        assert_eq!(reply, RtpEngineReply::Pong);
    }

    #[test]
    fn parses_error_reply() {
        let mut dict = BValue::dict();
        dict.insert(b"result".to_vec(), BValue::str("error"));
        dict.insert(b"error-reason".to_vec(), BValue::str("no such stream"));
        let mut payload = b"cafebabe ".to_vec();
        payload.extend(encode(&BValue::Dict(dict)));

        let (_, reply) = parse_reply(&payload).unwrap();
        assert_eq!(reply, RtpEngineReply::Error("no such stream".to_string()));
    }

    #[test]
    fn malformed_reply_is_rejected_not_panicking() {
        assert!(parse_reply(b"b4c1f0a2 X not-a-dict").is_err());
    }
}
