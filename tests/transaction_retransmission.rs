//! Client INVITE transaction retransmission and Timer B (spec.md §8
//! scenario 5): unanswered INVITE retransmits on a doubling, T2-capped
//! interval and eventually fails with `Failed(Timeout)`.
//!
//! Runs on paused virtual time ([`tokio::time::advance`]) so the test
//! does not spend ~35 real seconds waiting out Timer B.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;

use voice_ferry_core::protocols::sip::transaction::{ClientInviteTransaction, TransactionEvent, TransactionFailure, TransportSender, T2};
use voice_ferry_core::protocols::sip::{TransactionKey, TransportKind};
use voice_ferry_core::Result;

struct RecordingTransport {
    sends: Mutex<Vec<tokio::time::Instant>>,
}

#[async_trait::async_trait]
impl TransportSender for RecordingTransport {
    async fn send(&self, _peer: SocketAddr, _transport: TransportKind, _bytes: Bytes) -> Result<()> {
        self.sends.lock().await.push(tokio::time::Instant::now());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_invite_retransmits_with_backoff_then_times_out() {
    let transport = Arc::new(RecordingTransport { sends: Mutex::new(Vec::new()) });
    let sender: Arc<dyn TransportSender> = transport.clone();
    let peer: SocketAddr = "127.0.0.1:5060".parse().unwrap();
    let key = TransactionKey { branch: "z9hG4bKretx1".into(), method: "INVITE".into(), peer_or_sentby: peer.to_string() };

    let (_tsx, mut events) =
        ClientInviteTransaction::spawn(key, Bytes::from_static(b"INVITE sip:bob@example.com SIP/2.0\r\n\r\n"), peer, TransportKind::Udp, sender);

    // Timer B fires at 32s; advance well past it so the whole
    // retransmission sequence (and the final timeout) plays out.
    tokio::time::advance(Duration::from_secs(40)).await;

    let event = events.recv().await.expect("transaction must emit an event before terminating");
    assert!(
        matches!(event, TransactionEvent::Failed(TransactionFailure::Timeout)),
        "expected Failed(Timeout), got {event:?}"
    );

    let sends = transport.sends.lock().await;
    assert!(sends.len() >= 2, "the INVITE must have been retransmitted at least once, got {} sends", sends.len());

    // Intervals must never shrink and must never exceed T2 (RFC 3261
    // §17.1.1.2's doubling-capped backoff).
    let mut previous_interval: Option<Duration> = None;
    for pair in sends.windows(2) {
        let interval = pair[1] - pair[0];
        assert!(interval <= T2, "retransmit interval {interval:?} exceeds T2 ({T2:?})");
        if let Some(prev) = previous_interval {
            assert!(interval >= prev || interval == T2, "retransmit interval shrank from {prev:?} to {interval:?}");
        }
        previous_interval = Some(interval);
    }
}
