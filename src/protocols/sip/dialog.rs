//! Dialog layer (spec.md §4.4): dialog identification, CSeq ordering,
//! route-set, target refresh.
//!
//! Grounded on `DasWolke-rsipstack/src/dialog/dialog.rs` for the
//! Early/Confirmed lifecycle and on
//! `other_examples/0c63c11e_omani-rsipstack__src-dialog-dialog.rs.rs` for
//! the plain-struct shape, adapted to the teacher's `dashmap`-sharded
//! session table idiom (`protocols::sip::SipHandler.sessions`).

use std::time::Instant;

use dashmap::DashMap;

use super::message::SipMessage;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub local_uri: String,
    pub remote_uri: String,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    /// Ordered `Record-Route` set, already reversed for the UAC side
    /// (spec.md §4.4).
    pub route_set: Vec<String>,
    pub remote_target: String,
    pub secure: bool,
    pub state: DialogState,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Dialog {
    /// Builds the dialog-establishing side's (UAC) dialog from the
    /// INVITE it sent and a provisional-with-tag or 2xx response.
    pub fn from_uac(call_id: &str, local_tag: &str, invite: &SipMessage, response: &SipMessage) -> Result<Self> {
        let remote_tag = response
            .to_tag()
            .ok_or_else(|| Error::Dialog("response missing To tag".into()))?;

        let remote_target = response
            .headers
            .get("Contact")
            .and_then(|c| extract_uri(c))
            .unwrap_or_else(|| invite.request_uri().unwrap_or_default().to_string());

        let route_set: Vec<String> = response
            .headers
            .get_all("Record-Route")
            .into_iter()
            .map(|s| s.to_string())
            .rev()
            .collect();

        let state = if response.is_success() { DialogState::Confirmed } else { DialogState::Early };

        let now = Instant::now();
        Ok(Self {
            id: DialogId {
                call_id: call_id.to_string(),
                local_tag: local_tag.to_string(),
                remote_tag,
            },
            local_uri: invite.headers.get("From").unwrap_or_default().to_string(),
            remote_uri: invite.headers.get("To").unwrap_or_default().to_string(),
            local_cseq: invite.cseq().map(|(s, _)| s).unwrap_or(1),
            remote_cseq: 0,
            route_set,
            remote_target,
            secure: false,
            state,
            created_at: now,
            last_activity: now,
        })
    }

    /// Builds the receiving side's (UAS) dialog from the INVITE it
    /// received and the provisional-with-tag or 2xx it is about to send.
    pub fn from_uas(call_id: &str, local_tag: &str, invite: &SipMessage) -> Result<Self> {
        let remote_tag = invite
            .from_tag()
            .ok_or_else(|| Error::Dialog("request missing From tag".into()))?;

        let remote_target = invite
            .headers
            .get("Contact")
            .and_then(|c| extract_uri(c))
            .unwrap_or_default();

        let route_set: Vec<String> = invite
            .headers
            .get_all("Record-Route")
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let now = Instant::now();
        Ok(Self {
            id: DialogId { call_id: call_id.to_string(), local_tag: local_tag.to_string(), remote_tag },
            local_uri: invite.headers.get("To").unwrap_or_default().to_string(),
            remote_uri: invite.headers.get("From").unwrap_or_default().to_string(),
            local_cseq: 0,
            remote_cseq: invite.cseq().map(|(s, _)| s).unwrap_or(1),
            route_set,
            remote_target,
            secure: false,
            state: DialogState::Early,
            created_at: now,
            last_activity: now,
        })
    }

    pub fn confirm(&mut self) {
        self.state = DialogState::Confirmed;
        self.touch();
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Validates and records an in-dialog request's CSeq, updating the
    /// remote target on target-refresh methods (INVITE, UPDATE).
    /// Returns an error the caller maps to 500 Server Internal Error on
    /// out-of-order / duplicate CSeq (spec.md §4.4).
    pub fn accept_in_dialog_request(&mut self, msg: &SipMessage) -> Result<()> {
        let (seq, method) = msg.cseq().ok_or_else(|| Error::Dialog("missing CSeq".into()))?;
        if seq <= self.remote_cseq && self.remote_cseq != 0 {
            return Err(Error::Dialog(format!(
                "out-of-order CSeq {seq} (expected > {})",
                self.remote_cseq
            )));
        }
        self.remote_cseq = seq;
        self.touch();

        if matches!(method.as_str(), "INVITE" | "UPDATE") {
            if let Some(contact) = msg.headers.get("Contact").and_then(extract_uri) {
                self.remote_target = contact;
            }
        }
        Ok(())
    }

    pub fn next_local_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }
}

fn extract_uri(contact_header: &str) -> Option<String> {
    let trimmed = contact_header.trim();
    if let Some(start) = trimmed.find('<') {
        let rest = &trimmed[start + 1..];
        let end = rest.find('>')?;
        return Some(rest[..end].to_string());
    }
    // Bare URI form without display name or angle brackets: take
    // everything up to the first `;` parameter.
    Some(trimmed.split(';').next()?.trim().to_string())
}

/// Sharded dialog table keyed by [`DialogId`] (spec.md §5).
#[derive(Default)]
pub struct DialogTable {
    dialogs: DashMap<DialogId, Dialog>,
    /// Early dialogs may multiply per 1xx-with-tag before one confirms;
    /// indexed by Call-ID + local-tag so the B2BUA can find all of a
    /// call's early dialogs and collapse to the first one that confirms.
    by_call_and_local_tag: DashMap<(String, String), Vec<DialogId>>,
}

impl DialogTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dialog: Dialog) {
        let index_key = (dialog.id.call_id.clone(), dialog.id.local_tag.clone());
        self.by_call_and_local_tag
            .entry(index_key)
            .or_default()
            .push(dialog.id.clone());
        self.dialogs.insert(dialog.id.clone(), dialog);
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|e| e.clone())
    }

    pub fn update<F: FnOnce(&mut Dialog)>(&self, id: &DialogId, f: F) -> bool {
        if let Some(mut entry) = self.dialogs.get_mut(id) {
            f(&mut entry);
            true
        } else {
            false
        }
    }

    /// On confirmation, removes every other early dialog sharing the same
    /// (Call-ID, local-tag) — RFC 3261 §12.1.2's "collapse to one".
    pub fn collapse_to_confirmed(&self, confirmed: &DialogId) {
        let index_key = (confirmed.call_id.clone(), confirmed.local_tag.clone());
        if let Some(mut siblings) = self.by_call_and_local_tag.get_mut(&index_key) {
            for id in siblings.iter() {
                if id != confirmed {
                    self.dialogs.remove(id);
                }
            }
            siblings.retain(|id| id == confirmed);
        }
    }

    pub fn remove(&self, id: &DialogId) {
        self.dialogs.remove(id);
        let index_key = (id.call_id.clone(), id.local_tag.clone());
        if let Some(mut siblings) = self.by_call_and_local_tag.get_mut(&index_key) {
            siblings.retain(|existing| existing != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::sip::message::SipMethod;

    fn sample_invite() -> SipMessage {
        let mut msg = SipMessage::new_request(SipMethod::Invite, "sip:bob@example.com");
        msg.headers.push("From", "Alice <sip:alice@example.com>;tag=aaa");
        msg.headers.push("To", "Bob <sip:bob@example.com>");
        msg.headers.push("Call-ID", "call-1");
        msg.headers.push("CSeq", "1 INVITE");
        msg.headers.push("Contact", "<sip:alice@1.2.3.4:5060>");
        msg
    }

    #[test]
    fn uac_dialog_built_from_2xx() {
        let invite = sample_invite();
        let mut response = SipMessage::new_response(200, "OK");
        response.headers.push("To", "Bob <sip:bob@example.com>;tag=bbb");
        response.headers.push("Contact", "<sip:bob@5.6.7.8:5060>");
        response.headers.push("Record-Route", "<sip:proxy1>");
        response.headers.push("Record-Route", "<sip:proxy2>");

        let dialog = Dialog::from_uac("call-1", "aaa", &invite, &response).unwrap();
        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.id.remote_tag, "bbb");
        assert_eq!(dialog.remote_target, "sip:bob@5.6.7.8:5060");
        assert_eq!(dialog.route_set, vec!["<sip:proxy2>", "<sip:proxy1>"]);
    }

    #[test]
    fn rejects_out_of_order_cseq() {
        let invite = sample_invite();
        let mut dialog = Dialog::from_uas("call-1", "bbb", &invite).unwrap();
        dialog.remote_cseq = 5;

        let mut reinvite = sample_invite();
        reinvite.headers.set("CSeq", "3 INVITE");
        assert!(dialog.accept_in_dialog_request(&reinvite).is_err());
    }

    #[test]
    fn target_refresh_updates_remote_target() {
        let invite = sample_invite();
        let mut dialog = Dialog::from_uas("call-1", "bbb", &invite).unwrap();
        dialog.remote_cseq = 1;

        let mut reinvite = sample_invite();
        reinvite.headers.set("CSeq", "2 INVITE");
        reinvite.headers.set("Contact", "<sip:alice@9.9.9.9:5060>");
        dialog.accept_in_dialog_request(&reinvite).unwrap();
        assert_eq!(dialog.remote_target, "sip:alice@9.9.9.9:5060");
    }

    #[test]
    fn collapse_removes_sibling_early_dialogs() {
        let table = DialogTable::new();
        let invite = sample_invite();

        let mut r1 = SipMessage::new_response(180, "Ringing");
        r1.headers.push("To", "Bob <sip:bob@example.com>;tag=early1");
        let d1 = Dialog::from_uac("call-1", "aaa", &invite, &r1).unwrap();

        let mut r2 = SipMessage::new_response(200, "OK");
        r2.headers.push("To", "Bob <sip:bob@example.com>;tag=final2");
        let d2 = Dialog::from_uac("call-1", "aaa", &invite, &r2).unwrap();

        let id1 = d1.id.clone();
        let id2 = d2.id.clone();
        table.insert(d1);
        table.insert(d2);

        table.collapse_to_confirmed(&id2);
        assert!(table.get(&id1).is_none());
        assert!(table.get(&id2).is_some());
    }
}
