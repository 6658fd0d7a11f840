//! SIP message model: start line, ordered headers, opaque body.
//!
//! Header lookup is name-case-insensitive and compact forms are expanded
//! on read (spec.md §4.2): `m`=Contact, `f`=From, `t`=To, `i`=Call-ID,
//! `v`=Via, `l`=Content-Length, `c`=Content-Type, `s`=Subject. Source
//! order and duplicate headers are preserved for round-trip fidelity
//! (spec.md §8 P5).

use bytes::Bytes;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Other,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
            SipMethod::Register => "REGISTER",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Other => "",
        }
    }

    pub fn parse(s: &str) -> (Self, String) {
        let method = match s.to_ascii_uppercase().as_str() {
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "OPTIONS" => SipMethod::Options,
            "REGISTER" => SipMethod::Register,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            _ => SipMethod::Other,
        };
        (method, s.to_string())
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Expands a compact header form to its long name. Unknown names pass
/// through unchanged (already long-form, or an extension header).
pub fn expand_header_name(name: &str) -> &str {
    match name {
        "m" | "M" => "Contact",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "v" | "V" => "Via",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "s" | "S" => "Subject",
        "k" | "K" => "Supported",
        "e" | "E" => "Content-Encoding",
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// Canonical (expanded) name used for case-insensitive comparisons.
    pub fn canonical_name(&self) -> String {
        expand_header_name(&self.name).to_ascii_lowercase()
    }
}

/// An ordered, duplicate-preserving header list with case-insensitive
/// lookup by canonical (expanded) name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(pub Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.0.push(Header::new(name, value));
    }

    /// First header value matching `name` (case-insensitive, compact or
    /// long form).
    pub fn get(&self, name: &str) -> Option<&str> {
        let canon = expand_header_name(name).to_ascii_lowercase();
        self.0
            .iter()
            .find(|h| h.canonical_name() == canon)
            .map(|h| h.value.as_str())
    }

    /// All header values matching `name`, in source order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let canon = expand_header_name(name).to_ascii_lowercase();
        self.0
            .iter()
            .filter(|h| h.canonical_name() == canon)
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn remove(&mut self, name: &str) {
        let canon = expand_header_name(name).to_ascii_lowercase();
        self.0.retain(|h| h.canonical_name() != canon);
    }

    /// Replaces all headers named `name` with a single occurrence.
    pub fn set<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        let name = name.into();
        self.remove(&name);
        self.push(name, value);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: SipMethod, raw_method: String, uri: String, version: String },
    Response { version: String, status: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipMessage {
    pub fn new_request(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Request {
                raw_method: method.as_str().to_string(),
                method,
                uri: uri.into(),
                version: "SIP/2.0".to_string(),
            },
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn new_response(status: u16, reason: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Response {
                version: "SIP/2.0".to_string(),
                status,
                reason: reason.into(),
            },
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<SipMethod> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(*method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.status(), Some(code) if (100..200).contains(&code))
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status(), Some(code) if (200..300).contains(&code))
    }

    pub fn is_final(&self) -> bool {
        matches!(self.status(), Some(code) if code >= 200)
    }

    /// Top `Via` header's `branch` parameter, the key used for transaction
    /// matching per RFC 3261 §17.1.3/§17.2.3.
    pub fn top_via_branch(&self) -> Option<String> {
        let via = self.headers.get("Via")?;
        parse_via_param(via, "branch")
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// `(sequence, method)` pair from the `CSeq` header.
    pub fn cseq(&self) -> Option<(u32, String)> {
        let raw = self.headers.get("CSeq")?;
        let mut parts = raw.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((seq, method))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.headers.get("From").and_then(|v| parse_uri_param(v, "tag"))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.headers.get("To").and_then(|v| parse_uri_param(v, "tag"))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("Content-Length")?.trim().parse().ok()
    }

    pub fn set_content_length(&mut self) {
        self.headers.set("Content-Length", self.body.len().to_string());
    }
}

/// Extracts a `;name=value` parameter from a header value such as a `To`,
/// `From`, or `Contact` line (`"Alice" <sip:alice@a.com>;tag=abc`).
pub fn parse_uri_param(header_value: &str, name: &str) -> Option<String> {
    for segment in header_value.split(';').skip(1) {
        let segment = segment.trim();
        if let Some((k, v)) = segment.split_once('=') {
            if k.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

/// Extracts a `Via` header parameter (`SIP/2.0/UDP host:port;branch=z9...`).
pub fn parse_via_param(via_value: &str, name: &str) -> Option<String> {
    parse_uri_param(via_value, name)
}
