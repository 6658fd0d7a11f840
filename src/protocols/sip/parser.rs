//! SIP message parser (RFC 3261 §7/§25 grammar subset).
//!
//! Parses a complete message (start line + headers + body) out of a byte
//! buffer. Malformed input produces a structured [`crate::Error::Parse`]
//! carrying the byte offset of the failure (spec.md §4.2).

use bytes::Bytes;

use super::message::{Headers, SipMessage, SipMethod, StartLine};
use crate::{Error, Result};

/// Parses one full SIP message out of `input`.
///
/// `input` must contain exactly the message: start line, headers, a
/// blank line, and a body whose length matches `Content-Length` (if
/// present). Trailing bytes beyond the declared body length are not
/// consumed by this parser; callers that frame multiple messages off one
/// stream (the stream transport) must slice `input` to the right length
/// first.
pub fn parse_message(input: &[u8]) -> Result<SipMessage> {
    let (head, body) = split_head_body(input)?;
    let head_str = std::str::from_utf8(head)
        .map_err(|e| Error::parse(format!("non-UTF8 header block: {e}"), 0))?;

    let mut lines = head_str.split("\r\n");
    let start_line_raw = lines
        .next()
        .ok_or_else(|| Error::parse("empty message", 0))?;
    let start_line = parse_start_line(start_line_raw)?;

    let mut headers = Headers::new();
    let mut pending: Option<(String, String)> = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Header folding (obsolete but tolerated on receive, RFC 3261 §7.3.1).
            if let Some((_, value)) = pending.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = pending.take() {
            headers.push(name, value);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::parse(format!("malformed header line: {line}"), 0))?;
        pending = Some((name.trim().to_string(), value.trim().to_string()));
    }
    if let Some((name, value)) = pending {
        headers.push(name, value);
    }

    let msg = SipMessage { start_line, headers, body: Bytes::copy_from_slice(body) };

    if let Some(declared) = msg.content_length() {
        if declared != msg.body.len() {
            return Err(Error::parse(
                format!("Content-Length {declared} does not match body length {}", msg.body.len()),
                head.len(),
            ));
        }
    }

    Ok(msg)
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let mut parts = line.splitn(3, ' ');
    let first = parts.next().unwrap_or_default();
    let second = parts.next().ok_or_else(|| Error::parse("truncated start line", 0))?;
    let third = parts.next().ok_or_else(|| Error::parse("truncated start line", 0))?;

    if first.starts_with("SIP/") {
        let status: u16 = second
            .parse()
            .map_err(|_| Error::parse(format!("invalid status code '{second}'"), 0))?;
        Ok(StartLine::Response { version: first.to_string(), status, reason: third.to_string() })
    } else {
        let (method, raw_method) = SipMethod::parse(first);
        Ok(StartLine::Request {
            method,
            raw_method,
            uri: second.to_string(),
            version: third.to_string(),
        })
    }
}

/// Splits `input` at the first CRLFCRLF (or LFLF, tolerated) boundary.
fn split_head_body(input: &[u8]) -> Result<(&[u8], &[u8])> {
    if let Some(pos) = find_subslice(input, b"\r\n\r\n") {
        return Ok((&input[..pos], &input[pos + 4..]));
    }
    if let Some(pos) = find_subslice(input, b"\n\n") {
        return Ok((&input[..pos], &input[pos + 2..]));
    }
    Err(Error::parse("no header/body separator found", input.len()))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// For a server receiving a malformed request, spec.md §4.2 mandates a
/// 400 Bad Request; malformed responses are silently discarded. This
/// helper classifies a raw datagram as best it can before full parsing,
/// used by the transport layer to decide which path to take.
pub fn looks_like_response(input: &[u8]) -> bool {
    input.starts_with(b"SIP/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_invite() {
        let raw = b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@example.com>\r\n\
From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.example.com\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.example.com>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 4\r\n\
\r\n\
v=0\n";
        let msg = parse_message(raw).unwrap();
        assert_eq!(msg.method(), Some(SipMethod::Invite));
        assert_eq!(msg.request_uri(), Some("sip:bob@example.com"));
        assert_eq!(msg.call_id(), Some("a84b4c76e66710@pc33.example.com"));
        assert_eq!(&msg.body[..], b"v=0\n");
    }

    #[test]
    fn parses_response() {
        let raw = b"SIP/2.0 200 OK\r\nCall-ID: abc\r\nContent-Length: 0\r\n\r\n";
        let msg = parse_message(raw).unwrap();
        assert_eq!(msg.status(), Some(200));
    }

    #[test]
    fn rejects_content_length_mismatch() {
        let raw = b"SIP/2.0 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        assert!(parse_message(raw).is_err());
    }

    #[test]
    fn rejects_truncated_start_line() {
        let raw = b"INVITE\r\n\r\n";
        assert!(parse_message(raw).is_err());
    }

    #[test]
    fn tolerates_folded_headers() {
        let raw = b"SIP/2.0 200 OK\r\nSubject: A long\r\n subject line\r\nContent-Length: 0\r\n\r\n";
        let msg = parse_message(raw).unwrap();
        assert_eq!(msg.headers.get("Subject"), Some("A long subject line"));
    }

    #[test]
    fn classifies_response_vs_request_bytes() {
        assert!(looks_like_response(b"SIP/2.0 200 OK\r\n"));
        assert!(!looks_like_response(b"INVITE sip:x SIP/2.0\r\n"));
    }
}
