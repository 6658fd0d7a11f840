//! SIP message serialization.
//!
//! Headers are emitted in their stored order; this is what gives the
//! parse-then-serialize round trip (spec.md §8 P5) the same header set
//! counting duplicates and order as the input.

use bytes::{BufMut, Bytes, BytesMut};

use super::message::{SipMessage, StartLine};

pub fn serialize_message(msg: &SipMessage) -> Bytes {
    let mut buf = BytesMut::new();

    match &msg.start_line {
        StartLine::Request { raw_method, uri, version, .. } => {
            buf.put_slice(raw_method.as_bytes());
            buf.put_u8(b' ');
            buf.put_slice(uri.as_bytes());
            buf.put_u8(b' ');
            buf.put_slice(version.as_bytes());
        }
        StartLine::Response { version, status, reason } => {
            buf.put_slice(version.as_bytes());
            buf.put_u8(b' ');
            buf.put_slice(status.to_string().as_bytes());
            buf.put_u8(b' ');
            buf.put_slice(reason.as_bytes());
        }
    }
    buf.put_slice(b"\r\n");

    for header in msg.headers.iter() {
        buf.put_slice(header.name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(header.value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.put_slice(&msg.body);

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_message;
    use super::*;
    use crate::protocols::sip::message::SipMethod;

    #[test]
    fn round_trip_preserves_headers_and_body() {
        let mut msg = SipMessage::new_request(SipMethod::Invite, "sip:bob@example.com");
        msg.headers.push("Via", "SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds");
        msg.headers.push("Via", "SIP/2.0/UDP proxy.example.com;branch=z9hG4bK887");
        msg.headers.push("Max-Forwards", "70");
        msg.headers.push("To", "Bob <sip:bob@example.com>");
        msg.headers.push("From", "Alice <sip:alice@example.com>;tag=1928301774");
        msg.headers.push("Call-ID", "a84b4c76e66710@pc33.example.com");
        msg.headers.push("CSeq", "314159 INVITE");
        msg.body = Bytes::from_static(b"v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n");
        msg.set_content_length();

        let wire = serialize_message(&msg);
        let reparsed = parse_message(&wire).unwrap();

        assert_eq!(reparsed.start_line, msg.start_line);
        assert_eq!(reparsed.headers, msg.headers);
        assert_eq!(reparsed.body, msg.body);
    }

    #[test]
    fn serializes_response_start_line() {
        let msg = SipMessage::new_response(486, "Busy Here");
        let wire = serialize_message(&msg);
        assert!(wire.starts_with(b"SIP/2.0 486 Busy Here\r\n"));
    }
}
