//! Protocol implementations for Voice Ferry Core: the SIP stack and the
//! RTPEngine NG client.

pub mod rtpengine;
pub mod sip;
