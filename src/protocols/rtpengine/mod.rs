//! RTPEngine NG protocol client (spec.md §4.6, §9).

pub mod bencode;
pub mod client;

pub use bencode::{decode, decode_strict, encode, BValue, BencodeError};
pub use client::{MediaSessionKey, RtpEngineClient, RtpEngineInstance, RtpEngineReply};
