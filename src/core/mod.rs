//! Core call-control: the B2BUA actor model and the top-level gateway
//! orchestrator that wires the SIP stack, RTPEngine client, and services
//! together (spec.md §4.5, §6).

pub mod b2bua;
pub mod gateway;

pub use b2bua::{
    leg_key, B2buaPolicy, CallContext, CallEvent, CallHandle, CallId, CallManager, CallState, LegSide,
    DEFAULT_IDLE_TIMEOUT,
};
pub use gateway::{Gateway, GatewayEvent, GatewayStatus};
