//! SIP protocol stack: message model, parser/serializer, transaction
//! layer, dialog layer, and transport (spec.md §4.1–§4.4).
//!
//! This is a from-scratch implementation — the engineering spec.md §1
//! calls out as core, not a wrapper over an external library the way the
//! teacher's original `protocols::sip` module wrapped `redfire-sip-stack`.

pub mod dialog;
pub mod message;
pub mod parser;
pub mod serializer;
pub mod transaction;
pub mod transport;
pub mod uri;

pub use dialog::{Dialog, DialogId, DialogState, DialogTable};
pub use message::{Header, Headers, SipMessage, SipMethod, StartLine};
pub use parser::parse_message;
pub use serializer::serialize_message;
pub use transaction::{TransactionEvent, TransactionFailure, TransactionKey, TransactionTable};
pub use transport::{InboundDatagram, OutboundDatagram, TransportKind};
pub use uri::{SipUri, UriScheme};
