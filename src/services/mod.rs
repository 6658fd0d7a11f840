//! Supporting services the B2BUA core depends on: session storage,
//! admission control, and routing (spec.md §4.7–§4.9).

pub mod routing;
pub mod session_limit;
pub mod session_store;

pub use routing::{DefaultAction, HeaderRewrite, RouteAction, RoutingPolicy, RoutingRule};
pub use session_limit::{AdmissionDecision, OverLimitAction, SessionLimitConfig, SessionLimitPolicy};
pub use session_store::{RedisSessionStore, SessionRecord, SessionStore, StoreFailurePolicy};
