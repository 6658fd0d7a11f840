//! Routing rule engine (spec.md §4.9), replacing the teacher's
//! `services/sip_router.rs` stub (explicitly a TODO awaiting "external
//! library integration" there) with a real first-match-by-priority rule
//! evaluator, hot-swappable via `arc-swap` per spec.md §9
//! "Configuration reload".

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use regex::Regex;
use tokio::time::timeout;

use crate::protocols::sip::SipMessage;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    RequestUri,
    FromUri,
    ToUri,
    Header(String),
}

#[derive(Debug, Clone)]
pub enum Operator {
    Equals(String),
    Prefix(String),
    Suffix(String),
    Regex(Regex),
    InCidr { network: IpAddr, prefix_len: u8 },
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub field: Field,
    pub operator: Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteKind {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Clone)]
pub struct HeaderRewrite {
    pub kind: RewriteKind,
    pub header: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RouteAction {
    pub target_host: String,
    pub target_port: u16,
    pub transport: String,
    pub request_uri_rewrite: Option<String>,
    pub header_rewrites: Vec<HeaderRewrite>,
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub id: String,
    pub priority: i64,
    pub predicate: Predicate,
    pub action: RouteAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Reject { status: u16 },
    Fallback,
}

pub struct RoutingPolicy {
    /// Copy-on-write snapshot, atomically swapped on reload (spec.md §9).
    rules: ArcSwap<Vec<RoutingRule>>,
    default_action: DefaultAction,
    fallback: Option<RouteAction>,
    evaluation_deadline: Duration,
}

impl RoutingPolicy {
    pub fn new(
        rules: Vec<RoutingRule>,
        default_action: DefaultAction,
        fallback: Option<RouteAction>,
        evaluation_deadline: Duration,
    ) -> Self {
        let mut sorted = rules;
        sorted.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Self { rules: ArcSwap::from_pointee(sorted), default_action, fallback, evaluation_deadline }
    }

    /// Atomically replaces the rule table; in-flight evaluations that
    /// already loaded the old snapshot complete against it (spec.md §9).
    pub fn reload(&self, mut rules: Vec<RoutingRule>) {
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        self.rules.store(Arc::new(rules));
    }

    /// Evaluates the ruleset against `request`, enforcing the configured
    /// deadline (spec.md §4.9: "must complete within a configured
    /// deadline... or be treated as no-match").
    pub async fn route(&self, request: &SipMessage) -> Result<RouteAction> {
        let rules = self.rules.load_full();
        let request = request.clone();
        let evaluation = async move { evaluate(&rules, &request) };

        let matched = match timeout(self.evaluation_deadline, evaluation).await {
            Ok(found) => found,
            Err(_) => None,
        };

        match matched {
            Some(action) => Ok(action),
            None => match (&self.default_action, &self.fallback) {
                (DefaultAction::Fallback, Some(action)) => Ok(action.clone()),
                _ => Err(Error::RoutingNoMatch),
            },
        }
    }

    pub fn default_status(&self) -> u16 {
        match self.default_action {
            DefaultAction::Reject { status } => status,
            DefaultAction::Fallback => 404,
        }
    }
}

fn evaluate(rules: &[RoutingRule], request: &SipMessage) -> Option<RouteAction> {
    rules.iter().find(|rule| matches(rule, request)).map(|rule| rule.action.clone())
}

fn matches(rule: &RoutingRule, request: &SipMessage) -> bool {
    let value = match &rule.predicate.field {
        Field::RequestUri => request.request_uri().map(str::to_string),
        Field::FromUri => request.headers.get("From").map(str::to_string),
        Field::ToUri => request.headers.get("To").map(str::to_string),
        Field::Header(name) => request.headers.get(name).map(str::to_string),
    };
    let Some(value) = value else { return false };

    match &rule.predicate.operator {
        Operator::Equals(expected) => value == *expected,
        Operator::Prefix(expected) => value.starts_with(expected.as_str()),
        Operator::Suffix(expected) => value.ends_with(expected.as_str()),
        Operator::Regex(re) => re.is_match(&value),
        Operator::InCidr { network, prefix_len } => {
            value.parse::<IpAddr>().map(|ip| ip_in_cidr(ip, *network, *prefix_len)).unwrap_or(false)
        }
    }
}

/// Bit-mask CIDR containment over `std::net::IpAddr`; no dedicated crate
/// exists in the teacher's stack for this (spec.md §11.3), and the check
/// is a handful of comparisons, so it is implemented directly.
fn ip_in_cidr(ip: IpAddr, network: IpAddr, prefix_len: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = if prefix_len == 0 { 0u32 } else { u32::MAX << (32 - prefix_len.min(32)) };
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = if prefix_len == 0 { 0u128 } else { u128::MAX << (128 - prefix_len.min(128)) };
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}
