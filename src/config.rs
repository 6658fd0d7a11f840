//! Configuration management for Voice Ferry Core.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocols::rtpengine::RtpEngineInstance;
use crate::services::routing::{DefaultAction, Field, HeaderRewrite, Operator, Predicate, RewriteKind};
use crate::services::session_store::StoreFailurePolicy;
use crate::services::{OverLimitAction, RouteAction, RoutingPolicy, RoutingRule, SessionLimitConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub general: GeneralConfig,
    pub sip: SipConfig,
    pub rtpengine: RtpEngineConfig,
    pub session_store: SessionStoreConfig,
    pub session_limit: SessionLimitConfigToml,
    pub routing: RoutingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub description: String,
    pub max_concurrent_calls: u32,
    pub call_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub listen_host: String,
    pub udp_port: u16,
    pub tcp_port: Option<u16>,
    pub domain: String,
    /// ACL of source identities allowed to have their
    /// `P-Asserted-Identity` forwarded to the B leg; default empty means
    /// strip (spec.md §6 Open Question decision).
    pub forward_p_asserted_identity_from: Vec<String>,
    pub rtpengine_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpEngineConfig {
    pub instances: Vec<RtpEngineInstanceConfig>,
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpEngineInstanceConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    pub redis_url: String,
    pub failure_policy: StoreFailurePolicyToml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreFailurePolicyToml {
    #[serde(rename = "fail_open")]
    FailOpen,
    #[serde(rename = "fail_closed")]
    FailClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimitConfigToml {
    pub enabled: bool,
    pub global_default: u64,
    pub action: OverLimitActionToml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverLimitActionToml {
    #[serde(rename = "reject")]
    Reject,
    #[serde(rename = "terminate_oldest")]
    TerminateOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub rules: Vec<RoutingRuleConfig>,
    pub default_action: DefaultActionConfig,
    pub fallback: Option<RouteActionConfig>,
    pub evaluation_deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRuleConfig {
    pub id: String,
    pub priority: i64,
    pub field: FieldConfig,
    pub operator: OperatorConfig,
    pub action: RouteActionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldConfig {
    #[serde(rename = "request_uri")]
    RequestUri,
    #[serde(rename = "from_uri")]
    FromUri,
    #[serde(rename = "to_uri")]
    ToUri,
    #[serde(rename = "header")]
    Header(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperatorConfig {
    #[serde(rename = "equals")]
    Equals(String),
    #[serde(rename = "prefix")]
    Prefix(String),
    #[serde(rename = "suffix")]
    Suffix(String),
    #[serde(rename = "regex")]
    Regex(String),
    #[serde(rename = "in_cidr")]
    InCidr { network: String, prefix_len: u8 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteActionConfig {
    pub target_host: String,
    pub target_port: u16,
    pub transport: String,
    pub request_uri_rewrite: Option<String>,
    #[serde(default)]
    pub header_rewrites: Vec<HeaderRewriteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRewriteConfig {
    pub kind: RewriteKindConfig,
    pub header: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RewriteKindConfig {
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "remove")]
    Remove,
    #[serde(rename = "replace")]
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DefaultActionConfig {
    #[serde(rename = "reject")]
    Reject { status: u16 },
    #[serde(rename = "fallback")]
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub max_size: u64,
    pub max_files: u32,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl GatewayConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatewayConfig =
            toml::from_str(&contents).map_err(|e| Error::internal(format!("invalid TOML: {e}")))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("VOICE_FERRY").separator("_"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rtpengine.instances.is_empty() {
            return Err(Error::internal("at least one RTPEngine instance must be configured"));
        }
        for rule in &self.routing.rules {
            if let OperatorConfig::Regex(pattern) = &rule.operator {
                regex::Regex::new(pattern)
                    .map_err(|e| Error::internal(format!("invalid regex in rule {}: {e}", rule.id)))?;
            }
        }
        if self.sip.udp_port == 0 {
            return Err(Error::internal("sip.udp_port must be non-zero"));
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig {
                node_id: "voice-ferry-core-1".to_string(),
                description: "Voice Ferry Core SIP B2BUA".to_string(),
                max_concurrent_calls: 1000,
                call_idle_timeout_secs: 1800,
            },
            sip: SipConfig {
                listen_host: "0.0.0.0".to_string(),
                udp_port: 5060,
                tcp_port: Some(5060),
                domain: "voice-ferry.local".to_string(),
                forward_p_asserted_identity_from: vec![],
                rtpengine_flags: vec![],
            },
            rtpengine: RtpEngineConfig {
                instances: vec![RtpEngineInstanceConfig {
                    id: "rtpengine-1".to_string(),
                    host: "127.0.0.1".to_string(),
                    port: 22222,
                    weight: 1,
                    enabled: true,
                }],
                ping_interval_secs: 10,
            },
            session_store: SessionStoreConfig {
                redis_url: "redis://127.0.0.1:6379".to_string(),
                failure_policy: StoreFailurePolicyToml::FailOpen,
            },
            session_limit: SessionLimitConfigToml {
                enabled: true,
                global_default: 0,
                action: OverLimitActionToml::Reject,
            },
            routing: RoutingConfig {
                rules: vec![],
                default_action: DefaultActionConfig::Reject { status: 404 },
                fallback: None,
                evaluation_deadline_ms: 100,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
                max_size: 100 * 1024 * 1024,
                max_files: 10,
                format: LogFormat::Json,
            },
        }
    }
}

impl SipConfig {
    pub fn udp_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_host, self.udp_port)
            .parse()
            .map_err(|_| Error::internal("invalid sip.listen_host/udp_port"))
    }

    pub fn tcp_addr(&self) -> Result<Option<SocketAddr>> {
        match self.tcp_port {
            Some(port) => Ok(Some(
                format!("{}:{}", self.listen_host, port)
                    .parse()
                    .map_err(|_| Error::internal("invalid sip.listen_host/tcp_port"))?,
            )),
            None => Ok(None),
        }
    }
}

impl RtpEngineConfig {
    pub fn to_instances(&self) -> Result<Vec<RtpEngineInstance>> {
        self.instances
            .iter()
            .map(|i| {
                let addr: SocketAddr = format!("{}:{}", i.host, i.port)
                    .parse()
                    .map_err(|_| Error::internal(format!("invalid rtpengine instance address {}:{}", i.host, i.port)))?;
                Ok(RtpEngineInstance { id: i.id.clone(), addr, weight: i.weight, enabled: i.enabled })
            })
            .collect()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl From<StoreFailurePolicyToml> for StoreFailurePolicy {
    fn from(value: StoreFailurePolicyToml) -> Self {
        match value {
            StoreFailurePolicyToml::FailOpen => StoreFailurePolicy::FailOpen,
            StoreFailurePolicyToml::FailClosed => StoreFailurePolicy::FailClosed,
        }
    }
}

impl From<&SessionLimitConfigToml> for SessionLimitConfig {
    fn from(value: &SessionLimitConfigToml) -> Self {
        SessionLimitConfig {
            enabled: value.enabled,
            global_default: value.global_default,
            action: match value.action {
                OverLimitActionToml::Reject => OverLimitAction::Reject,
                OverLimitActionToml::TerminateOldest => OverLimitAction::TerminateOldest,
            },
        }
    }
}

impl RoutingConfig {
    /// Builds the runtime [`RoutingPolicy`] from configuration, compiling
    /// regex predicates eagerly so a bad pattern fails at startup rather
    /// than on the first matching request.
    pub fn build_policy(&self) -> Result<RoutingPolicy> {
        let rules = self.rules.iter().map(build_rule).collect::<Result<Vec<_>>>()?;
        let default_action = match self.default_action {
            DefaultActionConfig::Reject { status } => DefaultAction::Reject { status },
            DefaultActionConfig::Fallback => DefaultAction::Fallback,
        };
        let fallback = self.fallback.as_ref().map(build_action).transpose()?;
        Ok(RoutingPolicy::new(
            rules,
            default_action,
            fallback,
            Duration::from_millis(self.evaluation_deadline_ms),
        ))
    }
}

fn build_rule(rule: &RoutingRuleConfig) -> Result<RoutingRule> {
    let field = match &rule.field {
        FieldConfig::RequestUri => Field::RequestUri,
        FieldConfig::FromUri => Field::FromUri,
        FieldConfig::ToUri => Field::ToUri,
        FieldConfig::Header(name) => Field::Header(name.clone()),
    };
    let operator = match &rule.operator {
        OperatorConfig::Equals(v) => Operator::Equals(v.clone()),
        OperatorConfig::Prefix(v) => Operator::Prefix(v.clone()),
        OperatorConfig::Suffix(v) => Operator::Suffix(v.clone()),
        OperatorConfig::Regex(pattern) => {
            Operator::Regex(regex::Regex::new(pattern).map_err(|e| Error::internal(format!("invalid regex: {e}")))?)
        }
        OperatorConfig::InCidr { network, prefix_len } => Operator::InCidr {
            network: network.parse().map_err(|_| Error::internal(format!("invalid CIDR network {network}")))?,
            prefix_len: *prefix_len,
        },
    };
    Ok(RoutingRule {
        id: rule.id.clone(),
        priority: rule.priority,
        predicate: Predicate { field, operator },
        action: build_action(&rule.action)?,
    })
}

fn build_action(action: &RouteActionConfig) -> Result<RouteAction> {
    Ok(RouteAction {
        target_host: action.target_host.clone(),
        target_port: action.target_port,
        transport: action.transport.clone(),
        request_uri_rewrite: action.request_uri_rewrite.clone(),
        header_rewrites: action.header_rewrites.iter().map(build_rewrite).collect(),
    })
}

fn build_rewrite(rewrite: &HeaderRewriteConfig) -> HeaderRewrite {
    HeaderRewrite {
        kind: match rewrite.kind {
            RewriteKindConfig::Add => RewriteKind::Add,
            RewriteKindConfig::Remove => RewriteKind::Remove,
            RewriteKindConfig::Replace => RewriteKind::Replace,
        },
        header: rewrite.header.clone(),
        value: rewrite.value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = GatewayConfig::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_rtpengine_pool() {
        let mut config = GatewayConfig::default_config();
        config.rtpengine.instances.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_regex_rule() {
        let mut config = GatewayConfig::default_config();
        config.routing.rules.push(RoutingRuleConfig {
            id: "bad".into(),
            priority: 1,
            field: FieldConfig::FromUri,
            operator: OperatorConfig::Regex("(".into()),
            action: RouteActionConfig {
                target_host: "127.0.0.1".into(),
                target_port: 5080,
                transport: "udp".into(),
                request_uri_rewrite: None,
                header_rewrites: vec![],
            },
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn builds_routing_policy_from_config() {
        let mut config = GatewayConfig::default_config();
        config.routing.rules.push(RoutingRuleConfig {
            id: "local".into(),
            priority: 10,
            field: FieldConfig::RequestUri,
            operator: OperatorConfig::Prefix("sip:".into()),
            action: RouteActionConfig {
                target_host: "127.0.0.1".into(),
                target_port: 5080,
                transport: "udp".into(),
                request_uri_rewrite: None,
                header_rewrites: vec![],
            },
        });
        assert!(config.routing.build_policy().is_ok());
    }
}
