use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::error::{BridgeError, Result};

/// 未建模的字段，原样保留并随文档一起交给引擎
pub type Extra = Map<String, Value>;

/// 代理配置文档（xray JSON 结构）
///
/// 只对构建器和校验用到的字段建模；其余键（`api`、`fakedns`、`sniffing`、
/// `mux`、规则里的 `port` / `inboundTag` 等）收进各层的 `extra`，序列化时原样写回。
/// 可选块缺省时不序列化，避免向引擎下发空对象。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfiguration {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsConfig>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl ProxyConfiguration {
    /// 可构建性检查：至少一个入站、一个出站。
    ///
    /// 路由规则引用的 outbound tag 不在这里校验，由引擎加载时报告。
    pub fn validate(&self) -> Result<()> {
        if self.inbounds.is_empty() {
            return Err(BridgeError::MissingInbound);
        }
        if self.outbounds.is_empty() {
            return Err(BridgeError::MissingOutbound);
        }
        Ok(())
    }

    pub fn outbound(&self, tag: &str) -> Option<&OutboundConfig> {
        self.outbounds.iter().find(|o| o.tag.as_deref() == Some(tag))
    }

    pub fn stats_enabled(&self) -> bool {
        self.stats.is_some()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warning,
    Error,
    None,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::None => "none",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "none" | "off" => Ok(LogLevel::None),
            other => Err(BridgeError::InvalidConfig(format!("unknown log level '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub loglevel: LogLevel,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub protocol: String,
    /// 端口号，或 `"1000-2000"` 这类范围字符串
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub port: Value,
    /// 缺省由引擎决定监听地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(
        rename = "streamSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(rename = "domainStrategy", default = "default_domain_strategy")]
    pub domain_strategy: String,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            domain_strategy: default_domain_strategy(),
            rules: Vec::new(),
            extra: Extra::new(),
        }
    }
}

fn default_domain_strategy() -> String {
    "AsIs".to_string()
}

/// 路由规则；目标为 `outboundTag` 或 `balancerTag` 之一，其余匹配条件在 `extra` 里
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "type", default = "default_rule_type")]
    pub rule_type: String,
    #[serde(rename = "outboundTag", default, skip_serializing_if = "Option::is_none")]
    pub outbound_tag: Option<String>,
    #[serde(rename = "balancerTag", default, skip_serializing_if = "Option::is_none")]
    pub balancer_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Extra,
}

fn default_rule_type() -> String {
    "field".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// 地址字符串或 `{address, port, domains, …}` 对象
    #[serde(default)]
    pub servers: Vec<Value>,
    /// 值可以是单个地址或地址数组
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// 按用户等级配置的超时（秒）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<u32>,
    #[serde(rename = "connIdle", default, skip_serializing_if = "Option::is_none")]
    pub conn_idle: Option<u32>,
    #[serde(rename = "uplinkOnly", default, skip_serializing_if = "Option::is_none")]
    pub uplink_only: Option<u32>,
    #[serde(rename = "downlinkOnly", default, skip_serializing_if = "Option::is_none")]
    pub downlink_only: Option<u32>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub levels: BTreeMap<String, LevelPolicy>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// 存在即启用统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(flatten)]
    pub extra: Extra,
}
