//! 配置构建器
//!
//! 逐步累积入站、出站、路由、DNS 等片段，最后由 [`ConfigBuilder::build`]
//! 统一校验并产出 [`ProxyConfiguration`]。链式方法只修改内部状态，不会失败。

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::share_link::{Protocol, ServerDescriptor};
use super::types::{
    DnsConfig, InboundConfig, LevelPolicy, LogConfig, LogLevel, OutboundConfig, PolicyConfig,
    ProxyConfiguration, RoutingConfig, RoutingRule, StatsConfig,
};
use crate::common::error::Result;

/// 出站目标（封闭集合）
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundTarget {
    /// 远端代理服务器，按协议生成 vnext / servers 设置
    Server(ServerDescriptor),
    /// 直连
    Freedom,
    /// 丢弃
    Blackhole,
}

/// 入站附加选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundOptions {
    /// 缺省为 `<protocol>-in`
    pub tag: Option<String>,
    /// SOCKS 是否启用用户名密码认证
    pub auth: bool,
    /// SOCKS 是否转发 UDP
    pub udp: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    log_level: LogLevel,
    inbounds: Vec<InboundConfig>,
    outbounds: Vec<OutboundConfig>,
    routing: Option<RoutingConfig>,
    dns: Option<DnsConfig>,
    policy: Option<PolicyConfig>,
    stats: Option<StatsConfig>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log_level(&mut self, level: LogLevel) -> &mut Self {
        self.log_level = level;
        self
    }

    pub fn add_inbound(
        &mut self,
        protocol: &str,
        port: u16,
        listen: &str,
        options: InboundOptions,
    ) -> &mut Self {
        let settings = match protocol {
            "socks" => Some(json!({
                "auth": if options.auth { "password" } else { "noauth" },
                "udp": options.udp,
            })),
            "http" => Some(json!({ "timeout": 300 })),
            _ => None,
        };
        self.inbounds.push(InboundConfig {
            tag: Some(options.tag.unwrap_or_else(|| format!("{protocol}-in"))),
            protocol: protocol.to_string(),
            port: Value::from(port),
            listen: Some(listen.to_string()),
            settings,
            extra: Map::new(),
        });
        self
    }

    pub fn add_socks_inbound(&mut self, port: u16, listen: &str, auth: bool, udp: bool) -> &mut Self {
        self.add_inbound(
            "socks",
            port,
            listen,
            InboundOptions {
                tag: None,
                auth,
                udp,
            },
        )
    }

    pub fn add_http_inbound(&mut self, port: u16, listen: &str) -> &mut Self {
        self.add_inbound("http", port, listen, InboundOptions::default())
    }

    pub fn add_outbound(&mut self, tag: &str, target: OutboundTarget) -> &mut Self {
        let outbound = match target {
            OutboundTarget::Server(d) => OutboundConfig {
                tag: Some(tag.to_string()),
                protocol: d.protocol.as_str().to_string(),
                settings: Some(server_settings(&d)),
                stream_settings: stream_settings(&d),
                extra: Map::new(),
            },
            OutboundTarget::Freedom => OutboundConfig {
                tag: Some(tag.to_string()),
                protocol: "freedom".to_string(),
                settings: Some(json!({ "domainStrategy": "UseIP" })),
                stream_settings: None,
                extra: Map::new(),
            },
            OutboundTarget::Blackhole => OutboundConfig {
                tag: Some(tag.to_string()),
                protocol: "blackhole".to_string(),
                settings: None,
                stream_settings: None,
                extra: Map::new(),
            },
        };
        self.outbounds.push(outbound);
        self
    }

    /// 以 `proxy` 为 tag 添加远端服务器出站
    pub fn add_proxy_outbound(&mut self, descriptor: &ServerDescriptor) -> &mut Self {
        self.add_outbound("proxy", OutboundTarget::Server(descriptor.clone()))
    }

    pub fn add_vmess_outbound(
        &mut self,
        address: &str,
        port: u16,
        uuid: &str,
        alter_id: u16,
        security: &str,
    ) -> &mut Self {
        let mut d = ServerDescriptor::new(Protocol::Vmess, address, port).with_id(uuid);
        d.alter_id = Some(alter_id);
        d.security = Some(security.to_string()).filter(|s| !s.is_empty());
        self.add_proxy_outbound(&d)
    }

    pub fn add_vless_outbound(
        &mut self,
        address: &str,
        port: u16,
        uuid: &str,
        flow: &str,
        encryption: &str,
    ) -> &mut Self {
        let mut d = ServerDescriptor::new(Protocol::Vless, address, port).with_id(uuid);
        d.flow = Some(flow.to_string()).filter(|s| !s.is_empty());
        d.encryption = Some(encryption.to_string()).filter(|s| !s.is_empty());
        self.add_proxy_outbound(&d)
    }

    pub fn add_trojan_outbound(&mut self, address: &str, port: u16, password: &str) -> &mut Self {
        let d = ServerDescriptor::new(Protocol::Trojan, address, port).with_password(password);
        self.add_proxy_outbound(&d)
    }

    pub fn add_shadowsocks_outbound(
        &mut self,
        address: &str,
        port: u16,
        password: &str,
        method: &str,
    ) -> &mut Self {
        let d = ServerDescriptor::new(Protocol::Shadowsocks, address, port)
            .with_password(password)
            .with_method(method);
        self.add_proxy_outbound(&d)
    }

    pub fn add_freedom_outbound(&mut self, tag: &str) -> &mut Self {
        self.add_outbound(tag, OutboundTarget::Freedom)
    }

    pub fn add_blackhole_outbound(&mut self, tag: &str) -> &mut Self {
        self.add_outbound(tag, OutboundTarget::Blackhole)
    }

    /// 整体替换路由
    pub fn set_routing(&mut self, rules: Vec<RoutingRule>, domain_strategy: &str) -> &mut Self {
        self.routing = Some(RoutingConfig {
            domain_strategy: domain_strategy.to_string(),
            rules,
            extra: Map::new(),
        });
        self
    }

    /// 追加一条路由规则；首次调用时以 `AsIs` 策略创建路由块
    pub fn add_routing_rule(
        &mut self,
        rule_type: &str,
        outbound_tag: &str,
        domains: Vec<String>,
        ips: Vec<String>,
    ) -> &mut Self {
        let routing = self.routing.get_or_insert_with(RoutingConfig::default);
        routing.rules.push(RoutingRule {
            rule_type: rule_type.to_string(),
            outbound_tag: Some(outbound_tag.to_string()),
            balancer_tag: None,
            domain: Some(domains).filter(|d| !d.is_empty()),
            ip: Some(ips).filter(|i| !i.is_empty()),
            extra: Map::new(),
        });
        self
    }

    pub fn set_dns(&mut self, servers: Vec<String>, hosts: BTreeMap<String, String>) -> &mut Self {
        self.dns = Some(DnsConfig {
            servers: servers.into_iter().map(Value::from).collect(),
            hosts: hosts.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            extra: Map::new(),
        });
        self
    }

    pub fn enable_stats(&mut self) -> &mut Self {
        self.stats = Some(StatsConfig::default());
        self
    }

    /// 设置等级 0 的超时（秒）
    pub fn enable_policy(
        &mut self,
        handshake: u32,
        conn_idle: u32,
        uplink_only: u32,
        downlink_only: u32,
    ) -> &mut Self {
        let mut levels = BTreeMap::new();
        levels.insert(
            "0".to_string(),
            LevelPolicy {
                handshake: Some(handshake),
                conn_idle: Some(conn_idle),
                uplink_only: Some(uplink_only),
                downlink_only: Some(downlink_only),
                extra: Map::new(),
            },
        );
        self.policy = Some(PolicyConfig {
            levels,
            extra: Map::new(),
        });
        self
    }

    pub fn build(&self) -> Result<ProxyConfiguration> {
        let config = ProxyConfiguration {
            log: LogConfig {
                loglevel: self.log_level,
                extra: Map::new(),
            },
            inbounds: self.inbounds.clone(),
            outbounds: self.outbounds.clone(),
            routing: self.routing.clone(),
            dns: self.dns.clone(),
            policy: self.policy.clone(),
            stats: self.stats.clone(),
            extra: Map::new(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn build_json(&self) -> Result<String> {
        self.build()?.to_json_pretty()
    }
}

/// 按协议生成出站 settings
fn server_settings(d: &ServerDescriptor) -> Value {
    let id = d.id.as_deref().unwrap_or_default();
    match d.protocol {
        Protocol::Vmess => json!({
            "vnext": [{
                "address": d.address,
                "port": d.port,
                "users": [{
                    "id": id,
                    "alterId": d.alter_id.unwrap_or(0),
                    "security": d.security.as_deref().unwrap_or("auto"),
                }],
            }],
        }),
        Protocol::Vless => {
            let mut user = Map::new();
            user.insert("id".into(), json!(id));
            user.insert(
                "encryption".into(),
                json!(d.encryption.as_deref().unwrap_or("none")),
            );
            if let Some(flow) = &d.flow {
                user.insert("flow".into(), json!(flow));
            }
            json!({
                "vnext": [{
                    "address": d.address,
                    "port": d.port,
                    "users": [Value::Object(user)],
                }],
            })
        }
        Protocol::Trojan => json!({
            "servers": [{
                "address": d.address,
                "port": d.port,
                "password": d.password.as_deref().unwrap_or_default(),
            }],
        }),
        Protocol::Shadowsocks => json!({
            "servers": [{
                "address": d.address,
                "port": d.port,
                "password": d.password.as_deref().unwrap_or_default(),
                "method": d.method.as_deref().unwrap_or_default(),
            }],
        }),
    }
}

/// 传输层 / TLS 设置；描述里没有相关字段时返回 `None`
fn stream_settings(d: &ServerDescriptor) -> Option<Value> {
    let has_transport = d.network.is_some()
        || d.tls.is_some()
        || d.sni.is_some()
        || d.host.is_some()
        || d.path.is_some()
        || d.header_type.is_some();
    if !has_transport {
        return None;
    }

    let network = d.network.as_deref().unwrap_or("tcp");
    let mut stream = Map::new();
    stream.insert("network".into(), json!(network));

    match d.tls.as_deref() {
        Some("reality") => {
            stream.insert("security".into(), json!("reality"));
            stream.insert(
                "realitySettings".into(),
                json!({
                    "serverName": d.sni.as_deref().unwrap_or_default(),
                    "fingerprint": d.fingerprint.as_deref().unwrap_or("chrome"),
                    "publicKey": d.public_key.as_deref().unwrap_or_default(),
                    "shortId": d.short_id.as_deref().unwrap_or_default(),
                    "spiderX": d.spider_x.as_deref().unwrap_or_default(),
                }),
            );
        }
        Some(mode) if mode != "none" => {
            stream.insert("security".into(), json!(mode));
            let mut tls = Map::new();
            if let Some(sni) = d.sni.as_deref().or(d.host.as_deref()) {
                tls.insert("serverName".into(), json!(sni));
            }
            if let Some(alpn) = &d.alpn {
                let list: Vec<&str> = alpn.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
                tls.insert("alpn".into(), json!(list));
            }
            if let Some(fp) = &d.fingerprint {
                tls.insert("fingerprint".into(), json!(fp));
            }
            stream.insert(format!("{mode}Settings"), Value::Object(tls));
        }
        _ => {}
    }

    match network {
        "ws" => {
            let mut ws = Map::new();
            ws.insert("path".into(), json!(d.path.as_deref().unwrap_or("/")));
            if let Some(host) = &d.host {
                ws.insert("headers".into(), json!({ "Host": host }));
            }
            stream.insert("wsSettings".into(), Value::Object(ws));
        }
        "grpc" => {
            stream.insert(
                "grpcSettings".into(),
                json!({ "serviceName": d.path.as_deref().unwrap_or_default() }),
            );
        }
        "h2" | "http" => {
            let mut http = Map::new();
            if let Some(host) = &d.host {
                http.insert("host".into(), json!([host]));
            }
            if let Some(path) = &d.path {
                http.insert("path".into(), json!(path));
            }
            stream.insert("httpSettings".into(), Value::Object(http));
        }
        "tcp" if d.header_type.as_deref() == Some("http") => {
            stream.insert(
                "tcpSettings".into(),
                json!({
                    "header": {
                        "type": "http",
                        "request": {
                            "path": [d.path.as_deref().unwrap_or("/")],
                            "headers": { "Host": [d.host.as_deref().unwrap_or_default()] },
                        },
                    },
                }),
            );
        }
        _ => {}
    }

    Some(Value::Object(stream))
}
