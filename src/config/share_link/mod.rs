//! 分享链接编解码
//!
//! 四种分享链接格式（`vmess://`、`vless://`、`trojan://`、`ss://`）与统一的
//! [`ServerDescriptor`] 之间的双向转换。每种格式是“scheme + 手写语法”，
//! 不经过通用 URI 解析器：真实链接里常有裸 UUID、未转义字符等，严格的
//! URI 解析会把它们拒掉。

mod shadowsocks;
mod trojan;
mod vless;
mod vmess;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::common::error::{BridgeError, Result};

/// 分享链接支持的协议（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    #[serde(alias = "ss")]
    Shadowsocks,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess://",
            Protocol::Vless => "vless://",
            Protocol::Trojan => "trojan://",
            Protocol::Shadowsocks => "ss://",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            "trojan" => Ok(Protocol::Trojan),
            "shadowsocks" | "ss" => Ok(Protocol::Shadowsocks),
            other => Err(BridgeError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// 统一的远端服务器描述
///
/// 未使用的字段一律为 `None`，不会用空串或 0 之类的哨兵值占位。
/// 构造后不可变：`with_*` 消费自身并返回新值。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    /// VMess / VLESS 用户 UUID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "alterId", default, skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u16>,
    /// VMess 加密方式（scy）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    /// VLESS encryption（通常为 none）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    /// Trojan / Shadowsocks 密码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Shadowsocks 加密方法
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// 传输层：tcp / ws / grpc / h2 / http
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// 传输层伪装头类型
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub header_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// tls / xtls / reality
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpn: Option<String>,
    #[serde(rename = "fp", default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Reality 公钥
    #[serde(rename = "pbk", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(rename = "sid", default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(rename = "spx", default, skip_serializing_if = "Option::is_none")]
    pub spider_x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

impl ServerDescriptor {
    pub fn new(protocol: Protocol, address: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            address: address.into(),
            port,
            id: None,
            alter_id: None,
            security: None,
            encryption: None,
            flow: None,
            password: None,
            method: None,
            network: None,
            header_type: None,
            host: None,
            path: None,
            tls: None,
            sni: None,
            alpn: None,
            fingerprint: None,
            public_key: None,
            short_id: None,
            spider_x: None,
            remark: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = non_empty(id.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = non_empty(password.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = non_empty(method.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = non_empty(network.into());
        self
    }

    pub fn with_tls(mut self, tls: impl Into<String>) -> Self {
        self.tls = non_empty(tls.into());
        self
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = non_empty(sni.into());
        self
    }

    pub fn with_ws(mut self, host: impl Into<String>, path: impl Into<String>) -> Self {
        self.network = Some("ws".to_string());
        self.host = non_empty(host.into());
        self.path = non_empty(path.into());
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = non_empty(remark.into());
        self
    }

    /// 从 JSON 文本解析描述；未知协议返回 `UnsupportedProtocol`
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if let Some(name) = value.get("protocol").and_then(|v| v.as_str()) {
            name.parse::<Protocol>()?;
        }
        let descriptor: ServerDescriptor = serde_json::from_value(value)?;
        Ok(descriptor.normalized())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 空串字段视为缺省
    fn normalized(mut self) -> Self {
        for field in [
            &mut self.id,
            &mut self.security,
            &mut self.encryption,
            &mut self.flow,
            &mut self.password,
            &mut self.method,
            &mut self.network,
            &mut self.header_type,
            &mut self.host,
            &mut self.path,
            &mut self.tls,
            &mut self.sni,
            &mut self.alpn,
            &mut self.fingerprint,
            &mut self.public_key,
            &mut self.short_id,
            &mut self.spider_x,
            &mut self.remark,
        ] {
            if field.as_deref() == Some("") {
                *field = None;
            }
        }
        self
    }

    /// 用作出站 tag 的可读名称
    pub fn display_name(&self) -> String {
        match &self.remark {
            Some(r) => r.clone(),
            None => format!("{}-{}:{}", self.protocol, self.address, self.port),
        }
    }
}

/// Parse any supported share link. The scheme prefix is matched exactly;
/// surrounding whitespace is not trimmed.
pub fn parse_share_link(text: &str) -> Result<ServerDescriptor> {
    let parsed = if let Some(rest) = text.strip_prefix(Protocol::Vmess.scheme()) {
        vmess::parse(rest)
    } else if let Some(rest) = text.strip_prefix(Protocol::Vless.scheme()) {
        vless::parse(rest)
    } else if let Some(rest) = text.strip_prefix(Protocol::Trojan.scheme()) {
        trojan::parse(rest)
    } else if let Some(rest) = text.strip_prefix(Protocol::Shadowsocks.scheme()) {
        shadowsocks::parse(rest)
    } else {
        return Err(BridgeError::UnsupportedScheme);
    };
    parsed.map(ServerDescriptor::normalized)
}

pub fn generate_share_link(descriptor: &ServerDescriptor) -> Result<String> {
    match descriptor.protocol {
        Protocol::Vmess => vmess::generate(descriptor),
        Protocol::Vless => Ok(vless::generate(descriptor)),
        Protocol::Trojan => Ok(trojan::generate(descriptor)),
        Protocol::Shadowsocks => Ok(shadowsocks::generate(descriptor)),
    }
}

/// 描述以 JSON 文本形式跨边界传递时的生成入口
pub fn generate_share_link_json(descriptor_json: &str) -> Result<String> {
    let descriptor = ServerDescriptor::from_json(descriptor_json)?;
    generate_share_link(&descriptor)
}

// ─── shared grammar helpers ───

pub(crate) fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// 拆出 `#remark`，备注按 query 规则解码（`+` 视为空格）
fn split_fragment(s: &str) -> (&str, Option<String>) {
    match s.find('#') {
        Some(idx) => (&s[..idx], non_empty(decode_component(&s[idx + 1..]))),
        None => (s, None),
    }
}

fn decode_component(s: &str) -> String {
    let plus_as_space = s.replace('+', " ");
    percent_decode_str(&plus_as_space)
        .decode_utf8_lossy()
        .into_owned()
}

/// userinfo 里需要转义的字符；`+` 保持字面含义
const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'+')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// userinfo 只做百分号解码，`+` 不当作空格
fn decode_userinfo(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn encode_userinfo(s: &str) -> String {
    utf8_percent_encode(s, USERINFO).to_string()
}

fn encode_component(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn append_remark(link: &mut String, remark: Option<&str>) {
    if let Some(r) = remark {
        link.push('#');
        link.push_str(&encode_component(r));
    }
}

/// 解析端口：非数字为地址错误，超出 16 位为越界
fn parse_port(s: &str) -> Result<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BridgeError::MalformedAddress(format!("invalid port '{s}'")));
    }
    s.parse::<u16>()
        .map_err(|_| BridgeError::PortOutOfRange(s.to_string()))
}

/// `host:port`，支持 `[v6]:port`
fn split_host_port(s: &str) -> Result<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| BridgeError::MalformedAddress(format!("unterminated IPv6 literal in '{s}'")))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| BridgeError::MalformedAddress(format!("missing port in '{s}'")))?;
        return Ok((host.to_string(), parse_port(port)?));
    }
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| BridgeError::MalformedAddress(format!("missing port in '{s}'")))?;
    if host.is_empty() {
        return Err(BridgeError::MalformedAddress(format!("missing host in '{s}'")));
    }
    Ok((host.to_string(), parse_port(port)?))
}

fn format_host_port(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

/// `userinfo@host:port`，以最后一个 `@` 为界
fn split_userinfo(s: &str) -> Result<(&str, &str)> {
    s.rsplit_once('@')
        .ok_or_else(|| BridgeError::MalformedAddress(format!("missing '@' in '{s}'")))
}

/// 解析 query；同名键取第一次出现的值，空值视为缺省
struct Query(HashMap<String, String>);

impl Query {
    fn parse(s: &str) -> Self {
        let mut map = HashMap::new();
        for (k, v) in form_urlencoded::parse(s.as_bytes()) {
            map.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
        Query(map)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned().and_then(non_empty)
    }
}

/// 按固定顺序写 query，缺省字段不输出
struct QueryWriter(form_urlencoded::Serializer<'static, String>);

impl QueryWriter {
    fn new() -> Self {
        QueryWriter(form_urlencoded::Serializer::new(String::new()))
    }

    fn pair(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            self.0.append_pair(key, v);
        }
        self
    }

    fn finish(mut self) -> String {
        self.0.finish()
    }
}

/// VLESS / Trojan 共用的 TLS 与传输层 query 字段
fn apply_transport_query(d: &mut ServerDescriptor, q: &Query) {
    d.tls = q.get("security");
    d.sni = q.get("sni");
    d.alpn = q.get("alpn");
    d.network = q.get("type");
    d.header_type = q.get("headerType");
    d.host = q.get("host");
    d.path = q.get("path");
    d.fingerprint = q.get("fp");
    d.public_key = q.get("pbk");
    d.short_id = q.get("sid");
    d.spider_x = q.get("spx");
}

fn write_transport_query(w: &mut QueryWriter, d: &ServerDescriptor) {
    w.pair("security", d.tls.as_deref())
        .pair("sni", d.sni.as_deref())
        .pair("alpn", d.alpn.as_deref())
        .pair("type", d.network.as_deref())
        .pair("headerType", d.header_type.as_deref())
        .pair("host", d.host.as_deref())
        .pair("path", d.path.as_deref())
        .pair("fp", d.fingerprint.as_deref())
        .pair("pbk", d.public_key.as_deref())
        .pair("sid", d.short_id.as_deref())
        .pair("spx", d.spider_x.as_deref());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scheme_rejected() {
        let err = parse_share_link("socks5://127.0.0.1:1080").unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedScheme));
    }

    #[test]
    fn scheme_is_case_sensitive_and_untrimmed() {
        assert!(matches!(
            parse_share_link("VLESS://id@host:1?x=1").unwrap_err(),
            BridgeError::UnsupportedScheme
        ));
        assert!(matches!(
            parse_share_link(" vless://id@host:1?x=1").unwrap_err(),
            BridgeError::UnsupportedScheme
        ));
    }

    #[test]
    fn host_port_variants() {
        assert_eq!(
            split_host_port("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(split_host_port("[::1]:8080").unwrap(), ("::1".to_string(), 8080));
        assert!(matches!(
            split_host_port("example.com").unwrap_err(),
            BridgeError::MalformedAddress(_)
        ));
        assert!(matches!(
            split_host_port("example.com:70000").unwrap_err(),
            BridgeError::PortOutOfRange(_)
        ));
        assert!(matches!(
            split_host_port("example.com:abc").unwrap_err(),
            BridgeError::MalformedAddress(_)
        ));
    }

    #[test]
    fn ipv6_address_is_bracketed_on_output() {
        assert_eq!(format_host_port("2001:db8::1", 443), "[2001:db8::1]:443");
        assert_eq!(format_host_port("1.2.3.4", 443), "1.2.3.4:443");
    }

    #[test]
    fn remark_decoding() {
        assert_eq!(decode_component("My%20Server"), "My Server");
        assert_eq!(decode_component("My+Server"), "My Server");
        assert_eq!(decode_component("%E9%A6%99%E6%B8%AF"), "香港");
    }

    #[test]
    fn userinfo_keeps_literal_plus() {
        assert_eq!(decode_userinfo("ab+cd"), "ab+cd");
        assert_eq!(decode_userinfo("a%2Bb%20c"), "a+b c");
        assert_eq!(encode_userinfo("a+b c@d"), "a%2Bb%20c%40d");
        assert_eq!(encode_userinfo("plain-Pass_1.~"), "plain-Pass_1.~");
    }

    #[test]
    fn query_first_occurrence_wins() {
        let q = Query::parse("sni=a.com&sni=b.com&path=%2Fws&empty=");
        assert_eq!(q.get("sni").as_deref(), Some("a.com"));
        assert_eq!(q.get("path").as_deref(), Some("/ws"));
        assert_eq!(q.get("empty"), None);
    }

    #[test]
    fn descriptor_json_rejects_unknown_protocol() {
        let err = ServerDescriptor::from_json(r#"{"protocol":"hysteria2","address":"a","port":1}"#)
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedProtocol(p) if p == "hysteria2"));
    }

    #[test]
    fn descriptor_json_drops_empty_strings() {
        let d = ServerDescriptor::from_json(
            r#"{"protocol":"trojan","address":"a.com","port":443,"password":"pw","sni":""}"#,
        )
        .unwrap();
        assert_eq!(d.password.as_deref(), Some("pw"));
        assert_eq!(d.sni, None);
    }

    #[test]
    fn descriptor_json_omits_absent_fields() {
        let d = ServerDescriptor::new(Protocol::Trojan, "a.com", 443).with_password("pw");
        let json = d.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"protocol":"trojan","address":"a.com","port":443,"password":"pw"}"#
        );
    }

    #[test]
    fn with_methods_yield_new_values() {
        let base = ServerDescriptor::new(Protocol::Vless, "a.com", 443);
        let tuned = base.clone().with_tls("tls").with_sni("a.com");
        assert_eq!(base.tls, None);
        assert_eq!(tuned.tls.as_deref(), Some("tls"));
    }
}
