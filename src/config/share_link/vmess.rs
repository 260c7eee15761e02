//! `vmess://base64(json)`，v2rayN 风格的短字段名 JSON

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde_json::{Map, Value};

use super::{non_empty, Protocol, ServerDescriptor};
use crate::common::error::{BridgeError, Result};

pub(super) fn parse(rest: &str) -> Result<ServerDescriptor> {
    let raw = STANDARD
        .decode(rest)
        .or_else(|_| STANDARD_NO_PAD.decode(rest))
        .map_err(|e| BridgeError::MalformedPayload(format!("vmess base64: {e}")))?;
    let json: Value = serde_json::from_slice(&raw)
        .map_err(|e| BridgeError::MalformedPayload(format!("vmess json: {e}")))?;
    let obj = json
        .as_object()
        .ok_or_else(|| BridgeError::MalformedPayload("vmess payload is not an object".into()))?;

    let address = field(obj, "add")
        .ok_or_else(|| BridgeError::MalformedAddress("vmess payload has no address".into()))?;
    let port_text = field(obj, "port")
        .ok_or_else(|| BridgeError::MalformedAddress("vmess payload has no port".into()))?;
    let port = port_text
        .parse::<u16>()
        .map_err(|_| BridgeError::PortOutOfRange(port_text.clone()))?;

    let mut d = ServerDescriptor::new(Protocol::Vmess, address, port);
    d.id = field(obj, "id");
    d.alter_id = match field(obj, "aid") {
        Some(aid) => Some(
            aid.parse::<u16>()
                .map_err(|_| BridgeError::MalformedPayload(format!("invalid aid '{aid}'")))?,
        ),
        None => None,
    };
    d.security = field(obj, "scy");
    d.network = field(obj, "net");
    d.header_type = field(obj, "type");
    d.host = field(obj, "host");
    d.path = field(obj, "path");
    d.tls = field(obj, "tls");
    d.sni = field(obj, "sni");
    d.alpn = field(obj, "alpn");
    d.fingerprint = field(obj, "fp");
    d.remark = field(obj, "ps");
    Ok(d)
}

pub(super) fn generate(d: &ServerDescriptor) -> Result<String> {
    let mut obj = Map::new();
    obj.insert("v".into(), Value::from("2"));
    obj.insert("add".into(), Value::from(d.address.as_str()));
    obj.insert("port".into(), Value::from(d.port.to_string()));

    let optional = [
        ("ps", d.remark.as_deref()),
        ("id", d.id.as_deref()),
        ("scy", d.security.as_deref()),
        ("net", d.network.as_deref()),
        ("type", d.header_type.as_deref()),
        ("host", d.host.as_deref()),
        ("path", d.path.as_deref()),
        ("tls", d.tls.as_deref()),
        ("sni", d.sni.as_deref()),
        ("alpn", d.alpn.as_deref()),
        ("fp", d.fingerprint.as_deref()),
    ];
    for (key, value) in optional {
        if let Some(v) = value {
            obj.insert(key.into(), Value::from(v));
        }
    }
    if let Some(aid) = d.alter_id {
        obj.insert("aid".into(), Value::from(aid.to_string()));
    }

    let json = serde_json::to_string(&Value::Object(obj))?;
    Ok(format!("vmess://{}", STANDARD.encode(json)))
}

/// 字符串或数字字段统一取文本；空串视为缺省
fn field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => non_empty(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(json: serde_json::Value) -> String {
        STANDARD.encode(json.to_string())
    }

    #[test]
    fn parse_string_fields() {
        let payload = encode(serde_json::json!({
            "v": "2", "ps": "tokyo", "add": "vm.example.com", "port": "443",
            "id": "b831381d-6324-4d53-ad4f-8cda48b30811", "aid": "0",
            "scy": "auto", "net": "ws", "type": "none", "host": "vm.example.com",
            "path": "/ray", "tls": "tls", "sni": "vm.example.com"
        }));
        let d = parse(&payload).unwrap();
        assert_eq!(d.address, "vm.example.com");
        assert_eq!(d.port, 443);
        assert_eq!(d.alter_id, Some(0));
        assert_eq!(d.security.as_deref(), Some("auto"));
        assert_eq!(d.header_type.as_deref(), Some("none"));
        assert_eq!(d.path.as_deref(), Some("/ray"));
        assert_eq!(d.remark.as_deref(), Some("tokyo"));
        assert_eq!(d.alpn, None);
    }

    #[test]
    fn numeric_json_fields_accepted() {
        let payload = encode(serde_json::json!({"add": "1.2.3.4", "port": 10086, "aid": 64, "id": "x"}));
        let d = parse(&payload).unwrap();
        assert_eq!(d.port, 10086);
        assert_eq!(d.alter_id, Some(64));
    }

    #[test]
    fn unpadded_base64_accepted() {
        let json = serde_json::json!({"add": "a.com", "port": "1"}).to_string();
        let d = parse(&STANDARD_NO_PAD.encode(json)).unwrap();
        assert_eq!(d.address, "a.com");
    }

    #[test]
    fn garbage_is_malformed_payload() {
        assert!(matches!(parse("!!!").unwrap_err(), BridgeError::MalformedPayload(_)));
        let not_json = STANDARD.encode("hello");
        assert!(matches!(parse(&not_json).unwrap_err(), BridgeError::MalformedPayload(_)));
    }

    #[test]
    fn non_numeric_port_rejected() {
        let payload = encode(serde_json::json!({"add": "a.com", "port": "https"}));
        assert!(matches!(parse(&payload).unwrap_err(), BridgeError::PortOutOfRange(_)));
        let payload = encode(serde_json::json!({"add": "a.com", "port": "70000"}));
        assert!(matches!(parse(&payload).unwrap_err(), BridgeError::PortOutOfRange(_)));
    }

    #[test]
    fn non_numeric_aid_rejected_but_empty_is_absent() {
        let payload = encode(serde_json::json!({"add": "a.com", "port": "1", "aid": "x"}));
        assert!(matches!(parse(&payload).unwrap_err(), BridgeError::MalformedPayload(_)));
        let payload = encode(serde_json::json!({"add": "a.com", "port": "1", "aid": ""}));
        assert_eq!(parse(&payload).unwrap().alter_id, None);
    }

    #[test]
    fn generate_skips_absent_fields() {
        let d = ServerDescriptor::new(Protocol::Vmess, "a.com", 443).with_id("uuid");
        let link = generate(&d).unwrap();
        let raw = STANDARD.decode(link.strip_prefix("vmess://").unwrap()).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(obj["v"], "2");
        assert_eq!(obj["port"], "443");
        assert!(!obj.contains_key("net"));
        assert!(!obj.contains_key("aid"));
        assert!(!obj.contains_key("ps"));
    }
}
