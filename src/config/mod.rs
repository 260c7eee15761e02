pub mod builder;
pub mod share_link;
pub mod types;

use std::path::Path;

use tracing::debug;

use crate::common::error::{BridgeError, Result};

pub use builder::{ConfigBuilder, InboundOptions, OutboundTarget};
pub use share_link::{generate_share_link, parse_share_link, Protocol, ServerDescriptor};
pub use types::ProxyConfiguration;

/// 解析配置文本：先按 JSON，失败再按 YAML
///
/// 返回前做可构建性校验（至少一个入站与出站）。
pub fn parse_config(content: &str) -> Result<ProxyConfiguration> {
    let config: ProxyConfiguration = match serde_json::from_str(content) {
        Ok(c) => c,
        Err(json_err) => {
            debug!(error = %json_err, "config is not JSON, trying YAML");
            serde_yml::from_str(content).map_err(|yaml_err| {
                BridgeError::InvalidConfig(format!("json: {json_err}; yaml: {yaml_err}"))
            })?
        }
    };
    config.validate()?;
    Ok(config)
}

pub fn load_config_file(path: impl AsRef<Path>) -> Result<ProxyConfiguration> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_JSON: &str = r#"{
        "inbounds": [{"tag": "socks-in", "protocol": "socks", "port": 10808}],
        "outbounds": [{"tag": "direct", "protocol": "freedom"}]
    }"#;

    #[test]
    fn parse_json_config() {
        let cfg = parse_config(MINIMAL_JSON).unwrap();
        assert_eq!(cfg.inbounds[0].listen, None);
        assert_eq!(cfg.inbounds[0].port, 10808);
        assert!(cfg.outbound("direct").is_some());
    }

    #[test]
    fn untagged_entries_are_accepted() {
        let text = r#"{
            "inbounds": [{"protocol": "dokodemo-door", "port": 53, "settings": {"network": "udp"}}],
            "outbounds": [{"protocol": "freedom"}, {"protocol": "blackhole"}]
        }"#;
        let cfg = parse_config(text).unwrap();
        assert!(cfg.inbounds[0].tag.is_none());
        assert!(cfg.outbounds.iter().all(|o| o.tag.is_none()));

        let out: serde_json::Value = serde_json::from_str(&cfg.to_json_pretty().unwrap()).unwrap();
        assert!(out["inbounds"][0].get("tag").is_none());
        assert!(out["inbounds"][0].get("listen").is_none());
    }

    #[test]
    fn yaml_keeps_unmodelled_fields() {
        let yaml = "inbounds:\n  - protocol: socks\n    port: 1080\n    sniffing:\n      enabled: true\noutbounds:\n  - protocol: freedom\n    mux:\n      enabled: false\n";
        let cfg = parse_config(yaml).unwrap();
        assert_eq!(cfg.inbounds[0].extra["sniffing"]["enabled"], true);
        assert_eq!(cfg.outbounds[0].extra["mux"]["enabled"], false);
    }

    #[test]
    fn parse_yaml_fallback() {
        let yaml = "log:\n  loglevel: error\ninbounds:\n  - tag: http-in\n    protocol: http\n    port: 8080\noutbounds:\n  - tag: block\n    protocol: blackhole\n";
        let cfg = parse_config(yaml).unwrap();
        assert_eq!(cfg.inbounds[0].protocol, "http");
        assert_eq!(cfg.log.loglevel, types::LogLevel::Error);
    }

    #[test]
    fn empty_document_is_missing_inbound() {
        assert!(matches!(parse_config("{}"), Err(BridgeError::MissingInbound)));
    }

    #[test]
    fn garbage_is_invalid_config() {
        let err = parse_config("[[[ not a config").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, MINIMAL_JSON).unwrap();
        let cfg = load_config_file(&path).unwrap();
        assert_eq!(cfg.inbounds.len(), 1);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
