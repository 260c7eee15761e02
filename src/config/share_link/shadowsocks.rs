//! `ss://base64(method:password)@host:port#remark`（SIP002）
//! 以及整段 base64 的旧格式 `ss://base64(method:password@host:port)#remark`

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use super::{append_remark, format_host_port, split_fragment, split_host_port, Protocol, ServerDescriptor};
use crate::common::error::{BridgeError, Result};

pub(super) fn parse(rest: &str) -> Result<ServerDescriptor> {
    let (main, remark) = split_fragment(rest);

    let (method, password, address, port) = match main.rsplit_once('@') {
        Some((userinfo, host_part)) => {
            let (method, password) = split_credentials(&decode_any(userinfo)?)?;
            let (address, port) = split_host_port(strip_plugin(host_part))?;
            (method, password, address, port)
        }
        None => {
            let decoded = decode_any(strip_plugin(main))?;
            let (userinfo, host_part) = decoded.rsplit_once('@').ok_or_else(|| {
                BridgeError::MalformedAddress("shadowsocks link has no '@'".into())
            })?;
            let (method, password) = split_credentials(userinfo)?;
            let (address, port) = split_host_port(host_part)?;
            (method, password, address, port)
        }
    };

    let mut d = ServerDescriptor::new(Protocol::Shadowsocks, address, port)
        .with_method(method)
        .with_password(password);
    d.remark = remark;
    Ok(d)
}

pub(super) fn generate(d: &ServerDescriptor) -> String {
    let credentials = format!(
        "{}:{}",
        d.method.as_deref().unwrap_or_default(),
        d.password.as_deref().unwrap_or_default()
    );
    let mut link = format!(
        "ss://{}@{}",
        STANDARD.encode(credentials),
        format_host_port(&d.address, d.port)
    );
    append_remark(&mut link, d.remark.as_deref());
    link
}

/// 依次尝试四种 base64 变体
fn decode_any(s: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(s)
        .or_else(|_| STANDARD_NO_PAD.decode(s))
        .or_else(|_| URL_SAFE.decode(s))
        .or_else(|_| URL_SAFE_NO_PAD.decode(s))
        .map_err(|e| BridgeError::MalformedPayload(format!("shadowsocks base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| BridgeError::MalformedPayload(format!("shadowsocks credentials: {e}")))
}

/// 以第一个 `:` 分隔 method 与 password
fn split_credentials(s: &str) -> Result<(String, String)> {
    let (method, password) = s.split_once(':').ok_or_else(|| {
        BridgeError::MalformedCredentials("expected 'method:password'".into())
    })?;
    Ok((method.to_string(), password.to_string()))
}

/// 去掉 SIP002 的 `/?plugin=...` 段
fn strip_plugin(s: &str) -> &str {
    let s = s.split_once('?').map_or(s, |(head, _)| head);
    s.strip_suffix('/').unwrap_or(s)
}
