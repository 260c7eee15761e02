//! `vless://uuid@host:port?query#remark`

use super::{
    apply_transport_query, append_remark, format_host_port, split_fragment, split_host_port,
    split_userinfo, write_transport_query, Protocol, Query, QueryWriter, ServerDescriptor,
};
use crate::common::error::{BridgeError, Result};

pub(super) fn parse(rest: &str) -> Result<ServerDescriptor> {
    let (main, remark) = split_fragment(rest);
    // VLESS 链接必须带 query（至少有 encryption）
    let (authority, query) = main
        .split_once('?')
        .ok_or_else(|| BridgeError::MalformedAddress("vless link has no query".into()))?;
    let (uuid, host_port) = split_userinfo(authority)?;
    let (address, port) = split_host_port(host_port)?;

    let q = Query::parse(query);
    let mut d = ServerDescriptor::new(Protocol::Vless, address, port).with_id(uuid);
    d.encryption = q.get("encryption");
    d.flow = q.get("flow");
    apply_transport_query(&mut d, &q);
    d.remark = remark;
    Ok(d)
}

pub(super) fn generate(d: &ServerDescriptor) -> String {
    let mut w = QueryWriter::new();
    w.pair("encryption", d.encryption.as_deref())
        .pair("flow", d.flow.as_deref());
    write_transport_query(&mut w, d);

    let mut link = format!(
        "vless://{}@{}?{}",
        d.id.as_deref().unwrap_or_default(),
        format_host_port(&d.address, d.port),
        w.finish()
    );
    append_remark(&mut link, d.remark.as_deref());
    link
}
