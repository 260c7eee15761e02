//! `trojan://password@host:port[?query]#remark`

use super::{
    apply_transport_query, append_remark, decode_userinfo, encode_userinfo, format_host_port,
    split_fragment, split_host_port, split_userinfo, write_transport_query, Protocol, Query,
    QueryWriter, ServerDescriptor,
};
use crate::common::error::Result;

pub(super) fn parse(rest: &str) -> Result<ServerDescriptor> {
    let (main, remark) = split_fragment(rest);
    let (authority, query) = match main.split_once('?') {
        Some((a, q)) => (a, Some(q)),
        None => (main, None),
    };
    let (password, host_port) = split_userinfo(authority)?;
    let (address, port) = split_host_port(host_port)?;

    let mut d = ServerDescriptor::new(Protocol::Trojan, address, port)
        .with_password(decode_userinfo(password));
    if let Some(query) = query {
        apply_transport_query(&mut d, &Query::parse(query));
    }
    d.remark = remark;
    Ok(d)
}

pub(super) fn generate(d: &ServerDescriptor) -> String {
    let password = encode_userinfo(d.password.as_deref().unwrap_or_default());
    let mut link = format!(
        "trojan://{}@{}",
        password,
        format_host_port(&d.address, d.port)
    );

    let mut w = QueryWriter::new();
    write_transport_query(&mut w, d);
    let query = w.finish();
    if !query.is_empty() {
        link.push('?');
        link.push_str(&query);
    }
    append_remark(&mut link, d.remark.as_deref());
    link
}
