//! RTNL message schemas and request builders.
//!
//! Each object family has a module holding its schema tables, a request
//! builder that turns key/value input into a wire [`Message`], and the
//! [`Connection`](crate::netlink::Connection) methods that issue them.
//!
//! Keys are derived from attribute names: `IFLA_MTU` is `mtu`,
//! `IFLA_VLAN_ID` is `vlan_id` (or just `id` once the link kind is `vlan`),
//! `RTA_GATEWAY` is `gateway`.

pub mod addr;
pub mod link;
pub mod neigh;
pub mod proxy;
pub mod route;
pub mod rule;
pub mod tc;
pub mod tuntap;

use std::net::IpAddr;

use crate::netlink::codec::{AttrValue, parse_lladdr};
use crate::netlink::message::NlMsgType;
use crate::netlink::schema::{AttrKind, AttrSchema, AttrSpec, Registry};
use crate::netlink::{Error, Result};
use crate::value::Value;

pub use addr::AddressRequest;
pub use link::{LinkExt, LinkRequest};
pub use neigh::NeighRequest;
pub use route::RouteRequest;
pub use rule::RuleRequest;
pub use tc::TcRequest;

/// Schemas of every NETLINK_ROUTE message type.
pub static REGISTRY: Registry = Registry {
    protocol: "rtnl",
    messages: &[
        (NlMsgType::RTM_NEWLINK, &link::IFINFOMSG),
        (NlMsgType::RTM_DELLINK, &link::IFINFOMSG),
        (NlMsgType::RTM_GETLINK, &link::IFINFOMSG),
        (NlMsgType::RTM_SETLINK, &link::IFINFOMSG),
        (NlMsgType::RTM_NEWADDR, &addr::IFADDRMSG),
        (NlMsgType::RTM_DELADDR, &addr::IFADDRMSG),
        (NlMsgType::RTM_GETADDR, &addr::IFADDRMSG),
        (NlMsgType::RTM_NEWROUTE, &route::RTMSG),
        (NlMsgType::RTM_DELROUTE, &route::RTMSG),
        (NlMsgType::RTM_GETROUTE, &route::RTMSG),
        (NlMsgType::RTM_NEWNEIGH, &neigh::NDMSG),
        (NlMsgType::RTM_DELNEIGH, &neigh::NDMSG),
        (NlMsgType::RTM_GETNEIGH, &neigh::NDMSG),
        (NlMsgType::RTM_NEWRULE, &rule::FIB_RULE_HDR),
        (NlMsgType::RTM_DELRULE, &rule::FIB_RULE_HDR),
        (NlMsgType::RTM_GETRULE, &rule::FIB_RULE_HDR),
        (NlMsgType::RTM_NEWQDISC, &tc::TCMSG),
        (NlMsgType::RTM_DELQDISC, &tc::TCMSG),
        (NlMsgType::RTM_GETQDISC, &tc::TCMSG),
        (NlMsgType::RTM_NEWTCLASS, &tc::TCMSG),
        (NlMsgType::RTM_DELTCLASS, &tc::TCMSG),
        (NlMsgType::RTM_GETTCLASS, &tc::TCMSG),
        (NlMsgType::RTM_NEWTFILTER, &tc::TCMSG),
        (NlMsgType::RTM_DELTFILTER, &tc::TCMSG),
        (NlMsgType::RTM_GETTFILTER, &tc::TCMSG),
    ],
};

/// Address families.
pub const AF_UNSPEC: u8 = libc::AF_UNSPEC as u8;
pub const AF_INET: u8 = libc::AF_INET as u8;
pub const AF_INET6: u8 = libc::AF_INET6 as u8;
pub const AF_BRIDGE: u8 = libc::AF_BRIDGE as u8;

pub fn family_of(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => AF_INET,
        IpAddr::V6(_) => AF_INET6,
    }
}

/// Key of an attribute: its name without the family prefix, lowercased.
pub fn key_of(attr_name: &str, prefix: &str) -> String {
    attr_name
        .strip_prefix(prefix)
        .unwrap_or(attr_name)
        .to_ascii_lowercase()
}

/// Find the attribute a key names in `schema`.
///
/// `short` allows the key to omit the first segment of the name, so that
/// `id` finds `IFLA_VLAN_ID` in the vlan data schema.
pub(crate) fn spec_for_key(
    schema: &'static AttrSchema,
    prefix: &str,
    key: &str,
    short: bool,
) -> Option<&'static AttrSpec> {
    schema.attrs.iter().find(|spec| {
        let full = key_of(spec.name, prefix);
        full == key
            || (short
                && full
                    .split_once('_')
                    .is_some_and(|(_, rest)| rest == key))
    })
}

fn int<T: TryFrom<i64>>(name: &str, value: &Value) -> Result<T> {
    value
        .as_int()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| Error::InvalidAttribute(format!("{name}: {value} is out of range")))
}

fn text<'a>(name: &str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| Error::InvalidAttribute(format!("{name}: expected a string, got {value}")))
}

/// Convert a scalar value to the payload an attribute spec expects.
///
/// A false flag yields `None`: flags are expressed by presence.
pub(crate) fn attr_value(spec: &AttrSpec, value: &Value) -> Result<Option<AttrValue>> {
    let name = spec.name;
    let v = match spec.kind {
        AttrKind::U8 => AttrValue::U8(int(name, value)?),
        AttrKind::U16 => AttrValue::U16(int(name, value)?),
        AttrKind::U32 => AttrValue::U32(int(name, value)?),
        AttrKind::U64 => AttrValue::U64(int(name, value)?),
        AttrKind::I32 => AttrValue::I32(int(name, value)?),
        AttrKind::U16Be => AttrValue::U16Be(int(name, value)?),
        AttrKind::U32Be => AttrValue::U32Be(int(name, value)?),
        AttrKind::AsciiZ => AttrValue::Str(value.to_string()),
        AttrKind::Ip => AttrValue::Ip(
            text(name, value)?
                .parse()
                .map_err(|_| Error::Parse(format!("{name}: invalid address {value}")))?,
        ),
        AttrKind::LlAddr => AttrValue::LlAddr(parse_lladdr(text(name, value)?)?),
        AttrKind::Flag => {
            return Ok(value.as_bool().unwrap_or(false).then_some(AttrValue::Flag));
        }
        AttrKind::Bytes | AttrKind::Hex => AttrValue::Bytes(text(name, value)?.as_bytes().to_vec()),
        AttrKind::Nested(_)
        | AttrKind::NestedMessage(_)
        | AttrKind::NestedList(_)
        | AttrKind::Record(_)
        | AttrKind::ByKind(_) => {
            return Err(Error::InvalidAttribute(format!(
                "{name} cannot be set from a scalar"
            )));
        }
    };
    Ok(Some(v))
}

/// Parse `"addr/prefix"` or a bare address (full-length prefix).
pub fn parse_prefix(s: &str) -> Result<(IpAddr, u8)> {
    let (addr, len) = match s.split_once('/') {
        Some((addr, len)) => (addr, Some(len)),
        None => (s, None),
    };
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| Error::Parse(format!("invalid address: {s}")))?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    let len = match len {
        Some(len) => len
            .parse::<u8>()
            .ok()
            .filter(|l| *l <= max)
            .ok_or_else(|| Error::Parse(format!("invalid prefix length: {s}")))?,
        None => max,
    };
    Ok((ip, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::schema::OPAQUE_SCHEMA;

    #[test]
    fn test_registry_covers_rtm_types() {
        assert_eq!(REGISTRY.schema(NlMsgType::RTM_NEWLINK).name, "ifinfomsg");
        assert_eq!(REGISTRY.schema(NlMsgType::RTM_DELADDR).name, "ifaddrmsg");
        assert_eq!(REGISTRY.schema(NlMsgType::RTM_GETTFILTER).name, "tcmsg");
        assert!(std::ptr::eq(
            REGISTRY.schema(NlMsgType::DONE),
            &OPAQUE_SCHEMA
        ));
    }

    #[test]
    fn test_keys() {
        assert_eq!(key_of("IFLA_MTU", "IFLA_"), "mtu");
        let spec = spec_for_key(&link::VLAN_DATA, "IFLA_", "id", true).unwrap();
        assert_eq!(spec.name, "IFLA_VLAN_ID");
        assert!(spec_for_key(&link::VLAN_DATA, "IFLA_", "id", false).is_none());
    }

    #[test]
    fn test_attr_value_ranges() {
        let spec = link::IFLA_ATTRS.by_name("IFLA_OPERSTATE").unwrap();
        assert!(attr_value(spec, &Value::from(300)).is_err());
        assert_eq!(
            attr_value(spec, &Value::from(6)).unwrap(),
            Some(AttrValue::U8(6))
        );
    }

    #[test]
    fn test_parse_prefix() {
        assert_eq!(
            parse_prefix("10.0.0.1/24").unwrap(),
            ("10.0.0.1".parse().unwrap(), 24)
        );
        assert_eq!(parse_prefix("fe80::1").unwrap().1, 128);
        assert!(parse_prefix("10.0.0.1/33").is_err());
        assert!(parse_prefix("nope").is_err());
    }
}
