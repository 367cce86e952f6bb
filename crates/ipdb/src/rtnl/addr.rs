//! Addresses: `ifaddrmsg` and `IFA_*`.

use std::net::IpAddr;

use crate::netlink::codec::{AttrValue, Body, Message};
use crate::netlink::connection::Connection;
use crate::netlink::message::{NLM_F_CREATE, NLM_F_EXCL, NlMsgHdr, NlMsgType};
use crate::netlink::schema::{
    AttrKind as K, AttrSchema, FieldKind as F, MessageSchema, RecordSpec, attr, field,
};
use crate::netlink::{Error, Result};
use crate::value::Value;

use super::{AF_INET, family_of, parse_prefix};

static IFA_CACHEINFO: RecordSpec = RecordSpec {
    name: "ifa_cacheinfo",
    fields: &[
        field("ifa_preferred", F::U32),
        field("ifa_valid", F::U32),
        field("cstamp", F::U32),
        field("tstamp", F::U32),
    ],
};

pub static IFA_ATTRS: AttrSchema = AttrSchema {
    name: "ifa",
    attrs: &[
        attr(1, "IFA_ADDRESS", K::Ip),
        attr(2, "IFA_LOCAL", K::Ip),
        attr(3, "IFA_LABEL", K::AsciiZ),
        attr(4, "IFA_BROADCAST", K::Ip),
        attr(5, "IFA_ANYCAST", K::Ip),
        attr(6, "IFA_CACHEINFO", K::Record(&IFA_CACHEINFO)),
        attr(7, "IFA_MULTICAST", K::Ip),
        attr(8, "IFA_FLAGS", K::U32),
        attr(9, "IFA_RT_PRIORITY", K::U32),
        attr(10, "IFA_TARGET_NETNSID", K::I32),
        attr(11, "IFA_PROTO", K::U8),
    ],
};

/// `struct ifaddrmsg` followed by `IFA_*`.
pub static IFADDRMSG: MessageSchema = MessageSchema {
    name: "ifaddrmsg",
    fields: &[
        field("family", F::U8),
        field("prefixlen", F::U8),
        field("flags", F::U8),
        field("scope", F::U8),
        field("index", F::U32),
    ],
    attrs: &IFA_ATTRS,
    opaque_tail: false,
    self_sized: false,
};

/// IPv6 link-local /64: the kernel assigns these on its own.
pub fn is_link_local_64(ip: &IpAddr, prefix: u8) -> bool {
    match ip {
        IpAddr::V6(v6) => prefix == 64 && (v6.segments()[0] & 0xffc0) == 0xfe80,
        IpAddr::V4(_) => false,
    }
}

/// `(ifindex, address, prefix)` of an address message.
///
/// For IPv4 `IFA_LOCAL` is the interface address; `IFA_ADDRESS` may be the
/// peer of a point-to-point link.
pub fn address_key(body: &Body) -> Option<(u32, IpAddr, u8)> {
    let ip = body
        .attr_ip("IFA_LOCAL")
        .or_else(|| body.attr_ip("IFA_ADDRESS"))?;
    Some((
        body.field_or_zero("index") as u32,
        ip,
        body.field_or_zero("prefixlen") as u8,
    ))
}

/// Builder for RTM_NEWADDR / RTM_DELADDR.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressRequest {
    index: u32,
    address: IpAddr,
    prefix: u8,
    local: Option<IpAddr>,
    broadcast: Option<IpAddr>,
    label: Option<String>,
    scope: u8,
}

impl AddressRequest {
    pub fn new(index: u32, address: IpAddr, prefix: u8) -> Self {
        Self {
            index,
            address,
            prefix,
            local: None,
            broadcast: None,
            label: None,
            scope: 0,
        }
    }

    /// Accepts `"ip/prefix"` or a bare address.
    pub fn parse(index: u32, spec: &str) -> Result<Self> {
        let (ip, prefix) = parse_prefix(spec)?;
        Ok(Self::new(index, ip, prefix))
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Requests the kernel handles by itself are skipped.
    pub fn is_ignored(&self) -> bool {
        is_link_local_64(&self.address, self.prefix)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let value = value.into();
        let ip = |v: &Value| -> Result<IpAddr> {
            v.as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Parse(format!("{key}: invalid address {v}")))
        };
        match key {
            "index" => {
                self.index = value
                    .as_u32()
                    .ok_or_else(|| Error::InvalidAttribute(format!("index: {value}")))?;
            }
            "address" => {
                let (addr, prefix) = parse_prefix(&value.to_string())?;
                self.address = addr;
                if value.as_str().is_some_and(|s| s.contains('/')) {
                    self.prefix = prefix;
                }
            }
            "prefixlen" | "prefix" | "mask" => {
                self.prefix = value
                    .as_int()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| Error::InvalidAttribute(format!("{key}: {value}")))?;
            }
            "local" => self.local = Some(ip(&value)?),
            "broadcast" => self.broadcast = Some(ip(&value)?),
            "label" => self.label = Some(value.to_string()),
            "scope" => {
                self.scope = value
                    .as_int()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| Error::InvalidAttribute(format!("scope: {value}")))?;
            }
            _ => {
                return Err(Error::InvalidAttribute(format!(
                    "addresses have no attribute {key}"
                )));
            }
        }
        Ok(self)
    }

    pub fn build(&self, msg_type: u16, flags: u16) -> Result<Message> {
        let mut msg = Message {
            header: NlMsgHdr::new(msg_type, flags),
            body: Body::new(&IFADDRMSG),
        };
        let family = family_of(&self.address);
        msg.set_field("family", family as u64)?;
        msg.set_field("prefixlen", self.prefix as u64)?;
        msg.set_field("scope", self.scope as u64)?;
        msg.set_field("index", self.index as u64)?;

        let local = self.local.unwrap_or(self.address);
        msg.push("IFA_LOCAL", AttrValue::Ip(local))?;
        msg.push("IFA_ADDRESS", AttrValue::Ip(self.address))?;
        if let Some(brd) = self.broadcast.filter(|_| family == AF_INET) {
            msg.push("IFA_BROADCAST", AttrValue::Ip(brd))?;
        }
        if let Some(label) = &self.label {
            msg.push("IFA_LABEL", AttrValue::Str(label.clone()))?;
        }
        Ok(msg)
    }
}

impl Connection {
    /// Dump every address.
    pub async fn get_addresses(&self) -> Result<Vec<Message>> {
        self.dump(Message::new(&IFADDRMSG, NlMsgType::RTM_GETADDR, 0))
            .await
    }

    /// Add an address.
    pub async fn add_address(&self, req: &AddressRequest) -> Result<()> {
        let msg = req.build(NlMsgType::RTM_NEWADDR, NLM_F_CREATE | NLM_F_EXCL)?;
        self.request(msg).await.map_err(|e| {
            e.with_context(format!(
                "adding {}/{} to link {}",
                req.address, req.prefix, req.index
            ))
        })?;
        Ok(())
    }

    /// Delete an address.
    pub async fn del_address(&self, req: &AddressRequest) -> Result<()> {
        let msg = req.build(NlMsgType::RTM_DELADDR, 0)?;
        self.request(msg).await.map_err(|e| {
            e.with_context(format!(
                "deleting {}/{} from link {}",
                req.address, req.prefix, req.index
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtnl::REGISTRY;

    #[test]
    fn test_build_v4() {
        let mut req = AddressRequest::parse(5, "172.16.200.1/24").unwrap();
        req.set("broadcast", "172.16.200.255").unwrap();
        let msg = req.build(NlMsgType::RTM_NEWADDR, NLM_F_CREATE).unwrap();

        assert_eq!(msg.field("family"), Some(AF_INET as u64));
        assert_eq!(msg.field("prefixlen"), Some(24));
        assert_eq!(
            address_key(&msg),
            Some((5, "172.16.200.1".parse().unwrap(), 24))
        );
        let decoded = Message::decode(&msg.encode(), &REGISTRY).unwrap();
        assert_eq!(decoded.encode(), msg.encode());
        assert_eq!(
            decoded.attr_ip("IFA_BROADCAST"),
            Some("172.16.200.255".parse().unwrap())
        );
    }

    #[test]
    fn test_link_local_is_ignored() {
        assert!(AddressRequest::parse(1, "fe80::1/64").unwrap().is_ignored());
        assert!(!AddressRequest::parse(1, "fe80::1/128").unwrap().is_ignored());
        assert!(!AddressRequest::parse(1, "2001:db8::1/64").unwrap().is_ignored());
    }

    #[test]
    fn test_set_address_and_prefix_separately() {
        let mut req = AddressRequest::parse(1, "10.0.0.1/8").unwrap();
        req.set("address", "10.1.1.1").unwrap().set("prefixlen", 16).unwrap();
        assert_eq!(req.address(), "10.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(req.prefix(), 16);
        assert!(req.set("bogus", 1).is_err());
    }
}
