//! Neighbours: `ndmsg` and `NDA_*`.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::netlink::codec::{AttrValue, Body, Message, parse_lladdr};
use crate::netlink::connection::Connection;
use crate::netlink::message::{NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NlMsgHdr, NlMsgType};
use crate::netlink::schema::{
    AttrKind as K, AttrSchema, FieldKind as F, MessageSchema, RecordSpec, attr, field,
};
use crate::netlink::{Error, Result};
use crate::value::Value;

use super::{family_of, key_of};

/// Neighbour cache states (`NUD_*`).
pub mod nud {
    pub const INCOMPLETE: u16 = 0x01;
    pub const REACHABLE: u16 = 0x02;
    pub const STALE: u16 = 0x04;
    pub const DELAY: u16 = 0x08;
    pub const PROBE: u16 = 0x10;
    pub const FAILED: u16 = 0x20;
    pub const NOARP: u16 = 0x40;
    pub const PERMANENT: u16 = 0x80;

    pub const NAMES: &[(&str, u16)] = &[
        ("incomplete", INCOMPLETE),
        ("reachable", REACHABLE),
        ("stale", STALE),
        ("delay", DELAY),
        ("probe", PROBE),
        ("failed", FAILED),
        ("noarp", NOARP),
        ("permanent", PERMANENT),
    ];

    pub fn by_name(name: &str) -> Option<u16> {
        NAMES.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }
}

static NDA_CACHEINFO: RecordSpec = RecordSpec {
    name: "nda_cacheinfo",
    fields: &[
        field("ndm_confirmed", F::U32),
        field("ndm_used", F::U32),
        field("ndm_updated", F::U32),
        field("ndm_refcnt", F::U32),
    ],
};

pub static NDA_ATTRS: AttrSchema = AttrSchema {
    name: "nda",
    attrs: &[
        attr(1, "NDA_DST", K::Ip),
        attr(2, "NDA_LLADDR", K::LlAddr),
        attr(3, "NDA_CACHEINFO", K::Record(&NDA_CACHEINFO)),
        attr(4, "NDA_PROBES", K::U32),
        attr(5, "NDA_VLAN", K::U16),
        attr(6, "NDA_PORT", K::U16Be),
        attr(7, "NDA_VNI", K::U32),
        attr(8, "NDA_IFINDEX", K::U32),
        attr(9, "NDA_MASTER", K::U32),
        attr(10, "NDA_LINK_NETNSID", K::I32),
        attr(11, "NDA_SRC_VNI", K::U32),
        attr(12, "NDA_PROTOCOL", K::U8),
    ],
};

/// `struct ndmsg` followed by `NDA_*`.
pub static NDMSG: MessageSchema = MessageSchema {
    name: "ndmsg",
    fields: &[
        field("family", F::U8),
        field("pad1", F::U8),
        field("pad2", F::U16),
        field("ifindex", F::I32),
        field("state", F::U16),
        field("flags", F::U8),
        field("type", F::U8),
    ],
    attrs: &NDA_ATTRS,
    opaque_tail: false,
    self_sized: false,
};

/// `(ifindex, destination)` of a neighbour message.
pub fn neigh_key(body: &Body) -> Option<(u32, IpAddr)> {
    let dst = body.attr_ip("NDA_DST")?;
    Some((body.field_or_zero("ifindex") as u32, dst))
}

/// Flatten a neighbour message into database fields.
pub fn neigh_fields(body: &Body) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    for (spec, v) in body.schema.fields.iter().zip(&body.fields) {
        if !spec.name.starts_with("pad") {
            fields.insert(spec.name.to_string(), Value::from(*v));
        }
    }
    for a in &body.attrs {
        if let Some(v) = Value::from_attr(&a.value) {
            fields.insert(key_of(a.name, "NDA_"), v);
        }
    }
    fields
}

/// Builder for RTM_NEWNEIGH / RTM_DELNEIGH.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighRequest {
    ifindex: u32,
    dst: IpAddr,
    lladdr: Option<[u8; 6]>,
    state: u16,
    flags: u8,
}

impl NeighRequest {
    /// A permanent entry for `dst` on `ifindex`.
    pub fn new(ifindex: u32, dst: IpAddr) -> Self {
        Self {
            ifindex,
            dst,
            lladdr: None,
            state: nud::PERMANENT,
            flags: 0,
        }
    }

    pub fn dst(&self) -> IpAddr {
        self.dst
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Accepts `ifindex`, `dst`, `lladdr`, `state` (name or number) and `flags`.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let value = value.into();
        let invalid = || Error::InvalidAttribute(format!("{key}: {value}"));
        match key {
            "ifindex" | "index" => self.ifindex = value.as_u32().ok_or_else(invalid)?,
            "dst" => {
                self.dst = value
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::Parse(format!("dst: invalid address {value}")))?;
            }
            "lladdr" => self.lladdr = Some(parse_lladdr(&value.to_string())?),
            "state" => {
                self.state = match value.as_str().and_then(nud::by_name) {
                    Some(state) => state,
                    None => value
                        .as_int()
                        .and_then(|v| u16::try_from(v).ok())
                        .ok_or_else(invalid)?,
                };
            }
            "flags" => {
                self.flags = value
                    .as_int()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(invalid)?;
            }
            _ => {
                return Err(Error::InvalidAttribute(format!(
                    "neighbours have no attribute {key}"
                )));
            }
        }
        Ok(self)
    }

    pub fn build(&self, msg_type: u16, flags: u16) -> Result<Message> {
        let mut msg = Message {
            header: NlMsgHdr::new(msg_type, flags),
            body: Body::new(&NDMSG),
        };
        msg.set_field("family", family_of(&self.dst) as u64)?;
        msg.set_field("ifindex", self.ifindex as u64)?;
        msg.set_field("state", self.state as u64)?;
        msg.set_field("flags", self.flags as u64)?;
        msg.push("NDA_DST", AttrValue::Ip(self.dst))?;
        if let Some(mac) = self.lladdr {
            msg.push("NDA_LLADDR", AttrValue::LlAddr(mac))?;
        }
        Ok(msg)
    }
}

impl Connection {
    /// Dump the neighbour tables of every family.
    pub async fn get_neighbours(&self) -> Result<Vec<Message>> {
        self.dump(Message::new(&NDMSG, NlMsgType::RTM_GETNEIGH, 0))
            .await
    }

    /// Add a neighbour entry; `replace` overwrites an existing one.
    pub async fn add_neighbour(&self, req: &NeighRequest, replace: bool) -> Result<()> {
        let flags = if replace {
            NLM_F_CREATE | NLM_F_REPLACE
        } else {
            NLM_F_CREATE | NLM_F_EXCL
        };
        let msg = req.build(NlMsgType::RTM_NEWNEIGH, flags)?;
        self.request(msg).await.map_err(|e| {
            e.with_context(format!("adding neighbour {} on link {}", req.dst, req.ifindex))
        })?;
        Ok(())
    }

    /// Delete a neighbour entry.
    pub async fn del_neighbour(&self, req: &NeighRequest) -> Result<()> {
        let msg = req.build(NlMsgType::RTM_DELNEIGH, 0)?;
        self.request(msg).await.map_err(|e| {
            e.with_context(format!(
                "deleting neighbour {} on link {}",
                req.dst, req.ifindex
            ))
        })?;
        Ok(())
    }
}
