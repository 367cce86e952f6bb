//! Routes: `rtmsg`, `RTA_*`, `RTAX_*` metrics and multipath next hops.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use crate::netlink::codec::{AttrValue, Attribute, Body, Message};
use crate::netlink::connection::Connection;
use crate::netlink::message::{NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NlMsgHdr, NlMsgType};
use crate::netlink::schema::{
    AttrKind as K, AttrSchema, FieldKind as F, MessageSchema, RecordSpec, attr, field,
};
use crate::netlink::{Error, Result};
use crate::value::Value;

use super::{AF_INET, attr_value, family_of, key_of, parse_prefix, spec_for_key};

/// The main routing table.
pub const RT_TABLE_MAIN: u32 = 254;
pub const RT_TABLE_UNSPEC: u8 = 0;

pub const RTPROT_BOOT: u8 = 3;
pub const RTN_UNICAST: u8 = 1;

pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RT_SCOPE_LINK: u8 = 253;
pub const RT_SCOPE_NOWHERE: u8 = 255;

static RTA_CACHEINFO: RecordSpec = RecordSpec {
    name: "rta_cacheinfo",
    fields: &[
        field("rta_clntref", F::U32),
        field("rta_lastuse", F::U32),
        field("rta_expires", F::I32),
        field("rta_error", F::U32),
        field("rta_used", F::U32),
        field("rta_id", F::U32),
        field("rta_ts", F::U32),
        field("rta_tsage", F::U32),
    ],
};

pub static RTAX_ATTRS: AttrSchema = AttrSchema {
    name: "rtax",
    attrs: &[
        attr(1, "RTAX_LOCK", K::U32),
        attr(2, "RTAX_MTU", K::U32),
        attr(3, "RTAX_WINDOW", K::U32),
        attr(4, "RTAX_RTT", K::U32),
        attr(5, "RTAX_RTTVAR", K::U32),
        attr(6, "RTAX_SSTHRESH", K::U32),
        attr(7, "RTAX_CWND", K::U32),
        attr(8, "RTAX_ADVMSS", K::U32),
        attr(9, "RTAX_REORDERING", K::U32),
        attr(10, "RTAX_HOPLIMIT", K::U32),
        attr(11, "RTAX_INITCWND", K::U32),
        attr(12, "RTAX_FEATURES", K::U32),
        attr(13, "RTAX_RTO_MIN", K::U32),
        attr(14, "RTAX_INITRWND", K::U32),
        attr(15, "RTAX_QUICKACK", K::U32),
        attr(16, "RTAX_CC_ALGO", K::AsciiZ),
        attr(17, "RTAX_FASTOPEN_NO_COOKIE", K::U32),
    ],
};

/// `struct rtnexthop`; `len` covers the record and its attributes.
pub static RTNEXTHOP: MessageSchema = MessageSchema {
    name: "rtnexthop",
    fields: &[
        field("len", F::U16),
        field("flags", F::U8),
        field("hops", F::U8),
        field("ifindex", F::I32),
    ],
    attrs: &RTA_ATTRS,
    opaque_tail: false,
    self_sized: true,
};

pub static RTA_ATTRS: AttrSchema = AttrSchema {
    name: "rta",
    attrs: &[
        attr(1, "RTA_DST", K::Ip),
        attr(2, "RTA_SRC", K::Ip),
        attr(3, "RTA_IIF", K::U32),
        attr(4, "RTA_OIF", K::U32),
        attr(5, "RTA_GATEWAY", K::Ip),
        attr(6, "RTA_PRIORITY", K::U32),
        attr(7, "RTA_PREFSRC", K::Ip),
        attr(8, "RTA_METRICS", K::Nested(&RTAX_ATTRS)),
        attr(9, "RTA_MULTIPATH", K::NestedList(&RTNEXTHOP)),
        attr(11, "RTA_FLOW", K::U32),
        attr(12, "RTA_CACHEINFO", K::Record(&RTA_CACHEINFO)),
        attr(15, "RTA_TABLE", K::U32),
        attr(16, "RTA_MARK", K::U32),
        attr(17, "RTA_MFC_STATS", K::Hex),
        attr(18, "RTA_VIA", K::Hex),
        attr(19, "RTA_NEWDST", K::Hex),
        attr(20, "RTA_PREF", K::U8),
        attr(21, "RTA_ENCAP_TYPE", K::U16),
        attr(22, "RTA_ENCAP", K::Hex),
        attr(23, "RTA_EXPIRES", K::U32),
        attr(25, "RTA_UID", K::U32),
        attr(26, "RTA_TTL_PROPAGATE", K::U8),
        attr(27, "RTA_IP_PROTO", K::U8),
        attr(28, "RTA_SPORT", K::U16Be),
        attr(29, "RTA_DPORT", K::U16Be),
        attr(30, "RTA_NH_ID", K::U32),
    ],
};

/// `struct rtmsg` followed by `RTA_*`.
pub static RTMSG: MessageSchema = MessageSchema {
    name: "rtmsg",
    fields: &[
        field("family", F::U8),
        field("dst_len", F::U8),
        field("src_len", F::U8),
        field("tos", F::U8),
        field("table", F::U8),
        field("protocol", F::U8),
        field("scope", F::U8),
        field("type", F::U8),
        field("flags", F::U32),
    ],
    attrs: &RTA_ATTRS,
    opaque_tail: false,
    self_sized: false,
};

/// Identity of a route inside one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RouteKey {
    /// `None` for the default route.
    pub dst: Option<IpAddr>,
    pub dst_len: u8,
    pub oif: u32,
    pub iif: u32,
}

impl RouteKey {
    /// A key from `"default"` or `"addr/len"`.
    pub fn parse(dst: &str) -> Result<Self> {
        let (dst, dst_len) = parse_dst(dst)?;
        Ok(Self {
            dst,
            dst_len,
            oif: 0,
            iif: 0,
        })
    }

    /// Destination alone: `"default"` or `"addr/len"`.
    pub fn dst_string(&self) -> String {
        match self.dst {
            Some(dst) => format!("{dst}/{}", self.dst_len),
            None => "default".to_string(),
        }
    }

    /// Whether `other` names the same destination, ignoring unset interfaces.
    pub fn matches(&self, other: &RouteKey) -> bool {
        self.dst == other.dst
            && self.dst_len == other.dst_len
            && (other.oif == 0 || self.oif == other.oif)
            && (other.iif == 0 || self.iif == other.iif)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dst_string())?;
        if self.oif != 0 {
            write!(f, " oif {}", self.oif)?;
        }
        if self.iif != 0 {
            write!(f, " iif {}", self.iif)?;
        }
        Ok(())
    }
}

fn parse_dst(dst: &str) -> Result<(Option<IpAddr>, u8)> {
    if dst == "default" {
        return Ok((None, 0));
    }
    let (ip, len) = parse_prefix(dst)?;
    if len == 0 {
        return Ok((None, 0));
    }
    Ok((Some(ip), len))
}

/// Effective table of a route message.
pub fn route_table(body: &Body) -> u32 {
    body.attr_u32("RTA_TABLE")
        .unwrap_or(body.field_or_zero("table") as u32)
}

/// Identity of a route message.
pub fn route_key(body: &Body) -> RouteKey {
    let dst_len = body.field_or_zero("dst_len") as u8;
    RouteKey {
        dst: body.attr_ip("RTA_DST").filter(|_| dst_len > 0),
        dst_len,
        oif: body.attr_u32("RTA_OIF").unwrap_or(0),
        iif: body.attr_u32("RTA_IIF").unwrap_or(0),
    }
}

/// Flatten a route message into database fields.
pub fn route_fields(body: &Body) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    for (spec, v) in body.schema.fields.iter().zip(&body.fields) {
        fields.insert(spec.name.to_string(), Value::from(*v));
    }
    for a in &body.attrs {
        match &a.value {
            AttrValue::Nested(metrics) if a.name == "RTA_METRICS" => {
                for m in metrics {
                    if let Some(v) = Value::from_attr(&m.value) {
                        fields.insert(key_of(m.name, "RTAX_"), v);
                    }
                }
            }
            value => {
                if let Some(v) = Value::from_attr(value) {
                    fields.insert(key_of(a.name, "RTA_"), v);
                }
            }
        }
    }
    fields.insert("dst".into(), Value::from(route_key(body).dst_string()));
    fields.insert("table".into(), Value::from(route_table(body)));
    fields
}

/// One leg of a multipath route.
#[derive(Debug, Clone, PartialEq)]
pub struct NextHop {
    pub gateway: Option<IpAddr>,
    pub oif: u32,
    /// Relative weight, 1 when unset.
    pub weight: u8,
}

/// Builder for RTM_NEWROUTE / RTM_DELROUTE.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    body: Body,
    family: Option<u8>,
    dst: Option<IpAddr>,
    table: u32,
    protocol: Option<u8>,
    scope: Option<u8>,
    kind: Option<u8>,
    metrics: Vec<Attribute>,
    multipath: Vec<NextHop>,
}

impl Default for RouteRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRequest {
    pub fn new() -> Self {
        Self {
            body: Body::new(&RTMSG),
            family: None,
            dst: None,
            table: RT_TABLE_MAIN,
            protocol: None,
            scope: None,
            kind: None,
            metrics: Vec::new(),
            multipath: Vec::new(),
        }
    }

    /// A request for `"default"` or `"addr/len"`.
    pub fn to(dst: &str) -> Result<Self> {
        let mut req = Self::new();
        req.set("dst", dst)?;
        Ok(req)
    }

    pub fn table(&self) -> u32 {
        self.table
    }

    pub fn key(&self) -> RouteKey {
        RouteKey {
            dst: self.dst,
            dst_len: self.body.field_or_zero("dst_len") as u8,
            oif: self.body.attr_u32("RTA_OIF").unwrap_or(0),
            iif: self.body.attr_u32("RTA_IIF").unwrap_or(0),
        }
    }

    pub fn nexthop(&mut self, hop: NextHop) -> &mut Self {
        self.multipath.push(hop);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let value = value.into();
        let byte = |v: &Value| -> Result<u8> {
            v.as_int()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| Error::InvalidAttribute(format!("{key}: {v}")))
        };
        match key {
            "dst" => {
                let (dst, len) = parse_dst(&value.to_string())?;
                self.dst = dst;
                self.body.set_field("dst_len", len as u64)?;
                if let Some(dst) = dst {
                    self.family.get_or_insert(family_of(&dst));
                }
            }
            "dst_len" => {
                self.body.set_field("dst_len", byte(&value)? as u64)?;
            }
            "family" => self.family = Some(byte(&value)?),
            "table" => {
                self.table = value
                    .as_u32()
                    .ok_or_else(|| Error::InvalidAttribute(format!("table: {value}")))?;
            }
            "protocol" | "proto" => self.protocol = Some(byte(&value)?),
            "scope" => self.scope = Some(byte(&value)?),
            "type" => self.kind = Some(byte(&value)?),
            "src_len" | "tos" | "flags" => {
                let v = value
                    .as_u32()
                    .ok_or_else(|| Error::InvalidAttribute(format!("{key}: {value}")))?;
                self.body.set_field(key, v as u64)?;
            }
            _ => {
                if let Some(spec) = spec_for_key(&RTA_ATTRS, "RTA_", key, false)
                    .filter(|s| !matches!(s.kind, K::Nested(_) | K::NestedList(_) | K::Record(_) | K::Hex))
                {
                    if let Some(v) = attr_value(spec, &value)? {
                        if let AttrValue::Ip(ip) = &v {
                            self.family.get_or_insert(family_of(ip));
                        }
                        self.body.set_attr(spec.name, v)?;
                    }
                } else if let Some(spec) = spec_for_key(&RTAX_ATTRS, "RTAX_", key, false) {
                    if let Some(v) = attr_value(spec, &value)? {
                        let metric = Attribute::named(&RTAX_ATTRS, spec.name, v)?;
                        match self.metrics.iter_mut().find(|m| m.id == metric.id) {
                            Some(slot) => *slot = metric,
                            None => self.metrics.push(metric),
                        }
                    }
                } else {
                    return Err(Error::InvalidAttribute(format!(
                        "routes have no attribute {key}"
                    )));
                }
            }
        }
        Ok(self)
    }

    pub fn build(&self, msg_type: u16, flags: u16) -> Result<Message> {
        let deleting = msg_type == NlMsgType::RTM_DELROUTE;
        let mut msg = Message {
            header: NlMsgHdr::new(msg_type, flags),
            body: Body::new(&RTMSG),
        };
        msg.fields.clone_from(&self.body.fields);

        let family = self.family.unwrap_or(AF_INET);
        msg.set_field("family", family as u64)?;

        let table = if self.table < 256 {
            self.table as u8
        } else {
            RT_TABLE_UNSPEC
        };
        msg.set_field("table", table as u64)?;

        let protocol = self
            .protocol
            .unwrap_or(if deleting { 0 } else { RTPROT_BOOT });
        msg.set_field("protocol", protocol as u64)?;

        let has_gateway = self.body.get_attr("RTA_GATEWAY").is_some() || !self.multipath.is_empty();
        let scope = self.scope.unwrap_or(if deleting {
            RT_SCOPE_NOWHERE
        } else if has_gateway {
            RT_SCOPE_UNIVERSE
        } else {
            RT_SCOPE_LINK
        });
        msg.set_field("scope", scope as u64)?;

        let kind = self.kind.unwrap_or(if deleting { 0 } else { RTN_UNICAST });
        msg.set_field("type", kind as u64)?;

        if let Some(dst) = self.dst {
            msg.push("RTA_DST", AttrValue::Ip(dst))?;
        }
        msg.attrs.extend(self.body.attrs.iter().cloned());
        if self.table >= 256 {
            msg.push("RTA_TABLE", AttrValue::U32(self.table))?;
        }
        if !self.metrics.is_empty() {
            msg.push("RTA_METRICS", AttrValue::Nested(self.metrics.clone()))?;
        }
        if !self.multipath.is_empty() {
            let mut hops = Vec::with_capacity(self.multipath.len());
            for hop in &self.multipath {
                let mut body = Body::new(&RTNEXTHOP);
                body.set_field("hops", hop.weight.saturating_sub(1) as u64)?;
                body.set_field("ifindex", hop.oif as u64)?;
                if let Some(gw) = hop.gateway {
                    body.push("RTA_GATEWAY", AttrValue::Ip(gw))?;
                }
                hops.push(body);
            }
            msg.push("RTA_MULTIPATH", AttrValue::List(hops))?;
        }
        Ok(msg)
    }
}

impl Connection {
    /// Dump routes of every family and table.
    pub async fn get_routes(&self) -> Result<Vec<Message>> {
        self.dump(Message::new(&RTMSG, NlMsgType::RTM_GETROUTE, 0))
            .await
    }

    /// Add a route; `replace` overwrites an existing one.
    pub async fn add_route(&self, req: &RouteRequest, replace: bool) -> Result<()> {
        let flags = if replace {
            NLM_F_CREATE | NLM_F_REPLACE
        } else {
            NLM_F_CREATE | NLM_F_EXCL
        };
        let msg = req.build(NlMsgType::RTM_NEWROUTE, flags)?;
        self.request(msg)
            .await
            .map_err(|e| e.with_context(format!("adding route {}", req.key())))?;
        Ok(())
    }

    /// Delete a route.
    pub async fn del_route(&self, req: &RouteRequest) -> Result<()> {
        let msg = req.build(NlMsgType::RTM_DELROUTE, 0)?;
        self.request(msg)
            .await
            .map_err(|e| e.with_context(format!("deleting route {}", req.key())))?;
        Ok(())
    }
}
