//! Policy routing rules: `fib_rule_hdr` and `FRA_*`.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::netlink::codec::{AttrValue, Body, Message};
use crate::netlink::connection::Connection;
use crate::netlink::message::{NLM_F_CREATE, NLM_F_EXCL, NlMsgHdr, NlMsgType};
use crate::netlink::schema::{AttrKind as K, AttrSchema, FieldKind as F, MessageSchema, attr, field};
use crate::netlink::{Error, Result};
use crate::value::Value;

use super::route::RT_TABLE_MAIN;
use super::{AF_INET, family_of, key_of, parse_prefix};

/// Rule actions (`FR_ACT_*`).
pub mod action {
    pub const TO_TBL: u8 = 1;
    pub const GOTO: u8 = 2;
    pub const NOP: u8 = 3;
    pub const BLACKHOLE: u8 = 6;
    pub const UNREACHABLE: u8 = 7;
    pub const PROHIBIT: u8 = 8;

    pub fn by_name(name: &str) -> Option<u8> {
        Some(match name {
            "lookup" | "table" | "to_tbl" => TO_TBL,
            "goto" => GOTO,
            "nop" => NOP,
            "blackhole" => BLACKHOLE,
            "unreachable" => UNREACHABLE,
            "prohibit" => PROHIBIT,
            _ => return None,
        })
    }
}

pub static FRA_ATTRS: AttrSchema = AttrSchema {
    name: "fra",
    attrs: &[
        attr(1, "FRA_DST", K::Ip),
        attr(2, "FRA_SRC", K::Ip),
        attr(3, "FRA_IIFNAME", K::AsciiZ),
        attr(4, "FRA_GOTO", K::U32),
        attr(6, "FRA_PRIORITY", K::U32),
        attr(10, "FRA_FWMARK", K::U32),
        attr(11, "FRA_FLOW", K::U32),
        attr(12, "FRA_TUN_ID", K::Hex),
        attr(13, "FRA_SUPPRESS_IFGROUP", K::U32),
        attr(14, "FRA_SUPPRESS_PREFIXLEN", K::U32),
        attr(15, "FRA_TABLE", K::U32),
        attr(16, "FRA_FWMASK", K::U32),
        attr(17, "FRA_OIFNAME", K::AsciiZ),
        attr(18, "FRA_PAD", K::Hex),
        attr(19, "FRA_L3MDEV", K::U8),
        attr(20, "FRA_UID_RANGE", K::Hex),
        attr(21, "FRA_PROTOCOL", K::U8),
        attr(22, "FRA_IP_PROTO", K::U8),
        attr(23, "FRA_SPORT_RANGE", K::Hex),
        attr(24, "FRA_DPORT_RANGE", K::Hex),
    ],
};

/// `struct fib_rule_hdr` followed by `FRA_*`.
pub static FIB_RULE_HDR: MessageSchema = MessageSchema {
    name: "fib_rule_hdr",
    fields: &[
        field("family", F::U8),
        field("dst_len", F::U8),
        field("src_len", F::U8),
        field("tos", F::U8),
        field("table", F::U8),
        field("res1", F::U8),
        field("res2", F::U8),
        field("action", F::U8),
        field("flags", F::U32),
    ],
    attrs: &FRA_ATTRS,
    opaque_tail: false,
    self_sized: false,
};

/// Flatten a rule message into database fields.
///
/// `table` is the effective table, `src`/`dst` carry their prefix.
pub fn rule_fields(body: &Body) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    for (spec, v) in body.schema.fields.iter().zip(&body.fields) {
        if !spec.name.starts_with("res") {
            fields.insert(spec.name.to_string(), Value::from(*v));
        }
    }
    for a in &body.attrs {
        let key = key_of(a.name, "FRA_");
        let value = match (&a.value, key.as_str()) {
            (AttrValue::Ip(ip), "src") => {
                Some(Value::from(format!("{ip}/{}", body.field_or_zero("src_len"))))
            }
            (AttrValue::Ip(ip), "dst") => {
                Some(Value::from(format!("{ip}/{}", body.field_or_zero("dst_len"))))
            }
            (value, _) => Value::from_attr(value),
        };
        if let Some(v) = value {
            fields.insert(key, v);
        }
    }
    if let Some(table) = body.attr_u32("FRA_TABLE") {
        fields.insert("table".into(), Value::from(table));
    }
    fields
}

/// Builder for RTM_NEWRULE / RTM_DELRULE.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRequest {
    family: Option<u8>,
    table: u32,
    priority: Option<u32>,
    action: u8,
    src: Option<(IpAddr, u8)>,
    dst: Option<(IpAddr, u8)>,
    fwmark: Option<u32>,
    fwmask: Option<u32>,
    iifname: Option<String>,
    oifname: Option<String>,
    goto: Option<u32>,
    ip_proto: Option<u8>,
}

impl Default for RuleRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleRequest {
    /// A `lookup main` rule of unspecified family.
    pub fn new() -> Self {
        Self {
            family: None,
            table: RT_TABLE_MAIN,
            priority: None,
            action: action::TO_TBL,
            src: None,
            dst: None,
            fwmark: None,
            fwmask: None,
            iifname: None,
            oifname: None,
            goto: None,
            ip_proto: None,
        }
    }

    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    pub fn table(&self) -> u32 {
        self.table
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let value = value.into();
        let invalid = || Error::InvalidAttribute(format!("{key}: {value}"));
        let num = |v: &Value| v.as_u32().ok_or_else(invalid);
        match key {
            "family" => self.family = Some(u8::try_from(num(&value)?).map_err(|_| invalid())?),
            "table" => self.table = num(&value)?,
            "priority" | "prio" => self.priority = Some(num(&value)?),
            "action" => {
                self.action = match value.as_str().and_then(action::by_name) {
                    Some(a) => a,
                    None => u8::try_from(num(&value)?).map_err(|_| invalid())?,
                };
            }
            "src" | "dst" => {
                let prefix = parse_prefix(&value.to_string())?;
                self.family.get_or_insert(family_of(&prefix.0));
                if key == "src" {
                    self.src = Some(prefix);
                } else {
                    self.dst = Some(prefix);
                }
            }
            "fwmark" => self.fwmark = Some(num(&value)?),
            "fwmask" => self.fwmask = Some(num(&value)?),
            "iifname" | "iif" => self.iifname = Some(value.to_string()),
            "oifname" | "oif" => self.oifname = Some(value.to_string()),
            "goto" => {
                self.goto = Some(num(&value)?);
                self.action = action::GOTO;
            }
            "ip_proto" => self.ip_proto = Some(u8::try_from(num(&value)?).map_err(|_| invalid())?),
            _ => {
                return Err(Error::InvalidAttribute(format!(
                    "rules have no attribute {key}"
                )));
            }
        }
        Ok(self)
    }

    pub fn build(&self, msg_type: u16, flags: u16) -> Result<Message> {
        let mut msg = Message {
            header: NlMsgHdr::new(msg_type, flags),
            body: Body::new(&FIB_RULE_HDR),
        };
        msg.set_field("family", self.family.unwrap_or(AF_INET) as u64)?;
        msg.set_field("action", self.action as u64)?;
        let table = if self.table < 256 { self.table } else { 0 };
        msg.set_field("table", table as u64)?;

        if let Some(prio) = self.priority {
            msg.push("FRA_PRIORITY", AttrValue::U32(prio))?;
        }
        if let Some((ip, len)) = self.src {
            msg.set_field("src_len", len as u64)?;
            msg.push("FRA_SRC", AttrValue::Ip(ip))?;
        }
        if let Some((ip, len)) = self.dst {
            msg.set_field("dst_len", len as u64)?;
            msg.push("FRA_DST", AttrValue::Ip(ip))?;
        }
        if let Some(name) = &self.iifname {
            msg.push("FRA_IIFNAME", AttrValue::Str(name.clone()))?;
        }
        if let Some(name) = &self.oifname {
            msg.push("FRA_OIFNAME", AttrValue::Str(name.clone()))?;
        }
        if let Some(mark) = self.fwmark {
            msg.push("FRA_FWMARK", AttrValue::U32(mark))?;
            if let Some(mask) = self.fwmask {
                msg.push("FRA_FWMASK", AttrValue::U32(mask))?;
            }
        }
        if let Some(target) = self.goto {
            msg.push("FRA_GOTO", AttrValue::U32(target))?;
        }
        if self.table >= 256 {
            msg.push("FRA_TABLE", AttrValue::U32(self.table))?;
        }
        if let Some(proto) = self.ip_proto {
            msg.push("FRA_IP_PROTO", AttrValue::U8(proto))?;
        }
        Ok(msg)
    }
}

impl Connection {
    /// Dump the rules of every family.
    pub async fn get_rules(&self) -> Result<Vec<Message>> {
        self.dump(Message::new(&FIB_RULE_HDR, NlMsgType::RTM_GETRULE, 0))
            .await
    }

    pub async fn add_rule(&self, req: &RuleRequest) -> Result<()> {
        let msg = req.build(NlMsgType::RTM_NEWRULE, NLM_F_CREATE | NLM_F_EXCL)?;
        self.request(msg)
            .await
            .map_err(|e| e.with_context(format!("adding rule to table {}", req.table)))?;
        Ok(())
    }

    pub async fn del_rule(&self, req: &RuleRequest) -> Result<()> {
        let msg = req.build(NlMsgType::RTM_DELRULE, 0)?;
        self.request(msg)
            .await
            .map_err(|e| e.with_context(format!("deleting rule from table {}", req.table)))?;
        Ok(())
    }
}
