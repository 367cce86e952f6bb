//! Schema-driven encoder and decoder for netlink messages.
//!
//! Decoding walks the registry schema for the message type. Attributes the
//! schema does not know are kept as [`AttrValue::Unknown`] together with
//! their flag bits, and known attributes whose payload does not fit their
//! declared kind fall back to [`AttrValue::Bytes`]. Either way, encoding a
//! decoded message reproduces the input byte for byte.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::{Deref, DerefMut};

use serde_json::{Map, Value as Json, json};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take;

use super::attr::{NLA_F_NESTED, NLA_HDRLEN, NLA_TYPE_MASK, nla_align};
use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::message::{MessageIter, NLMSG_HDRLEN, NlMsgHdr, NlMsgType, nlmsg_align};
use super::schema::{AttrKind, AttrSchema, FieldKind, MessageSchema, RecordSpec, Registry};

/// Result type for winnow parsers.
type PResult<T> = std::result::Result<T, ErrMode<ContextError>>;

/// Name given to attributes whose id is not in the schema.
pub const UNKNOWN_ATTR: &str = "UNKNOWN";

/// A decoded fixed-layout struct.
#[derive(Debug, Clone)]
pub struct Record {
    pub spec: &'static RecordSpec,
    pub values: Vec<u64>,
}

impl Record {
    /// A zeroed record.
    pub fn new(spec: &'static RecordSpec) -> Self {
        Self {
            spec,
            values: vec![0; spec.fields.len()],
        }
    }

    /// Get a field by name.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.spec.position(name).and_then(|i| self.values.get(i).copied())
    }

    /// Set a field by name.
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        let i = self.spec.position(name).ok_or_else(|| {
            Error::InvalidAttribute(format!("{} has no field {name}", self.spec.name))
        })?;
        self.values[i] = value;
        Ok(())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.spec.size());
        for (f, v) in self.spec.fields.iter().zip(&self.values) {
            write_field(&mut buf, f.kind, *v);
        }
        buf
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.spec.name == other.spec.name && self.values == other.values
    }
}

/// Attribute payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    U16Be(u16),
    U32Be(u32),
    Str(String),
    Bytes(Vec<u8>),
    Hex(Vec<u8>),
    Ip(IpAddr),
    LlAddr([u8; 6]),
    Flag,
    Nested(Vec<Attribute>),
    Message(Box<Body>),
    List(Vec<Body>),
    Record(Record),
    Unknown(Vec<u8>),
}

impl AttrValue {
    /// Numeric view of integer payloads.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::U8(v) => Some(*v as u64),
            AttrValue::U16(v) | AttrValue::U16Be(v) => Some(*v as u64),
            AttrValue::U32(v) | AttrValue::U32Be(v) => Some(*v as u64),
            AttrValue::U64(v) => Some(*v),
            AttrValue::I32(v) => Some(*v as u32 as u64),
            _ => None,
        }
    }

    /// String view; binary payloads are cut at the first NUL.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            AttrValue::Bytes(b) => {
                let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
                std::str::from_utf8(&b[..end]).ok()
            }
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            AttrValue::Ip(ip) => Some(*ip),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&[Attribute]> {
        match self {
            AttrValue::Nested(attrs) => Some(attrs),
            _ => None,
        }
    }

    pub fn as_body(&self) -> Option<&Body> {
        match self {
            AttrValue::Message(body) => Some(body),
            _ => None,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            AttrValue::U8(v) => vec![*v],
            AttrValue::U16(v) => v.to_ne_bytes().to_vec(),
            AttrValue::U32(v) => v.to_ne_bytes().to_vec(),
            AttrValue::U64(v) => v.to_ne_bytes().to_vec(),
            AttrValue::I32(v) => v.to_ne_bytes().to_vec(),
            AttrValue::U16Be(v) => v.to_be_bytes().to_vec(),
            AttrValue::U32Be(v) => v.to_be_bytes().to_vec(),
            AttrValue::Str(s) => {
                let mut data = s.as_bytes().to_vec();
                data.push(0);
                data
            }
            AttrValue::Bytes(b) | AttrValue::Hex(b) | AttrValue::Unknown(b) => b.clone(),
            AttrValue::Ip(IpAddr::V4(ip)) => ip.octets().to_vec(),
            AttrValue::Ip(IpAddr::V6(ip)) => ip.octets().to_vec(),
            AttrValue::LlAddr(mac) => mac.to_vec(),
            AttrValue::Flag => Vec::new(),
            AttrValue::Record(r) => r.to_bytes(),
            // Container values are written through the builder.
            AttrValue::Nested(_) | AttrValue::Message(_) | AttrValue::List(_) => Vec::new(),
        }
    }

    /// JSON rendering used by database dumps.
    pub fn to_json(&self) -> Json {
        match self {
            AttrValue::U8(_)
            | AttrValue::U16(_)
            | AttrValue::U32(_)
            | AttrValue::U64(_)
            | AttrValue::U16Be(_)
            | AttrValue::U32Be(_) => json!(self.as_u64()),
            AttrValue::I32(v) => json!(v),
            AttrValue::Str(s) => json!(s),
            AttrValue::Bytes(b) | AttrValue::Hex(b) | AttrValue::Unknown(b) => json!(hex(b)),
            AttrValue::Ip(ip) => json!(ip.to_string()),
            AttrValue::LlAddr(mac) => json!(format_lladdr(mac)),
            AttrValue::Flag => json!(true),
            AttrValue::Nested(attrs) => attrs_to_json(attrs),
            AttrValue::Message(body) => body.to_json(),
            AttrValue::List(bodies) => Json::Array(bodies.iter().map(Body::to_json).collect()),
            AttrValue::Record(r) => {
                let mut map = Map::new();
                for (f, v) in r.spec.fields.iter().zip(&r.values) {
                    map.insert(f.name.to_string(), json!(v));
                }
                Json::Object(map)
            }
        }
    }
}

/// A single decoded attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub id: u16,
    /// `NLA_F_NESTED` / `NLA_F_NET_BYTEORDER` bits as seen on the wire.
    pub flags: u16,
    pub name: &'static str,
    pub value: AttrValue,
}

impl Attribute {
    /// Build an attribute by name from a schema.
    ///
    /// Nested sets get `NLA_F_NESTED`, matching what `nla_nest_start` does.
    pub fn named(schema: &AttrSchema, name: &str, value: AttrValue) -> Result<Self> {
        let spec = schema.by_name(name).ok_or_else(|| {
            Error::InvalidAttribute(format!("{} has no attribute {name}", schema.name))
        })?;
        let flags = if matches!(value, AttrValue::Nested(_)) {
            NLA_F_NESTED
        } else {
            0
        };
        Ok(Self {
            id: spec.id,
            flags,
            name: spec.name,
            value,
        })
    }
}

/// Find the first attribute with a given name.
pub fn find<'a>(attrs: &'a [Attribute], name: &str) -> Option<&'a AttrValue> {
    attrs.iter().find(|a| a.name == name).map(|a| &a.value)
}

fn attrs_to_json(attrs: &[Attribute]) -> Json {
    Json::Array(
        attrs
            .iter()
            .map(|a| json!([a.name, a.value.to_json()]))
            .collect(),
    )
}

/// A message body: fixed fields, attributes, opaque tail.
#[derive(Debug, Clone)]
pub struct Body {
    pub schema: &'static MessageSchema,
    pub fields: Vec<u64>,
    pub attrs: Vec<Attribute>,
    pub trailer: Vec<u8>,
}

impl PartialEq for Body {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name == other.schema.name
            && self.fields == other.fields
            && self.attrs == other.attrs
            && self.trailer == other.trailer
    }
}

impl Body {
    /// An empty body with zeroed fixed fields.
    pub fn new(schema: &'static MessageSchema) -> Self {
        Self {
            schema,
            fields: vec![0; schema.fields.len()],
            attrs: Vec::new(),
            trailer: Vec::new(),
        }
    }

    /// Get a fixed field by name.
    pub fn field(&self, name: &str) -> Option<u64> {
        self.schema
            .position(name)
            .and_then(|i| self.fields.get(i).copied())
    }

    /// Get a fixed field, zero when absent.
    pub fn field_or_zero(&self, name: &str) -> u64 {
        self.field(name).unwrap_or(0)
    }

    /// Set a fixed field by name.
    pub fn set_field(&mut self, name: &str, value: u64) -> Result<()> {
        let i = self.schema.position(name).ok_or_else(|| {
            Error::InvalidAttribute(format!("{} has no field {name}", self.schema.name))
        })?;
        self.fields[i] = value;
        Ok(())
    }

    /// First attribute with the given name.
    pub fn get_attr(&self, name: &str) -> Option<&AttrValue> {
        find(&self.attrs, name)
    }

    /// Walk nested attribute sets by name.
    pub fn get_nested(&self, path: &[&str]) -> Option<&AttrValue> {
        let (first, rest) = path.split_first()?;
        let mut current = self.get_attr(first)?;
        for name in rest {
            current = find(current.as_nested()?, name)?;
        }
        Some(current)
    }

    /// Integer attribute.
    pub fn attr_u32(&self, name: &str) -> Option<u32> {
        self.get_attr(name)?.as_u64().map(|v| v as u32)
    }

    /// String attribute.
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.get_attr(name)?.as_str()
    }

    /// Address attribute.
    pub fn attr_ip(&self, name: &str) -> Option<IpAddr> {
        self.get_attr(name)?.as_ip()
    }

    /// Append an attribute by name.
    pub fn push(&mut self, name: &str, value: AttrValue) -> Result<()> {
        let attr = Attribute::named(self.schema.attrs, name, value)?;
        self.attrs.push(attr);
        Ok(())
    }

    /// Replace the first attribute with this name, or append it.
    pub fn set_attr(&mut self, name: &str, value: AttrValue) -> Result<()> {
        let attr = Attribute::named(self.schema.attrs, name, value)?;
        match self.attrs.iter_mut().find(|a| a.name == attr.name) {
            Some(slot) => *slot = attr,
            None => self.attrs.push(attr),
        }
        Ok(())
    }

    /// Remove every attribute with this name.
    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|a| a.name != name);
    }

    /// JSON rendering used by database dumps.
    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        for (f, v) in self.schema.fields.iter().zip(&self.fields) {
            map.insert(f.name.to_string(), json!(v));
        }
        map.insert("attrs".into(), attrs_to_json(&self.attrs));
        Json::Object(map)
    }

    fn write(&self, b: &mut MessageBuilder) {
        let record = self.schema.self_sized.then(|| b.record_start());
        let mut fixed = Vec::with_capacity(self.schema.header_len());
        for (i, f) in self.schema.fields.iter().enumerate() {
            write_field(&mut fixed, f.kind, self.fields.get(i).copied().unwrap_or(0));
        }
        b.append_raw(&fixed);
        b.align();
        for attr in &self.attrs {
            write_attr(b, attr);
        }
        b.append_raw(&self.trailer);
        if let Some(token) = record {
            b.record_end(token);
        }
    }
}

fn write_field(buf: &mut Vec<u8>, kind: FieldKind, v: u64) {
    match kind {
        FieldKind::U8 => buf.push(v as u8),
        FieldKind::U16 => buf.extend_from_slice(&(v as u16).to_ne_bytes()),
        FieldKind::U32 | FieldKind::I32 => buf.extend_from_slice(&(v as u32).to_ne_bytes()),
        FieldKind::U64 => buf.extend_from_slice(&v.to_ne_bytes()),
    }
}

fn write_attr(b: &mut MessageBuilder, attr: &Attribute) {
    let ty = attr.id | attr.flags;
    match &attr.value {
        AttrValue::Nested(children) => {
            let token = b.nest_start(ty);
            for child in children {
                write_attr(b, child);
            }
            b.nest_end(token);
        }
        AttrValue::Message(body) => {
            let token = b.nest_start(ty);
            body.write(b);
            b.nest_end(token);
        }
        AttrValue::List(bodies) => {
            let token = b.nest_start(ty);
            for body in bodies {
                body.write(b);
            }
            b.nest_end(token);
        }
        other => b.append_attr(ty, &other.payload()),
    }
}

/// A complete netlink message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: NlMsgHdr,
    pub body: Body,
}

impl Deref for Message {
    type Target = Body;

    fn deref(&self) -> &Body {
        &self.body
    }
}

impl DerefMut for Message {
    fn deref_mut(&mut self) -> &mut Body {
        &mut self.body
    }
}

impl Message {
    /// An empty message of the given type.
    pub fn new(schema: &'static MessageSchema, msg_type: u16, flags: u16) -> Self {
        Self {
            header: NlMsgHdr::new(msg_type, flags),
            body: Body::new(schema),
        }
    }

    /// An `NLMSG_ERROR` carrying `errno` (0 for an ACK) and the echoed request.
    pub fn error(errno: i32, request: &Message) -> Self {
        let echo = request.encode();
        let mut body = Body::new(&super::schema::ERROR_SCHEMA);
        body.fields[0] = (-errno.saturating_abs()) as u32 as u64;
        body.trailer = echo;
        let mut header = NlMsgHdr::new(NlMsgType::ERROR, 0);
        header.nlmsg_seq = request.header.nlmsg_seq;
        header.nlmsg_pid = request.header.nlmsg_pid;
        Self { header, body }
    }

    /// An `NLMSG_DONE` terminating a dump.
    pub fn done(seq: u32, pid: u32) -> Self {
        let mut body = Body::new(&super::schema::OPAQUE_SCHEMA);
        body.trailer = 0i32.to_ne_bytes().to_vec();
        let mut header = NlMsgHdr::new(NlMsgType::DONE, super::message::NLM_F_MULTI);
        header.nlmsg_seq = seq;
        header.nlmsg_pid = pid;
        Self { header, body }
    }

    pub fn msg_type(&self) -> u16 {
        self.header.nlmsg_type
    }

    pub fn seq(&self) -> u32 {
        self.header.nlmsg_seq
    }

    /// Error code of an `NLMSG_ERROR` (negative errno, 0 for ACK).
    pub fn error_code(&self) -> Option<i32> {
        if self.header.is_error() {
            self.body.fields.first().map(|v| *v as u32 as i32)
        } else {
            None
        }
    }

    /// Serialize, back-patching every length.
    ///
    /// Lengths that overflow are clamped; use [`try_encode`](Self::try_encode)
    /// for anything bound for a socket.
    pub fn encode(&self) -> Vec<u8> {
        self.builder().finish()
    }

    /// Serialize, failing when an attribute does not fit its length field.
    pub fn try_encode(&self) -> Result<Vec<u8>> {
        self.builder().try_finish()
    }

    fn builder(&self) -> MessageBuilder {
        let mut b = MessageBuilder::with_header(self.header);
        self.body.write(&mut b);
        b
    }

    /// Decode one message from the start of `data`.
    pub fn decode(data: &[u8], registry: &Registry) -> Result<Self> {
        let header = *NlMsgHdr::from_bytes(data)
            .map_err(|_| Error::MalformedMessage(format!("{} bytes hold no header", data.len())))?;
        let len = header.nlmsg_len as usize;
        if len < NLMSG_HDRLEN || len > data.len() {
            return Err(Error::MalformedMessage(format!(
                "declared length {len} exceeds buffer of {}",
                data.len()
            )));
        }
        let schema = registry.schema(header.nlmsg_type);
        let body = decode_body(&data[NLMSG_HDRLEN..len], schema)?;
        Ok(Self { header, body })
    }

    /// Decode every message in a datagram.
    pub fn decode_all(data: &[u8], registry: &Registry) -> Result<Vec<Self>> {
        MessageIter::new(data)
            .map(|raw| Self::decode(raw?, registry))
            .collect()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(type={}, seq={}, flags={:#x})",
            self.body.schema.name,
            self.header.nlmsg_type,
            self.header.nlmsg_seq,
            self.header.nlmsg_flags
        )
    }
}

fn malformed(what: impl fmt::Display) -> Error {
    Error::MalformedMessage(what.to_string())
}

fn take_n<'a>(input: &mut &'a [u8], n: usize) -> PResult<&'a [u8]> {
    take(n).parse_next(input)
}

fn parse_field(input: &mut &[u8], kind: FieldKind) -> PResult<u64> {
    let bytes = take_n(input, kind.size())?;
    Ok(match kind {
        FieldKind::U8 => bytes[0] as u64,
        FieldKind::U16 => u16::from_ne_bytes([bytes[0], bytes[1]]) as u64,
        FieldKind::U32 | FieldKind::I32 => {
            u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
        }
        FieldKind::U64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            u64::from_ne_bytes(raw)
        }
    })
}

fn decode_body(data: &[u8], schema: &'static MessageSchema) -> Result<Body> {
    let mut input = data;
    let mut fields = Vec::with_capacity(schema.fields.len());
    for f in schema.fields {
        let v = parse_field(&mut input, f.kind).map_err(|_| {
            malformed(format_args!(
                "{} header needs {} bytes, got {}",
                schema.name,
                schema.header_len(),
                data.len()
            ))
        })?;
        fields.push(v);
    }

    if schema.opaque_tail {
        return Ok(Body {
            schema,
            fields,
            attrs: Vec::new(),
            trailer: input.to_vec(),
        });
    }

    let pad = nlmsg_align(schema.header_len()) - schema.header_len();
    let skip = pad.min(input.len());
    if skip > 0 {
        let _ = take_n(&mut input, skip);
    }
    let attrs = decode_attrs(input, schema.attrs)?;
    Ok(Body {
        schema,
        fields,
        attrs,
        trailer: Vec::new(),
    })
}

/// Read one attribute header and payload, returning `(type, payload)`.
fn parse_attr<'a>(input: &mut &'a [u8]) -> Result<(u16, &'a [u8])> {
    let available = input.len();
    let hdr = take_n(input, NLA_HDRLEN)
        .map_err(|_| malformed(format_args!("{available} dangling bytes after attributes")))?;
    let len = u16::from_ne_bytes([hdr[0], hdr[1]]) as usize;
    let ty = u16::from_ne_bytes([hdr[2], hdr[3]]);
    if len < NLA_HDRLEN {
        return Err(malformed(format_args!("attribute {ty} with length {len}")));
    }
    let payload = take_n(input, len - NLA_HDRLEN).map_err(|_| {
        malformed(format_args!(
            "attribute {} declares {len} bytes, {available} available",
            ty & NLA_TYPE_MASK
        ))
    })?;
    let pad = nla_align(len) - len;
    if pad > 0 && !input.is_empty() {
        take_n(input, pad).map_err(|_| {
            malformed(format_args!(
                "attribute {} lacks alignment padding",
                ty & NLA_TYPE_MASK
            ))
        })?;
    }
    Ok((ty, payload))
}

fn decode_attrs(data: &[u8], schema: &'static AttrSchema) -> Result<Vec<Attribute>> {
    let mut input = data;
    let mut out: Vec<Attribute> = Vec::new();
    while !input.is_empty() {
        let (ty, payload) = parse_attr(&mut input)?;
        let id = ty & NLA_TYPE_MASK;
        let flags = ty & !NLA_TYPE_MASK;
        let attr = match schema.by_id(id) {
            Some(spec) => Attribute {
                id,
                flags,
                name: spec.name,
                value: decode_value(spec.kind, payload, &out)
                    .map_err(|e| malformed(format_args!("{}.{}: {e}", schema.name, spec.name)))?,
            },
            None => Attribute {
                id,
                flags,
                name: UNKNOWN_ATTR,
                value: AttrValue::Unknown(payload.to_vec()),
            },
        };
        out.push(attr);
    }
    Ok(out)
}

fn fixed<const N: usize>(payload: &[u8]) -> Option<[u8; N]> {
    payload.try_into().ok()
}

fn decode_value(kind: AttrKind, payload: &[u8], siblings: &[Attribute]) -> Result<AttrValue> {
    let bytes = || AttrValue::Bytes(payload.to_vec());
    let value = match kind {
        AttrKind::U8 => fixed::<1>(payload).map_or_else(bytes, |b| AttrValue::U8(b[0])),
        AttrKind::U16 => {
            fixed::<2>(payload).map_or_else(bytes, |b| AttrValue::U16(u16::from_ne_bytes(b)))
        }
        AttrKind::U32 => {
            fixed::<4>(payload).map_or_else(bytes, |b| AttrValue::U32(u32::from_ne_bytes(b)))
        }
        AttrKind::U64 => {
            fixed::<8>(payload).map_or_else(bytes, |b| AttrValue::U64(u64::from_ne_bytes(b)))
        }
        AttrKind::I32 => {
            fixed::<4>(payload).map_or_else(bytes, |b| AttrValue::I32(i32::from_ne_bytes(b)))
        }
        AttrKind::U16Be => {
            fixed::<2>(payload).map_or_else(bytes, |b| AttrValue::U16Be(u16::from_be_bytes(b)))
        }
        AttrKind::U32Be => {
            fixed::<4>(payload).map_or_else(bytes, |b| AttrValue::U32Be(u32::from_be_bytes(b)))
        }
        AttrKind::AsciiZ => match payload.iter().position(|&c| c == 0) {
            Some(end) if end + 1 == payload.len() => std::str::from_utf8(&payload[..end])
                .map(|s| AttrValue::Str(s.to_string()))
                .unwrap_or_else(|_| bytes()),
            _ => bytes(),
        },
        AttrKind::Bytes => bytes(),
        AttrKind::Hex => AttrValue::Hex(payload.to_vec()),
        AttrKind::Ip => match payload.len() {
            4 => fixed::<4>(payload)
                .map_or_else(bytes, |b| AttrValue::Ip(IpAddr::V4(Ipv4Addr::from(b)))),
            16 => fixed::<16>(payload)
                .map_or_else(bytes, |b| AttrValue::Ip(IpAddr::V6(Ipv6Addr::from(b)))),
            _ => bytes(),
        },
        AttrKind::LlAddr => fixed::<6>(payload).map_or_else(bytes, AttrValue::LlAddr),
        AttrKind::Flag if payload.is_empty() => AttrValue::Flag,
        AttrKind::Flag => bytes(),
        AttrKind::Nested(schema) => AttrValue::Nested(decode_attrs(payload, schema)?),
        AttrKind::NestedMessage(schema) => AttrValue::Message(Box::new(decode_body(payload, schema)?)),
        AttrKind::NestedList(schema) => AttrValue::List(decode_list(payload, schema)?),
        AttrKind::Record(spec) => {
            if payload.len() == spec.size() {
                let mut input = payload;
                let mut values = Vec::with_capacity(spec.fields.len());
                for f in spec.fields {
                    values.push(
                        parse_field(&mut input, f.kind)
                            .map_err(|_| malformed(format_args!("short {} record", spec.name)))?,
                    );
                }
                AttrValue::Record(Record { spec, values })
            } else {
                bytes()
            }
        }
        AttrKind::ByKind(table) => {
            let selected = siblings
                .iter()
                .find(|a| a.id == table.selector)
                .and_then(|a| a.value.as_str())
                .and_then(|kind| table.resolve(kind));
            match selected {
                Some(kind) => decode_value(kind, payload, &[])?,
                None => AttrValue::Hex(payload.to_vec()),
            }
        }
    };
    Ok(value)
}

fn decode_list(data: &[u8], schema: &'static MessageSchema) -> Result<Vec<Body>> {
    let mut rest = data;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let len = fixed::<2>(rest.get(..2).unwrap_or(&[]))
            .map(|b| u16::from_ne_bytes(b) as usize)
            .ok_or_else(|| malformed(format_args!("{} record without length", schema.name)))?;
        if len < schema.header_len() || len > rest.len() {
            return Err(malformed(format_args!(
                "{} record of {len} bytes in {} byte list",
                schema.name,
                rest.len()
            )));
        }
        out.push(decode_body(&rest[..len], schema)?);
        rest = rest.get(nlmsg_align(len)..).unwrap_or(&[]);
    }
    Ok(out)
}

/// Render bytes as lowercase hex.
pub fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// Render a link-layer address as `aa:bb:cc:dd:ee:ff`.
pub fn format_lladdr(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a colon-separated link-layer address.
pub fn parse_lladdr(s: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for slot in mac.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| Error::Parse(format!("invalid link-layer address: {s}")))?;
        *slot = u8::from_str_radix(part, 16)
            .map_err(|_| Error::Parse(format!("invalid link-layer address: {s}")))?;
    }
    if parts.next().is_some() {
        return Err(Error::Parse(format!("invalid link-layer address: {s}")));
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::schema::{KindTable, attr, field};

    static DATA_A: AttrSchema = AttrSchema {
        name: "data_a",
        attrs: &[attr(1, "A_ID", AttrKind::U16)],
    };

    static KINDS: KindTable = KindTable {
        selector: 1,
        kinds: &[("a", AttrKind::Nested(&DATA_A))],
    };

    static INFO: AttrSchema = AttrSchema {
        name: "info",
        attrs: &[
            attr(1, "KIND", AttrKind::AsciiZ),
            attr(2, "DATA", AttrKind::ByKind(&KINDS)),
        ],
    };

    static HOP_ATTRS: AttrSchema = AttrSchema {
        name: "hop",
        attrs: &[attr(5, "GW", AttrKind::Ip)],
    };

    static HOP: MessageSchema = MessageSchema {
        name: "hop",
        fields: &[
            field("len", FieldKind::U16),
            field("flags", FieldKind::U8),
            field("hops", FieldKind::U8),
            field("ifindex", FieldKind::I32),
        ],
        attrs: &HOP_ATTRS,
        opaque_tail: false,
        self_sized: true,
    };

    static STATS: RecordSpec = RecordSpec {
        name: "stats",
        fields: &[field("packets", FieldKind::U32), field("bytes", FieldKind::U64)],
    };

    static TOP: AttrSchema = AttrSchema {
        name: "top",
        attrs: &[
            attr(1, "ADDR", AttrKind::LlAddr),
            attr(2, "IP", AttrKind::Ip),
            attr(3, "NAME", AttrKind::AsciiZ),
            attr(4, "MTU", AttrKind::U32),
            attr(5, "PORT", AttrKind::U16Be),
            attr(6, "INFO", AttrKind::Nested(&INFO)),
            attr(7, "HOPS", AttrKind::NestedList(&HOP)),
            attr(8, "STATS", AttrKind::Record(&STATS)),
            attr(9, "PEER", AttrKind::NestedMessage(&TEST_MSG)),
            attr(10, "FLAG", AttrKind::Flag),
        ],
    };

    static TEST_MSG: MessageSchema = MessageSchema {
        name: "test",
        fields: &[
            field("family", FieldKind::U8),
            field("pad", FieldKind::U8),
            field("type", FieldKind::U16),
            field("index", FieldKind::I32),
        ],
        attrs: &TOP,
        opaque_tail: false,
        self_sized: false,
    };

    static REGISTRY: Registry = Registry {
        protocol: "test",
        messages: &[(100, &TEST_MSG)],
    };

    fn sample() -> Message {
        let mut msg = Message::new(&TEST_MSG, 100, 0x5);
        msg.header.nlmsg_seq = 9;
        msg.set_field("family", 2).unwrap();
        msg.set_field("index", (-3i32) as u32 as u64).unwrap();
        msg.push("ADDR", AttrValue::LlAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]))
            .unwrap();
        msg.push("IP", AttrValue::Ip("10.0.0.1".parse().unwrap()))
            .unwrap();
        msg.push("NAME", AttrValue::Str("eth0".into())).unwrap();
        msg.push("MTU", AttrValue::U32(1500)).unwrap();
        msg.push("PORT", AttrValue::U16Be(4789)).unwrap();
        let data = vec![Attribute::named(&DATA_A, "A_ID", AttrValue::U16(7)).unwrap()];
        let info = vec![
            Attribute::named(&INFO, "KIND", AttrValue::Str("a".into())).unwrap(),
            Attribute::named(&INFO, "DATA", AttrValue::Nested(data)).unwrap(),
        ];
        msg.push("INFO", AttrValue::Nested(info)).unwrap();
        let mut hop = Body::new(&HOP);
        hop.set_field("ifindex", 4).unwrap();
        hop.push("GW", AttrValue::Ip("10.0.0.254".parse().unwrap()))
            .unwrap();
        let mut hop2 = Body::new(&HOP);
        hop2.set_field("ifindex", 5).unwrap();
        msg.push("HOPS", AttrValue::List(vec![hop, hop2])).unwrap();
        let mut stats = Record::new(&STATS);
        stats.set("bytes", 1 << 40).unwrap();
        msg.push("STATS", AttrValue::Record(stats)).unwrap();
        let mut peer = Body::new(&TEST_MSG);
        peer.push("NAME", AttrValue::Str("peer0".into())).unwrap();
        msg.push("PEER", AttrValue::Message(Box::new(peer))).unwrap();
        msg.push("FLAG", AttrValue::Flag).unwrap();
        msg
    }

    #[test]
    fn test_round_trip() {
        let bytes = sample().encode();
        assert_eq!(bytes.len() % 4, 0);
        let header = NlMsgHdr::from_bytes(&bytes).unwrap();
        assert_eq!(header.nlmsg_len as usize, bytes.len());

        let decoded = Message::decode(&bytes, &REGISTRY).unwrap();
        assert_eq!(decoded.encode(), bytes);
        assert_eq!(Message::decode(&decoded.encode(), &REGISTRY).unwrap(), decoded);

        assert_eq!(decoded.attr_str("NAME"), Some("eth0"));
        assert_eq!(decoded.attr_u32("MTU"), Some(1500));
        assert_eq!(decoded.attr_u32("PORT"), Some(4789));
        assert_eq!(decoded.field("index").map(|v| v as u32 as i32), Some(-3));
        assert_eq!(
            decoded.get_nested(&["INFO", "DATA", "A_ID"]),
            Some(&AttrValue::U16(7))
        );
        match decoded.get_attr("HOPS") {
            Some(AttrValue::List(hops)) => {
                assert_eq!(hops.len(), 2);
                assert_eq!(hops[0].field("ifindex"), Some(4));
                assert_eq!(hops[0].field("len"), Some(16));
                assert_eq!(hops[1].field("len"), Some(8));
            }
            other => panic!("unexpected hops: {other:?}"),
        }
        match decoded.get_attr("STATS") {
            Some(AttrValue::Record(r)) => assert_eq!(r.get("bytes"), Some(1 << 40)),
            other => panic!("unexpected stats: {other:?}"),
        }
        let peer = decoded.get_attr("PEER").and_then(AttrValue::as_body).unwrap();
        assert_eq!(peer.attr_str("NAME"), Some("peer0"));
    }

    #[test]
    fn test_unknown_attribute_preserved() {
        let mut b = MessageBuilder::new(100, 0);
        b.append_bytes(&[0u8; 8]);
        b.append_attr(4, &1500u32.to_ne_bytes());
        b.append_attr(0x4000 | 77, &[1, 2, 3]);
        b.append_attr(3, b"x\0");
        let bytes = b.finish();

        let msg = Message::decode(&bytes, &REGISTRY).unwrap();
        let unknown = &msg.attrs[1];
        assert_eq!(unknown.name, UNKNOWN_ATTR);
        assert_eq!(unknown.id, 77);
        assert_eq!(unknown.flags, 0x4000);
        assert_eq!(unknown.value, AttrValue::Unknown(vec![1, 2, 3]));
        assert_eq!(msg.encode(), bytes);
    }

    #[test]
    fn test_mismatched_payload_degrades_to_bytes() {
        let mut b = MessageBuilder::new(100, 0);
        b.append_bytes(&[0u8; 8]);
        b.append_attr(4, &[1, 2]);
        b.append_attr(3, b"ab\0\0");
        let bytes = b.finish();

        let msg = Message::decode(&bytes, &REGISTRY).unwrap();
        assert_eq!(msg.get_attr("MTU"), Some(&AttrValue::Bytes(vec![1, 2])));
        assert_eq!(msg.attr_str("NAME"), Some("ab"));
        assert_eq!(msg.encode(), bytes);
    }

    #[test]
    fn test_overlong_attribute_is_malformed() {
        let mut b = MessageBuilder::new(100, 0);
        b.append_bytes(&[0u8; 8]);
        b.append_attr(4, &1500u32.to_ne_bytes());
        let mut bytes = b.finish();
        let attr_off = NLMSG_HDRLEN + 8;
        bytes[attr_off] = 64;

        assert!(matches!(
            Message::decode(&bytes, &REGISTRY),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_truncated_nested_is_malformed() {
        let mut b = MessageBuilder::new(100, 0);
        b.append_bytes(&[0u8; 8]);
        let token = b.nest_start(6 | NLA_F_NESTED);
        b.append_attr(1, b"a\0");
        b.nest_end(token);
        let mut bytes = b.finish();
        // inner attribute claims more than its parent holds
        bytes[NLMSG_HDRLEN + 8 + 4] = 32;

        assert!(matches!(
            Message::decode(&bytes, &REGISTRY),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_missing_padding_is_malformed() {
        let mut b = MessageBuilder::new(100, 0);
        b.append_bytes(&[0u8; 8]);
        b.append_raw(&[5, 0, 3, 0, b'x', 6, 0]);
        let bytes = b.finish();

        assert!(matches!(
            Message::decode(&bytes, &REGISTRY),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_short_header_is_malformed() {
        let mut b = MessageBuilder::new(100, 0);
        b.append_raw(&[0u8; 3]);
        let bytes = b.finish();
        assert!(matches!(
            Message::decode(&bytes, &REGISTRY),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_error_and_done() {
        let req = sample();
        let err = Message::error(libc::EEXIST, &req);
        assert_eq!(err.error_code(), Some(-libc::EEXIST));
        assert_eq!(err.seq(), 9);

        let mut data = err.encode();
        data.extend(Message::done(9, 0).encode());
        let msgs = Message::decode_all(&data, &REGISTRY).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].error_code(), Some(-libc::EEXIST));
        assert_eq!(&msgs[0].trailer[..], &req.encode()[..]);
        assert!(msgs[1].header.is_done());
    }

    #[test]
    fn test_error_code_extremes() {
        let req = sample();
        assert_eq!(Message::error(i32::MIN, &req).error_code(), Some(-i32::MAX));
        assert_eq!(Message::error(-libc::EPERM, &req).error_code(), Some(-libc::EPERM));
    }

    #[test]
    fn test_lladdr_text() {
        let mac = parse_lladdr("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(format_lladdr(&mac), "aa:bb:cc:dd:ee:ff");
        assert!(parse_lladdr("aa:bb").is_err());
        assert!(parse_lladdr("aa:bb:cc:dd:ee:ff:00").is_err());
    }

    #[test]
    fn test_json_rendering() {
        let json = sample().to_json();
        assert_eq!(json["family"], 2);
        assert_eq!(json["attrs"][0][0], "ADDR");
        assert_eq!(json["attrs"][0][1], "aa:bb:cc:dd:ee:ff");
    }
}
