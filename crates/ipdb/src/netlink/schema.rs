//! Declarative message schemas.
//!
//! A schema describes the fixed header of a message body and the map of
//! attribute ids it may carry. Schemas are plain `static` data; the codec
//! walks them at runtime, so adding a message family never needs new code.

use std::fmt;

use super::message::NlMsgType;

/// Primitive kind of a fixed header field. All are host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I32,
}

impl FieldKind {
    /// Encoded size in bytes.
    pub const fn size(self) -> usize {
        match self {
            FieldKind::U8 => 1,
            FieldKind::U16 => 2,
            FieldKind::U32 | FieldKind::I32 => 4,
            FieldKind::U64 => 8,
        }
    }
}

/// A named fixed field.
#[derive(Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Shorthand used by the schema tables.
pub const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

/// A fixed-layout C struct carried as an attribute payload.
#[derive(Debug)]
pub struct RecordSpec {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

impl RecordSpec {
    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.fields.iter().map(|f| f.kind.size()).sum()
    }

    /// Position of a field by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// How an attribute payload is interpreted.
#[derive(Debug, Clone, Copy)]
pub enum AttrKind {
    U8,
    U16,
    U32,
    U64,
    I32,
    /// `u16` in network byte order.
    U16Be,
    /// `u32` in network byte order.
    U32Be,
    /// NUL-terminated string.
    AsciiZ,
    /// Binary payload kept as is.
    Bytes,
    /// Opaque blob, rendered as hex.
    Hex,
    /// IPv4 or IPv6 address, chosen by length.
    Ip,
    /// 6-byte link-layer address.
    LlAddr,
    /// Zero-length flag.
    Flag,
    /// Nested attribute set.
    Nested(&'static AttrSchema),
    /// A nested message body with its own fixed header (e.g. a veth peer).
    NestedMessage(&'static MessageSchema),
    /// Array of self-sized records (e.g. multipath next hops).
    NestedList(&'static MessageSchema),
    /// Fixed-layout struct.
    Record(&'static RecordSpec),
    /// Payload kind selected by the string value of a sibling attribute.
    ByKind(&'static KindTable),
}

/// One entry of an attribute map.
#[derive(Debug)]
pub struct AttrSpec {
    pub id: u16,
    pub name: &'static str,
    pub kind: AttrKind,
}

/// Shorthand used by the schema tables.
pub const fn attr(id: u16, name: &'static str, kind: AttrKind) -> AttrSpec {
    AttrSpec { id, name, kind }
}

/// An attribute map.
pub struct AttrSchema {
    pub name: &'static str,
    pub attrs: &'static [AttrSpec],
}

impl AttrSchema {
    /// Look up an attribute by numeric id.
    pub fn by_id(&self, id: u16) -> Option<&'static AttrSpec> {
        self.attrs.iter().find(|a| a.id == id)
    }

    /// Look up an attribute by name.
    pub fn by_name(&self, name: &str) -> Option<&'static AttrSpec> {
        self.attrs.iter().find(|a| a.name == name)
    }
}

impl fmt::Debug for AttrSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttrSchema({})", self.name)
    }
}

/// Selects the payload kind of an attribute from a sibling string attribute.
#[derive(Debug)]
pub struct KindTable {
    /// Id of the sibling attribute holding the kind string.
    pub selector: u16,
    pub kinds: &'static [(&'static str, AttrKind)],
}

impl KindTable {
    /// Resolve the payload kind for a given kind string.
    pub fn resolve(&self, kind: &str) -> Option<AttrKind> {
        self.kinds
            .iter()
            .find(|(name, _)| *name == kind)
            .map(|(_, k)| *k)
    }
}

/// Schema of a message body.
pub struct MessageSchema {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
    pub attrs: &'static AttrSchema,
    /// Whatever follows the fixed fields is kept as opaque trailer bytes.
    pub opaque_tail: bool,
    /// The first field is a `u16` length covering the whole record.
    pub self_sized: bool,
}

impl MessageSchema {
    /// Size of the fixed header.
    pub fn header_len(&self) -> usize {
        self.fields.iter().map(|f| f.kind.size()).sum()
    }

    /// Position of a fixed field by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

impl fmt::Debug for MessageSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageSchema({})", self.name)
    }
}

/// An attribute map with no entries.
pub static NO_ATTRS: AttrSchema = AttrSchema {
    name: "none",
    attrs: &[],
};

/// `NLMSG_ERROR`: error code followed by the echoed request.
pub static ERROR_SCHEMA: MessageSchema = MessageSchema {
    name: "nlmsgerr",
    fields: &[field("error", FieldKind::I32)],
    attrs: &NO_ATTRS,
    opaque_tail: true,
    self_sized: false,
};

/// `NLMSG_DONE`, `NLMSG_NOOP` and any unregistered message type.
pub static OPAQUE_SCHEMA: MessageSchema = MessageSchema {
    name: "opaque",
    fields: &[],
    attrs: &NO_ATTRS,
    opaque_tail: true,
    self_sized: false,
};

/// Maps message types of one protocol to their schemas.
#[derive(Debug)]
pub struct Registry {
    pub protocol: &'static str,
    pub messages: &'static [(u16, &'static MessageSchema)],
}

impl Registry {
    /// Schema for a message type. Control and unknown types get opaque schemas.
    pub fn schema(&self, msg_type: u16) -> &'static MessageSchema {
        if msg_type == NlMsgType::ERROR {
            return &ERROR_SCHEMA;
        }
        self.messages
            .iter()
            .find(|(t, _)| *t == msg_type)
            .map(|(_, s)| *s)
            .unwrap_or(&OPAQUE_SCHEMA)
    }
}

/// Registry with no protocol messages, only control messages.
pub static CONTROL_REGISTRY: Registry = Registry {
    protocol: "control",
    messages: &[],
};
