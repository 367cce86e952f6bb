//! Links: `ifinfomsg`, `IFLA_*` and per-kind `IFLA_INFO_DATA`.
//!
//! # Example
//!
//! ```ignore
//! use ipdb::netlink::{Connection, Protocol};
//! use ipdb::rtnl::LinkRequest;
//!
//! let conn = Connection::new(Protocol::Route)?;
//!
//! let mut req = LinkRequest::new();
//! req.set("ifname", "eth0.100")?
//!     .set("vlan_id", 100)?      // queued until the kind is known
//!     .set("link", 2)?
//!     .set("kind", "vlan")?;
//! conn.add_link(&req).await?;
//! ```

use std::collections::BTreeMap;

use tracing::trace;

use crate::netlink::codec::{AttrValue, Attribute, Body, Message};
use crate::netlink::connection::Connection;
use crate::netlink::message::{NLM_F_CREATE, NLM_F_EXCL, NlMsgHdr, NlMsgType};
use crate::netlink::schema::{
    AttrKind as K, AttrSchema, FieldKind as F, KindTable, MessageSchema, RecordSpec, attr, field,
};
use crate::netlink::{Error, Result};
use crate::value::Value;

use super::{attr_value, key_of, spec_for_key};

/// Interface flags (`IFF_*`).
pub mod iff {
    pub const UP: u32 = 0x1;
    pub const BROADCAST: u32 = 0x2;
    pub const DEBUG: u32 = 0x4;
    pub const LOOPBACK: u32 = 0x8;
    pub const POINTOPOINT: u32 = 0x10;
    pub const NOTRAILERS: u32 = 0x20;
    pub const RUNNING: u32 = 0x40;
    pub const NOARP: u32 = 0x80;
    pub const PROMISC: u32 = 0x100;
    pub const ALLMULTI: u32 = 0x200;
    pub const MASTER: u32 = 0x400;
    pub const SLAVE: u32 = 0x800;
    pub const MULTICAST: u32 = 0x1000;
    pub const PORTSEL: u32 = 0x2000;
    pub const AUTOMEDIA: u32 = 0x4000;
    pub const DYNAMIC: u32 = 0x8000;
    pub const LOWER_UP: u32 = 0x10000;
    pub const DORMANT: u32 = 0x20000;
    pub const ECHO: u32 = 0x40000;

    /// Flags the kernel manages itself; requests never touch them.
    pub const READ_ONLY: u32 = RUNNING | LOWER_UP | DORMANT | ECHO | LOOPBACK;

    pub(crate) const NAMES: &[(&str, u32)] = &[
        ("up", UP),
        ("broadcast", BROADCAST),
        ("debug", DEBUG),
        ("loopback", LOOPBACK),
        ("pointopoint", POINTOPOINT),
        ("notrailers", NOTRAILERS),
        ("running", RUNNING),
        ("noarp", NOARP),
        ("promisc", PROMISC),
        ("allmulti", ALLMULTI),
        ("master", MASTER),
        ("slave", SLAVE),
        ("multicast", MULTICAST),
        ("portsel", PORTSEL),
        ("automedia", AUTOMEDIA),
        ("dynamic", DYNAMIC),
        ("lower_up", LOWER_UP),
        ("dormant", DORMANT),
        ("echo", ECHO),
    ];

    /// Bit for a flag name.
    pub fn by_name(name: &str) -> Option<u32> {
        NAMES.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }
}

static STATS64: RecordSpec = RecordSpec {
    name: "rtnl_link_stats64",
    fields: &[
        field("rx_packets", F::U64),
        field("tx_packets", F::U64),
        field("rx_bytes", F::U64),
        field("tx_bytes", F::U64),
        field("rx_errors", F::U64),
        field("tx_errors", F::U64),
        field("rx_dropped", F::U64),
        field("tx_dropped", F::U64),
        field("multicast", F::U64),
        field("collisions", F::U64),
        field("rx_length_errors", F::U64),
        field("rx_over_errors", F::U64),
        field("rx_crc_errors", F::U64),
        field("rx_frame_errors", F::U64),
        field("rx_fifo_errors", F::U64),
        field("rx_missed_errors", F::U64),
        field("tx_aborted_errors", F::U64),
        field("tx_carrier_errors", F::U64),
        field("tx_fifo_errors", F::U64),
        field("tx_heartbeat_errors", F::U64),
        field("tx_window_errors", F::U64),
        field("rx_compressed", F::U64),
        field("tx_compressed", F::U64),
        field("rx_nohandler", F::U64),
    ],
};

static VLAN_FLAGS: RecordSpec = RecordSpec {
    name: "ifla_vlan_flags",
    fields: &[field("flags", F::U32), field("mask", F::U32)],
};

pub static VLAN_DATA: AttrSchema = AttrSchema {
    name: "vlan",
    attrs: &[
        attr(1, "IFLA_VLAN_ID", K::U16),
        attr(2, "IFLA_VLAN_FLAGS", K::Record(&VLAN_FLAGS)),
        attr(3, "IFLA_VLAN_EGRESS_QOS", K::Hex),
        attr(4, "IFLA_VLAN_INGRESS_QOS", K::Hex),
        attr(5, "IFLA_VLAN_PROTOCOL", K::U16Be),
    ],
};

pub static VETH_DATA: AttrSchema = AttrSchema {
    name: "veth",
    attrs: &[attr(1, "VETH_INFO_PEER", K::NestedMessage(&IFINFOMSG))],
};

pub static BOND_DATA: AttrSchema = AttrSchema {
    name: "bond",
    attrs: &[
        attr(1, "IFLA_BOND_MODE", K::U8),
        attr(2, "IFLA_BOND_ACTIVE_SLAVE", K::U32),
        attr(3, "IFLA_BOND_MIIMON", K::U32),
        attr(4, "IFLA_BOND_UPDELAY", K::U32),
        attr(5, "IFLA_BOND_DOWNDELAY", K::U32),
        attr(6, "IFLA_BOND_USE_CARRIER", K::U8),
        attr(7, "IFLA_BOND_ARP_INTERVAL", K::U32),
        attr(8, "IFLA_BOND_ARP_IP_TARGET", K::Hex),
        attr(9, "IFLA_BOND_ARP_VALIDATE", K::U32),
        attr(10, "IFLA_BOND_ARP_ALL_TARGETS", K::U32),
        attr(11, "IFLA_BOND_PRIMARY", K::U32),
        attr(12, "IFLA_BOND_PRIMARY_RESELECT", K::U8),
        attr(13, "IFLA_BOND_FAIL_OVER_MAC", K::U8),
        attr(14, "IFLA_BOND_XMIT_HASH_POLICY", K::U8),
        attr(15, "IFLA_BOND_RESEND_IGMP", K::U32),
        attr(16, "IFLA_BOND_NUM_PEER_NOTIF", K::U8),
        attr(17, "IFLA_BOND_ALL_SLAVES_ACTIVE", K::U8),
        attr(18, "IFLA_BOND_MIN_LINKS", K::U32),
        attr(19, "IFLA_BOND_LP_INTERVAL", K::U32),
        attr(20, "IFLA_BOND_PACKETS_PER_SLAVE", K::U32),
        attr(21, "IFLA_BOND_AD_LACP_RATE", K::U8),
        attr(22, "IFLA_BOND_AD_SELECT", K::U8),
        attr(23, "IFLA_BOND_AD_INFO", K::Hex),
    ],
};

pub static BRIDGE_DATA: AttrSchema = AttrSchema {
    name: "bridge",
    attrs: &[
        attr(1, "IFLA_BR_FORWARD_DELAY", K::U32),
        attr(2, "IFLA_BR_HELLO_TIME", K::U32),
        attr(3, "IFLA_BR_MAX_AGE", K::U32),
        attr(4, "IFLA_BR_AGEING_TIME", K::U32),
        attr(5, "IFLA_BR_STP_STATE", K::U32),
        attr(6, "IFLA_BR_PRIORITY", K::U16),
        attr(7, "IFLA_BR_VLAN_FILTERING", K::U8),
        attr(8, "IFLA_BR_VLAN_PROTOCOL", K::U16Be),
        attr(9, "IFLA_BR_GROUP_FWD_MASK", K::U16),
        attr(10, "IFLA_BR_ROOT_ID", K::Hex),
        attr(11, "IFLA_BR_BRIDGE_ID", K::Hex),
        attr(12, "IFLA_BR_ROOT_PORT", K::U16),
        attr(13, "IFLA_BR_ROOT_PATH_COST", K::U32),
        attr(23, "IFLA_BR_MCAST_SNOOPING", K::U8),
        attr(39, "IFLA_BR_VLAN_DEFAULT_PVID", K::U16),
    ],
};

pub static VXLAN_DATA: AttrSchema = AttrSchema {
    name: "vxlan",
    attrs: &[
        attr(1, "IFLA_VXLAN_ID", K::U32),
        attr(2, "IFLA_VXLAN_GROUP", K::Ip),
        attr(3, "IFLA_VXLAN_LINK", K::U32),
        attr(4, "IFLA_VXLAN_LOCAL", K::Ip),
        attr(5, "IFLA_VXLAN_TTL", K::U8),
        attr(6, "IFLA_VXLAN_TOS", K::U8),
        attr(7, "IFLA_VXLAN_LEARNING", K::U8),
        attr(8, "IFLA_VXLAN_AGEING", K::U32),
        attr(9, "IFLA_VXLAN_LIMIT", K::U32),
        attr(10, "IFLA_VXLAN_PORT_RANGE", K::Hex),
        attr(11, "IFLA_VXLAN_PROXY", K::U8),
        attr(12, "IFLA_VXLAN_RSC", K::U8),
        attr(13, "IFLA_VXLAN_L2MISS", K::U8),
        attr(14, "IFLA_VXLAN_L3MISS", K::U8),
        attr(15, "IFLA_VXLAN_PORT", K::U16Be),
        attr(16, "IFLA_VXLAN_GROUP6", K::Ip),
        attr(17, "IFLA_VXLAN_LOCAL6", K::Ip),
    ],
};

pub static GRE_DATA: AttrSchema = AttrSchema {
    name: "gre",
    attrs: &[
        attr(1, "IFLA_GRE_LINK", K::U32),
        attr(2, "IFLA_GRE_IFLAGS", K::U16Be),
        attr(3, "IFLA_GRE_OFLAGS", K::U16Be),
        attr(4, "IFLA_GRE_IKEY", K::U32Be),
        attr(5, "IFLA_GRE_OKEY", K::U32Be),
        attr(6, "IFLA_GRE_LOCAL", K::Ip),
        attr(7, "IFLA_GRE_REMOTE", K::Ip),
        attr(8, "IFLA_GRE_TTL", K::U8),
        attr(9, "IFLA_GRE_TOS", K::U8),
        attr(10, "IFLA_GRE_PMTUDISC", K::U8),
    ],
};

pub static MACVLAN_DATA: AttrSchema = AttrSchema {
    name: "macvlan",
    attrs: &[
        attr(1, "IFLA_MACVLAN_MODE", K::U32),
        attr(2, "IFLA_MACVLAN_FLAGS", K::U16),
    ],
};

pub static IPVLAN_DATA: AttrSchema = AttrSchema {
    name: "ipvlan",
    attrs: &[
        attr(1, "IFLA_IPVLAN_MODE", K::U16),
        attr(2, "IFLA_IPVLAN_FLAGS", K::U16),
    ],
};

pub static VRF_DATA: AttrSchema = AttrSchema {
    name: "vrf",
    attrs: &[attr(1, "IFLA_VRF_TABLE", K::U32)],
};

/// Tun/tap parameters. The kernel has no netlink create path for these
/// devices; the proxy turns them into `/dev/net/tun` ioctls.
pub static TUNTAP_DATA: AttrSchema = AttrSchema {
    name: "tuntap",
    attrs: &[
        attr(1, "IFLA_TUN_MODE", K::AsciiZ),
        attr(2, "IFLA_TUN_OWNER", K::U32),
        attr(3, "IFLA_TUN_GROUP", K::U32),
        attr(4, "IFLA_TUN_NO_PI", K::U8),
        attr(5, "IFLA_TUN_ONE_QUEUE", K::U8),
        attr(6, "IFLA_TUN_VNET_HDR", K::U8),
        attr(7, "IFLA_TUN_MULTI_QUEUE", K::U8),
    ],
};

/// `IFLA_INFO_DATA` schema chosen by `IFLA_INFO_KIND`.
pub static INFO_DATA_KINDS: KindTable = KindTable {
    selector: 1,
    kinds: &[
        ("vlan", K::Nested(&VLAN_DATA)),
        ("veth", K::Nested(&VETH_DATA)),
        ("bond", K::Nested(&BOND_DATA)),
        ("bridge", K::Nested(&BRIDGE_DATA)),
        ("vxlan", K::Nested(&VXLAN_DATA)),
        ("gre", K::Nested(&GRE_DATA)),
        ("gretap", K::Nested(&GRE_DATA)),
        ("ip6gre", K::Nested(&GRE_DATA)),
        ("ip6gretap", K::Nested(&GRE_DATA)),
        ("macvlan", K::Nested(&MACVLAN_DATA)),
        ("macvtap", K::Nested(&MACVLAN_DATA)),
        ("ipvlan", K::Nested(&IPVLAN_DATA)),
        ("vrf", K::Nested(&VRF_DATA)),
        ("tuntap", K::Nested(&TUNTAP_DATA)),
    ],
};

/// Kinds that carry no `IFLA_INFO_DATA`.
pub const PLAIN_KINDS: &[&str] = &["dummy", "ifb", "ipip", "sit", "nlmon", "team", "openvswitch"];

/// Whether a link kind can be created.
pub fn is_supported_kind(kind: &str) -> bool {
    PLAIN_KINDS.contains(&kind) || INFO_DATA_KINDS.resolve(kind).is_some()
}

fn data_schema(kind: &str) -> Option<&'static AttrSchema> {
    match INFO_DATA_KINDS.resolve(kind) {
        Some(K::Nested(schema)) => Some(schema),
        _ => None,
    }
}

pub static LINKINFO_ATTRS: AttrSchema = AttrSchema {
    name: "linkinfo",
    attrs: &[
        attr(1, "IFLA_INFO_KIND", K::AsciiZ),
        attr(2, "IFLA_INFO_DATA", K::ByKind(&INFO_DATA_KINDS)),
        attr(3, "IFLA_INFO_XSTATS", K::Hex),
        attr(4, "IFLA_INFO_SLAVE_KIND", K::AsciiZ),
        attr(5, "IFLA_INFO_SLAVE_DATA", K::Hex),
    ],
};

pub static IFLA_ATTRS: AttrSchema = AttrSchema {
    name: "ifla",
    attrs: &[
        attr(1, "IFLA_ADDRESS", K::LlAddr),
        attr(2, "IFLA_BROADCAST", K::LlAddr),
        attr(3, "IFLA_IFNAME", K::AsciiZ),
        attr(4, "IFLA_MTU", K::U32),
        attr(5, "IFLA_LINK", K::U32),
        attr(6, "IFLA_QDISC", K::AsciiZ),
        attr(7, "IFLA_STATS", K::Hex),
        attr(8, "IFLA_COST", K::Hex),
        attr(9, "IFLA_PRIORITY", K::Hex),
        attr(10, "IFLA_MASTER", K::U32),
        attr(11, "IFLA_WIRELESS", K::Hex),
        attr(12, "IFLA_PROTINFO", K::Hex),
        attr(13, "IFLA_TXQLEN", K::U32),
        attr(14, "IFLA_MAP", K::Hex),
        attr(15, "IFLA_WEIGHT", K::U32),
        attr(16, "IFLA_OPERSTATE", K::U8),
        attr(17, "IFLA_LINKMODE", K::U8),
        attr(18, "IFLA_LINKINFO", K::Nested(&LINKINFO_ATTRS)),
        attr(19, "IFLA_NET_NS_PID", K::U32),
        attr(20, "IFLA_IFALIAS", K::AsciiZ),
        attr(21, "IFLA_NUM_VF", K::U32),
        attr(22, "IFLA_VFINFO_LIST", K::Hex),
        attr(23, "IFLA_STATS64", K::Record(&STATS64)),
        attr(24, "IFLA_VF_PORTS", K::Hex),
        attr(25, "IFLA_PORT_SELF", K::Hex),
        attr(26, "IFLA_AF_SPEC", K::Hex),
        attr(27, "IFLA_GROUP", K::U32),
        attr(28, "IFLA_NET_NS_FD", K::U32),
        attr(29, "IFLA_EXT_MASK", K::U32),
        attr(30, "IFLA_PROMISCUITY", K::U32),
        attr(31, "IFLA_NUM_TX_QUEUES", K::U32),
        attr(32, "IFLA_NUM_RX_QUEUES", K::U32),
        attr(33, "IFLA_CARRIER", K::U8),
        attr(34, "IFLA_PHYS_PORT_ID", K::Hex),
        attr(35, "IFLA_CARRIER_CHANGES", K::U32),
        attr(36, "IFLA_PHYS_SWITCH_ID", K::Hex),
        attr(37, "IFLA_LINK_NETNSID", K::I32),
        attr(38, "IFLA_PHYS_PORT_NAME", K::AsciiZ),
        attr(39, "IFLA_PROTO_DOWN", K::U8),
        attr(40, "IFLA_GSO_MAX_SEGS", K::U32),
        attr(41, "IFLA_GSO_MAX_SIZE", K::U32),
        attr(43, "IFLA_XDP", K::Hex),
        attr(44, "IFLA_EVENT", K::U32),
        attr(45, "IFLA_NEW_NETNSID", K::I32),
        attr(46, "IFLA_TARGET_NETNSID", K::I32),
        attr(47, "IFLA_CARRIER_UP_COUNT", K::U32),
        attr(48, "IFLA_CARRIER_DOWN_COUNT", K::U32),
        attr(49, "IFLA_NEW_IFINDEX", K::I32),
        attr(50, "IFLA_MIN_MTU", K::U32),
        attr(51, "IFLA_MAX_MTU", K::U32),
        attr(52, "IFLA_PROP_LIST", K::Hex),
        attr(54, "IFLA_PERM_ADDRESS", K::LlAddr),
        attr(56, "IFLA_PARENT_DEV_NAME", K::AsciiZ),
        attr(57, "IFLA_PARENT_DEV_BUS_NAME", K::AsciiZ),
    ],
};

/// `struct ifinfomsg` followed by `IFLA_*`.
pub static IFINFOMSG: MessageSchema = MessageSchema {
    name: "ifinfomsg",
    fields: &[
        field("family", F::U8),
        field("ifi_pad", F::U8),
        field("ifi_type", F::U16),
        field("index", F::I32),
        field("flags", F::U32),
        field("change", F::U32),
    ],
    attrs: &IFLA_ATTRS,
    opaque_tail: false,
    self_sized: false,
};

/// Position of `index` in `ifinfomsg`.
const INDEX: usize = 3;

/// Keys the kernel reports but never accepts back.
const READ_ONLY_KEYS: &[&str] = &[
    "qdisc",
    "stats",
    "stats64",
    "operstate_changes",
    "num_vf",
    "promiscuity",
    "num_tx_queues",
    "num_rx_queues",
    "carrier_changes",
    "carrier_up_count",
    "carrier_down_count",
    "link_netnsid",
    "min_mtu",
    "max_mtu",
    "perm_address",
    "parent_dev_name",
    "parent_dev_bus_name",
    "phys_port_name",
    "ifi_type",
    "slave_kind",
];

/// Accessors shared by every link message.
pub trait LinkExt {
    fn ifindex(&self) -> u32;
    fn ifname(&self) -> Option<&str>;
    fn link_kind(&self) -> Option<&str>;
    fn link_flags(&self) -> u32;
    fn master(&self) -> u32;
}

impl LinkExt for Body {
    fn ifindex(&self) -> u32 {
        self.field_or_zero("index") as u32
    }

    fn ifname(&self) -> Option<&str> {
        self.attr_str("IFLA_IFNAME")
    }

    fn link_kind(&self) -> Option<&str> {
        self.get_nested(&["IFLA_LINKINFO", "IFLA_INFO_KIND"])?
            .as_str()
    }

    fn link_flags(&self) -> u32 {
        self.field_or_zero("flags") as u32
    }

    fn master(&self) -> u32 {
        self.attr_u32("IFLA_MASTER").unwrap_or(0)
    }
}

/// Flatten a link message into database fields.
///
/// Scalar attributes become keys (`IFLA_MTU` → `mtu`), linkinfo yields
/// `kind` plus the kind data keys (`vlan_id`, ...). `master` is always
/// present, zero when the link has none.
pub fn link_fields(body: &Body) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("index".to_string(), Value::from(body.ifindex()));
    fields.insert("flags".to_string(), Value::from(body.link_flags()));
    fields.insert("ifi_type".to_string(), Value::from(body.field_or_zero("ifi_type")));

    for a in &body.attrs {
        if let Some(v) = Value::from_attr(&a.value) {
            fields.insert(key_of(a.name, "IFLA_"), v);
        }
    }
    if let Some(info) = body.get_attr("IFLA_LINKINFO").and_then(AttrValue::as_nested) {
        for a in info {
            match (a.name, &a.value) {
                ("IFLA_INFO_KIND", v) => {
                    fields.insert("kind".into(), Value::from_attr(v).unwrap_or_default());
                }
                ("IFLA_INFO_SLAVE_KIND", v) => {
                    fields.insert("slave_kind".into(), Value::from_attr(v).unwrap_or_default());
                }
                ("IFLA_INFO_DATA", AttrValue::Nested(data)) => {
                    for d in data {
                        if let Some(v) = Value::from_attr(&d.value) {
                            fields.insert(key_of(d.name, "IFLA_"), v);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    fields.entry("master".into()).or_insert(Value::Int(0));
    fields
}

/// Builder for RTM_NEWLINK / RTM_SETLINK requests.
///
/// Keys may arrive in any order. Keys that belong to a link kind are held
/// back until `kind` is set, then placed into `IFLA_INFO_DATA` (or the veth
/// peer message). Interface flags can be given as a whole (`flags`,
/// optionally with `change`) or by name (`up`, `promisc`, `arp`, ...).
#[derive(Debug, Clone)]
pub struct LinkRequest {
    body: Body,
    kind: Option<String>,
    data: Vec<Attribute>,
    deferred: Vec<(String, Value)>,
    flags: u32,
    change: u32,
    explicit_change: Option<u32>,
}

impl Default for LinkRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRequest {
    pub fn new() -> Self {
        Self {
            body: Body::new(&IFINFOMSG),
            kind: None,
            data: Vec::new(),
            deferred: Vec::new(),
            flags: 0,
            change: 0,
            explicit_change: None,
        }
    }

    /// A request addressing an existing link.
    pub fn for_index(index: u32) -> Self {
        let mut req = Self::new();
        req.body.fields[INDEX] = index as u64;
        req
    }

    pub fn index(&self) -> u32 {
        self.body.ifindex()
    }

    pub fn ifname(&self) -> Option<&str> {
        self.body.ifname()
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Whether kind data is present; such changes need RTM_NEWLINK.
    pub fn has_kind_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Name of the veth peer, if one was given.
    pub fn peer(&self) -> Option<&str> {
        self.data
            .iter()
            .find(|a| a.name == "VETH_INFO_PEER")
            .and_then(|a| a.value.as_body())
            .and_then(|b| b.ifname())
    }

    /// Set a key. Replays any queued kind keys once the kind is known.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.apply(key, value.into())?;
        self.flush()?;
        Ok(self)
    }

    fn apply(&mut self, key: &str, value: Value) -> Result<()> {
        match key {
            "index" => {
                let index = value
                    .as_u32()
                    .ok_or_else(|| Error::InvalidAttribute(format!("index: {value}")))?;
                self.body.set_field("index", index as u64)?;
            }
            "kind" => {
                let kind = value.to_string();
                if !is_supported_kind(&kind) {
                    return Err(Error::commit_failed(format!("unknown kind {kind}"), None));
                }
                self.kind = Some(kind);
            }
            "flags" => {
                self.flags = value
                    .as_u32()
                    .ok_or_else(|| Error::InvalidAttribute(format!("flags: {value}")))?;
                self.change = u32::MAX;
            }
            "change" => {
                self.explicit_change = Some(
                    value
                        .as_u32()
                        .ok_or_else(|| Error::InvalidAttribute(format!("change: {value}")))?,
                );
            }
            "state" => self.flag(iff::UP, value.as_bool().unwrap_or(false)),
            "arp" => self.flag(iff::NOARP, !value.as_bool().unwrap_or(true)),
            // `master` and `broadcast` name both a flag and an attribute.
            _ if iff::by_name(key).is_some() && !matches!(key, "master" | "broadcast") => {
                let bit = iff::by_name(key).unwrap_or(0);
                if bit & iff::READ_ONLY != 0 {
                    trace!(key, "dropping read-only interface flag");
                    return Ok(());
                }
                self.flag(bit, value.as_bool().unwrap_or(false));
            }
            _ if READ_ONLY_KEYS.contains(&key) => trace!(key, "dropping read-only key"),
            _ => {
                if let Some(spec) = spec_for_key(&IFLA_ATTRS, "IFLA_", key, false)
                    .filter(|spec| !matches!(spec.kind, K::Nested(_) | K::Record(_) | K::Hex))
                {
                    if let Some(v) = attr_value(spec, &value)? {
                        self.body.set_attr(spec.name, v)?;
                    }
                } else {
                    self.deferred.push((key.to_string(), value));
                }
            }
        }
        Ok(())
    }

    fn flag(&mut self, bit: u32, on: bool) {
        if on {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
        self.change |= bit;
    }

    fn flush(&mut self) -> Result<()> {
        let Some(kind) = self.kind.clone() else {
            return Ok(());
        };
        for (key, value) in std::mem::take(&mut self.deferred) {
            self.kind_attr(&kind, &key, &value)?;
        }
        Ok(())
    }

    fn kind_attr(&mut self, kind: &str, key: &str, value: &Value) -> Result<()> {
        if kind == "veth" && key == "peer" {
            let mut peer = Body::new(&IFINFOMSG);
            peer.push("IFLA_IFNAME", AttrValue::Str(value.to_string()))?;
            let attr = Attribute::named(&VETH_DATA, "VETH_INFO_PEER", AttrValue::Message(Box::new(peer)))?;
            self.replace_data(attr);
            return Ok(());
        }
        let schema = data_schema(kind)
            .ok_or_else(|| Error::InvalidAttribute(format!("{kind} links take no {key}")))?;
        let spec = spec_for_key(schema, "IFLA_", key, true)
            .ok_or_else(|| Error::InvalidAttribute(format!("{kind} links have no {key}")))?;
        if let Some(v) = attr_value(spec, value)? {
            self.replace_data(Attribute::named(schema, spec.name, v)?);
        }
        Ok(())
    }

    fn replace_data(&mut self, attr: Attribute) {
        match self.data.iter_mut().find(|a| a.id == attr.id) {
            Some(slot) => *slot = attr,
            None => self.data.push(attr),
        }
    }

    /// Build the wire message.
    pub fn build(&self, msg_type: u16, flags: u16) -> Result<Message> {
        if let Some((key, _)) = self.deferred.first() {
            return Err(Error::InvalidAttribute(format!(
                "{key} is not a link attribute and no kind was given"
            )));
        }
        let mut msg = Message {
            header: NlMsgHdr::new(msg_type, flags),
            body: self.body.clone(),
        };
        let change = self.explicit_change.unwrap_or(self.change) & !iff::READ_ONLY;
        msg.set_field("flags", (self.flags & !iff::READ_ONLY) as u64)?;
        msg.set_field("change", change as u64)?;

        if let Some(kind) = &self.kind {
            let mut info = vec![Attribute::named(
                &LINKINFO_ATTRS,
                "IFLA_INFO_KIND",
                AttrValue::Str(kind.clone()),
            )?];
            if !self.data.is_empty() {
                info.push(Attribute::named(
                    &LINKINFO_ATTRS,
                    "IFLA_INFO_DATA",
                    AttrValue::Nested(self.data.clone()),
                )?);
            }
            msg.set_attr("IFLA_LINKINFO", AttrValue::Nested(info))?;
        }
        Ok(msg)
    }
}

fn link_message(msg_type: u16, index: u32) -> Message {
    let mut msg = Message::new(&IFINFOMSG, msg_type, 0);
    msg.body.fields[INDEX] = index as u64;
    msg
}

impl Connection {
    /// Dump every link.
    pub async fn get_links(&self) -> Result<Vec<Message>> {
        self.dump(link_message(NlMsgType::RTM_GETLINK, 0)).await
    }

    /// Get one link by index.
    pub async fn get_link(&self, index: u32) -> Result<Message> {
        let replies = self
            .request(link_message(NlMsgType::RTM_GETLINK, index))
            .await
            .map_err(|e| not_found(e, index.to_string()))?;
        replies.into_iter().next().ok_or(Error::InterfaceNotFound {
            name: index.to_string(),
        })
    }

    /// Get one link by name.
    pub async fn get_link_by_name(&self, name: &str) -> Result<Message> {
        let mut msg = link_message(NlMsgType::RTM_GETLINK, 0);
        msg.push("IFLA_IFNAME", AttrValue::Str(name.to_string()))?;
        let replies = self
            .request(msg)
            .await
            .map_err(|e| not_found(e, name.to_string()))?;
        replies.into_iter().next().ok_or(Error::InterfaceNotFound {
            name: name.to_string(),
        })
    }

    /// Create a link (`NLM_F_CREATE | NLM_F_EXCL`).
    pub async fn add_link(&self, req: &LinkRequest) -> Result<()> {
        let msg = req.build(NlMsgType::RTM_NEWLINK, NLM_F_CREATE | NLM_F_EXCL)?;
        self.request(msg).await.map_err(|e| {
            e.with_context(format!("creating link {}", req.ifname().unwrap_or("?")))
        })?;
        Ok(())
    }

    /// Change an existing link. Kind data goes through RTM_NEWLINK.
    pub async fn set_link(&self, req: &LinkRequest) -> Result<()> {
        let msg_type = if req.has_kind_data() {
            NlMsgType::RTM_NEWLINK
        } else {
            NlMsgType::RTM_SETLINK
        };
        let msg = req.build(msg_type, 0)?;
        self.request(msg)
            .await
            .map_err(|e| e.with_context(format!("changing link {}", req.index())))?;
        Ok(())
    }

    /// Delete a link.
    pub async fn del_link(&self, index: u32) -> Result<()> {
        self.request(link_message(NlMsgType::RTM_DELLINK, index))
            .await
            .map_err(|e| e.with_context(format!("deleting link {index}")))?;
        Ok(())
    }
}

fn not_found(e: Error, name: String) -> Error {
    if e.is_errno(libc::ENODEV) {
        Error::InterfaceNotFound { name }
    } else {
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtnl::REGISTRY;

    #[test]
    fn test_deferred_kind_keys() {
        let mut req = LinkRequest::new();
        req.set("ifname", "eth0.100")
            .unwrap()
            .set("vlan_id", 100)
            .unwrap()
            .set("link", 2)
            .unwrap();
        assert!(req.build(NlMsgType::RTM_NEWLINK, 0).is_err());

        req.set("kind", "vlan").unwrap();
        let msg = req.build(NlMsgType::RTM_NEWLINK, NLM_F_CREATE).unwrap();
        assert_eq!(msg.ifname(), Some("eth0.100"));
        assert_eq!(msg.attr_u32("IFLA_LINK"), Some(2));
        assert_eq!(
            msg.get_nested(&["IFLA_LINKINFO", "IFLA_INFO_DATA", "IFLA_VLAN_ID"]),
            Some(&AttrValue::U16(100))
        );
    }

    #[test]
    fn test_short_kind_key_after_kind() {
        let mut req = LinkRequest::new();
        req.set("kind", "bond").unwrap().set("mode", 4).unwrap();
        let msg = req.build(NlMsgType::RTM_NEWLINK, 0).unwrap();
        assert_eq!(
            msg.get_nested(&["IFLA_LINKINFO", "IFLA_INFO_DATA", "IFLA_BOND_MODE"]),
            Some(&AttrValue::U8(4))
        );
    }

    #[test]
    fn test_unknown_key_for_kind_is_rejected() {
        let mut req = LinkRequest::new();
        req.set("kind", "vlan").unwrap();
        let err = req.set("vxlan_id", 5).unwrap_err();
        assert!(matches!(err, Error::InvalidAttribute(_)));
    }

    #[test]
    fn test_unknown_kind() {
        let mut req = LinkRequest::new();
        let err = req.set("kind", "frobnicator").unwrap_err();
        assert!(matches!(err, Error::CommitFailed { .. }));
        assert!(err.to_string().contains("unknown kind"));
    }

    #[test]
    fn test_veth_peer_round_trip() {
        let mut req = LinkRequest::new();
        req.set("ifname", "v0p0")
            .unwrap()
            .set("peer", "v0p1")
            .unwrap()
            .set("kind", "veth")
            .unwrap();
        assert_eq!(req.peer(), Some("v0p1"));

        let msg = req
            .build(NlMsgType::RTM_NEWLINK, NLM_F_CREATE | NLM_F_EXCL)
            .unwrap();
        let decoded = Message::decode(&msg.encode(), &REGISTRY).unwrap();
        assert_eq!(decoded.encode(), msg.encode());
        let peer = decoded
            .get_nested(&["IFLA_LINKINFO", "IFLA_INFO_DATA", "VETH_INFO_PEER"])
            .and_then(AttrValue::as_body)
            .unwrap();
        assert_eq!(peer.ifname(), Some("v0p1"));
    }

    #[test]
    fn test_flag_bag() {
        let mut req = LinkRequest::for_index(3);
        req.set("up", true)
            .unwrap()
            .set("arp", false)
            .unwrap()
            .set("running", true)
            .unwrap();
        let msg = req.build(NlMsgType::RTM_SETLINK, 0).unwrap();
        assert_eq!(msg.ifindex(), 3);
        assert_eq!(msg.field("flags"), Some((iff::UP | iff::NOARP) as u64));
        assert_eq!(msg.field("change"), Some((iff::UP | iff::NOARP) as u64));
    }

    #[test]
    fn test_down_clears_bit_in_mask() {
        let mut req = LinkRequest::for_index(3);
        req.set("state", "down").unwrap();
        let msg = req.build(NlMsgType::RTM_SETLINK, 0).unwrap();
        assert_eq!(msg.field("flags"), Some(0));
        assert_eq!(msg.field("change"), Some(iff::UP as u64));
    }

    #[test]
    fn test_link_fields() {
        let mut req = LinkRequest::for_index(7);
        req.set("ifname", "br0")
            .unwrap()
            .set("mtu", 1400)
            .unwrap()
            .set("address", "aa:bb:cc:dd:ee:ff")
            .unwrap()
            .set("kind", "bridge")
            .unwrap()
            .set("stp_state", 1)
            .unwrap();
        let msg = req.build(NlMsgType::RTM_NEWLINK, 0).unwrap();
        let fields = link_fields(&msg);
        assert_eq!(fields["index"], Value::Int(7));
        assert_eq!(fields["ifname"], Value::from("br0"));
        assert_eq!(fields["mtu"], Value::Int(1400));
        assert_eq!(fields["address"], Value::from("aa:bb:cc:dd:ee:ff"));
        assert_eq!(fields["kind"], Value::from("bridge"));
        assert_eq!(fields["br_stp_state"], Value::Int(1));
        assert_eq!(fields["master"], Value::Int(0));
    }

    #[test]
    fn test_unknown_info_data_stays_opaque() {
        let mut msg = Message::new(&IFINFOMSG, NlMsgType::RTM_NEWLINK, 0);
        msg.push(
            "IFLA_LINKINFO",
            AttrValue::Nested(vec![
                Attribute::named(&LINKINFO_ATTRS, "IFLA_INFO_KIND", AttrValue::Str("wireguard".into()))
                    .unwrap(),
                Attribute::named(&LINKINFO_ATTRS, "IFLA_INFO_DATA", AttrValue::Hex(vec![4, 0, 1, 0]))
                    .unwrap(),
            ]),
        )
        .unwrap();
        let bytes = msg.encode();
        let decoded = Message::decode(&bytes, &REGISTRY).unwrap();
        assert_eq!(decoded.link_kind(), Some("wireguard"));
        assert_eq!(decoded.encode(), bytes);
    }
}
