//! Traffic control: `tcmsg`, `TCA_*` and per-kind options.
//!
//! Qdiscs, classes and filters share one message layout; [`TcObject`]
//! picks the message types. Options are given as a flat key/value map and
//! encoded according to `kind`:
//!
//! | kind | keys |
//! |---|---|
//! | `htb` qdisc | `default`, `r2q`, `direct_qlen` |
//! | `htb` class | `rate`, `ceil`, `burst`, `cburst`, `prio`, `quantum`, `mtu`, `mpu`, `overhead` |
//! | `tbf` | `rate`, `burst`, `limit` or `latency`, `mtu`, `peakrate`, `mpu` |
//! | `sfq` | `quantum`, `perturb`, `limit`, `divisor`, `flows` |
//! | `pfifo`, `bfifo` | `limit` |
//! | `fw` filter | `classid`, `mask`, `indev`, `prio` |
//!
//! Rates accept `"1mbit"`-style strings or a number of bits per second,
//! sizes accept `"10kb"` or bytes, times accept `"50ms"` or seconds.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::netlink::codec::{AttrValue, Attribute, Body, Message, Record};
use crate::netlink::connection::Connection;
use crate::netlink::message::{NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NlMsgHdr, NlMsgType};
use crate::netlink::schema::{
    AttrKind as K, AttrSchema, FieldKind as F, KindTable, MessageSchema, RecordSpec, attr, field,
};
use crate::netlink::{Error, Result};
use crate::value::Value;

/// Well-known handles.
pub const TC_H_ROOT: u32 = 0xFFFF_FFFF;
pub const TC_H_INGRESS: u32 = 0xFFFF_FFF1;
pub const TC_H_UNSPEC: u32 = 0;

const TIME_UNITS_PER_SEC: f64 = 1_000_000.0;
const DEFAULT_MTU: u32 = 1600;
const RTAB_CELLS: usize = 256;

static TC_HTB_OPT: RecordSpec = RecordSpec {
    name: "tc_htb_opt",
    fields: &[
        // tc_ratespec rate, ceil
        field("rate_cell_log", F::U8),
        field("rate_linklayer", F::U8),
        field("rate_overhead", F::U16),
        field("rate_cell_align", F::U16),
        field("rate_mpu", F::U16),
        field("rate_rate", F::U32),
        field("ceil_cell_log", F::U8),
        field("ceil_linklayer", F::U8),
        field("ceil_overhead", F::U16),
        field("ceil_cell_align", F::U16),
        field("ceil_mpu", F::U16),
        field("ceil_rate", F::U32),
        field("buffer", F::U32),
        field("cbuffer", F::U32),
        field("quantum", F::U32),
        field("level", F::U32),
        field("prio", F::U32),
    ],
};

static TC_HTB_GLOB: RecordSpec = RecordSpec {
    name: "tc_htb_glob",
    fields: &[
        field("version", F::U32),
        field("rate2quantum", F::U32),
        field("defcls", F::U32),
        field("debug", F::U32),
        field("direct_pkts", F::U32),
    ],
};

static TC_TBF_QOPT: RecordSpec = RecordSpec {
    name: "tc_tbf_qopt",
    fields: &[
        // tc_ratespec rate, peakrate
        field("rate_cell_log", F::U8),
        field("rate_linklayer", F::U8),
        field("rate_overhead", F::U16),
        field("rate_cell_align", F::U16),
        field("rate_mpu", F::U16),
        field("rate_rate", F::U32),
        field("peak_cell_log", F::U8),
        field("peak_linklayer", F::U8),
        field("peak_overhead", F::U16),
        field("peak_cell_align", F::U16),
        field("peak_mpu", F::U16),
        field("peak_rate", F::U32),
        field("limit", F::U32),
        field("buffer", F::U32),
        field("mtu", F::U32),
    ],
};

static TC_SFQ_QOPT: RecordSpec = RecordSpec {
    name: "tc_sfq_qopt",
    fields: &[
        field("quantum", F::U32),
        field("perturb_period", F::I32),
        field("limit", F::U32),
        field("divisor", F::U32),
        field("flows", F::U32),
    ],
};

static TC_FIFO_QOPT: RecordSpec = RecordSpec {
    name: "tc_fifo_qopt",
    fields: &[field("limit", F::U32)],
};

/// `struct tc_stats`, padded to its 8-byte alignment.
static TC_STATS: RecordSpec = RecordSpec {
    name: "tc_stats",
    fields: &[
        field("bytes", F::U64),
        field("packets", F::U32),
        field("drops", F::U32),
        field("overlimits", F::U32),
        field("bps", F::U32),
        field("pps", F::U32),
        field("qlen", F::U32),
        field("backlog", F::U32),
        field("pad", F::U32),
    ],
};

pub static HTB_ATTRS: AttrSchema = AttrSchema {
    name: "tca_htb",
    attrs: &[
        attr(1, "TCA_HTB_PARMS", K::Record(&TC_HTB_OPT)),
        attr(2, "TCA_HTB_INIT", K::Record(&TC_HTB_GLOB)),
        attr(3, "TCA_HTB_CTAB", K::Hex),
        attr(4, "TCA_HTB_RTAB", K::Hex),
        attr(5, "TCA_HTB_DIRECT_QLEN", K::U32),
        attr(6, "TCA_HTB_RATE64", K::U64),
        attr(7, "TCA_HTB_CEIL64", K::U64),
    ],
};

pub static TBF_ATTRS: AttrSchema = AttrSchema {
    name: "tca_tbf",
    attrs: &[
        attr(1, "TCA_TBF_PARMS", K::Record(&TC_TBF_QOPT)),
        attr(2, "TCA_TBF_RTAB", K::Hex),
        attr(3, "TCA_TBF_PTAB", K::Hex),
        attr(4, "TCA_TBF_RATE64", K::U64),
        attr(5, "TCA_TBF_PRATE64", K::U64),
        attr(6, "TCA_TBF_BURST", K::U32),
        attr(7, "TCA_TBF_PBURST", K::U32),
    ],
};

pub static FW_ATTRS: AttrSchema = AttrSchema {
    name: "tca_fw",
    attrs: &[
        attr(1, "TCA_FW_CLASSID", K::U32),
        attr(2, "TCA_FW_POLICE", K::Hex),
        attr(3, "TCA_FW_INDEV", K::AsciiZ),
        attr(4, "TCA_FW_ACT", K::Hex),
        attr(5, "TCA_FW_MASK", K::U32),
    ],
};

static OPTIONS_KINDS: KindTable = KindTable {
    selector: 1,
    kinds: &[
        ("htb", K::Nested(&HTB_ATTRS)),
        ("tbf", K::Nested(&TBF_ATTRS)),
        ("sfq", K::Record(&TC_SFQ_QOPT)),
        ("pfifo", K::Record(&TC_FIFO_QOPT)),
        ("bfifo", K::Record(&TC_FIFO_QOPT)),
        ("fw", K::Nested(&FW_ATTRS)),
    ],
};

pub static TCA_ATTRS: AttrSchema = AttrSchema {
    name: "tca",
    attrs: &[
        attr(1, "TCA_KIND", K::AsciiZ),
        attr(2, "TCA_OPTIONS", K::ByKind(&OPTIONS_KINDS)),
        attr(3, "TCA_STATS", K::Record(&TC_STATS)),
        attr(4, "TCA_XSTATS", K::Hex),
        attr(5, "TCA_RATE", K::Hex),
        attr(6, "TCA_FCNT", K::U32),
        attr(7, "TCA_STATS2", K::Hex),
        attr(8, "TCA_STAB", K::Hex),
        attr(10, "TCA_DUMP_INVISIBLE", K::Flag),
        attr(11, "TCA_CHAIN", K::U32),
        attr(12, "TCA_HW_OFFLOAD", K::U8),
        attr(13, "TCA_INGRESS_BLOCK", K::U32),
        attr(14, "TCA_EGRESS_BLOCK", K::U32),
    ],
};

/// `struct tcmsg` followed by `TCA_*`.
pub static TCMSG: MessageSchema = MessageSchema {
    name: "tcmsg",
    fields: &[
        field("family", F::U8),
        field("pad1", F::U8),
        field("pad2", F::U16),
        field("ifindex", F::I32),
        field("handle", F::U32),
        field("parent", F::U32),
        field("info", F::U32),
    ],
    attrs: &TCA_ATTRS,
    opaque_tail: false,
    self_sized: false,
};

/// Parse `"major:minor"` (hex), `"root"`, `"ingress"` or `"none"`.
pub fn parse_handle(s: &str) -> Result<u32> {
    let invalid = || Error::Parse(format!("invalid tc handle: {s}"));
    match s {
        "root" => return Ok(TC_H_ROOT),
        "ingress" => return Ok(TC_H_INGRESS),
        "none" | "" => return Ok(TC_H_UNSPEC),
        _ => {}
    }
    let (major, minor) = s.split_once(':').ok_or_else(invalid)?;
    let part = |p: &str| -> Result<u32> {
        if p.is_empty() {
            return Ok(0);
        }
        u16::from_str_radix(p, 16)
            .map(u32::from)
            .map_err(|_| invalid())
    };
    Ok((part(major)? << 16) | part(minor)?)
}

/// Render a handle the way `tc` prints it.
pub fn format_handle(handle: u32) -> String {
    match handle {
        TC_H_ROOT => "root".to_string(),
        TC_H_INGRESS => "ingress".to_string(),
        TC_H_UNSPEC => "none".to_string(),
        h => format!("{:x}:{:x}", h >> 16, h & 0xffff),
    }
}

fn split_number_unit(s: &str) -> (&str, &str) {
    let idx = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    (&s[..idx], &s[idx..])
}

fn scaled(s: &str, what: &str, unit: impl Fn(&str) -> Option<f64>) -> Result<f64> {
    let lower = s.trim().to_ascii_lowercase();
    let (num, suffix) = split_number_unit(&lower);
    let num: f64 = num
        .parse()
        .map_err(|_| Error::Parse(format!("invalid {what}: {s}")))?;
    let mult = unit(suffix).ok_or_else(|| Error::Parse(format!("unknown {what} unit: {s}")))?;
    Ok(num * mult)
}

/// Rate in bytes per second from `"1mbit"`, `"100kbps"` or bits per second.
pub fn parse_rate(v: &Value) -> Result<u64> {
    if let Value::Int(bits) = v {
        return Ok((*bits).max(0) as u64 / 8);
    }
    let bits = scaled(&v.to_string(), "rate", |u| {
        Some(match u {
            "" | "bit" => 1.0,
            "kbit" => 1e3,
            "mbit" => 1e6,
            "gbit" => 1e9,
            "tbit" => 1e12,
            "bps" => 8.0,
            "kbps" => 8e3,
            "mbps" => 8e6,
            "gbps" => 8e9,
            _ => return None,
        })
    })?;
    Ok((bits / 8.0) as u64)
}

/// Size in bytes from `"10kb"`, `"1mb"` or bytes.
pub fn parse_size(v: &Value) -> Result<u64> {
    if let Value::Int(n) = v {
        return Ok((*n).max(0) as u64);
    }
    let bytes = scaled(&v.to_string(), "size", |u| {
        Some(match u {
            "" | "b" => 1.0,
            "k" | "kb" => 1024.0,
            "m" | "mb" => 1024.0 * 1024.0,
            "g" | "gb" => 1024.0 * 1024.0 * 1024.0,
            "kbit" => 1024.0 / 8.0,
            "mbit" => 1024.0 * 1024.0 / 8.0,
            _ => return None,
        })
    })?;
    Ok(bytes as u64)
}

/// Duration from `"50ms"`, `"10us"` or seconds.
pub fn parse_time(v: &Value) -> Result<Duration> {
    if let Value::Int(n) = v {
        return Ok(Duration::from_secs((*n).max(0) as u64));
    }
    let s = v.to_string();
    let lower = s.trim().to_ascii_lowercase();
    let (num, unit) = split_number_unit(&lower);
    let num: f64 = num
        .parse()
        .map_err(|_| Error::Parse(format!("invalid time: {s}")))?;
    let per_sec = match unit {
        "" | "s" | "sec" | "secs" => 1.0,
        "ms" | "msec" | "msecs" => 1e3,
        "us" | "usec" | "usecs" => 1e6,
        _ => return Err(Error::Parse(format!("unknown time unit: {s}"))),
    };
    Ok(Duration::from_secs_f64(num / per_sec))
}

/// Kernel packet scheduler clock, from `/proc/net/psched`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Psched {
    /// Scheduler ticks per microsecond.
    pub tick_in_usec: f64,
    pub hz: u32,
}

impl Default for Psched {
    fn default() -> Self {
        Self {
            tick_in_usec: 15.625,
            hz: 1000,
        }
    }
}

impl Psched {
    pub const PATH: &'static str = "/proc/net/psched";

    /// Read the kernel clock; the defaults apply when it is unavailable.
    pub fn load() -> Self {
        std::fs::read_to_string(Self::PATH)
            .ok()
            .and_then(|s| Self::parse(&s))
            .unwrap_or_default()
    }

    /// Parse the four hex words of `/proc/net/psched`.
    pub fn parse(s: &str) -> Option<Self> {
        let words: Vec<u32> = s
            .split_whitespace()
            .map(|w| u32::from_str_radix(w, 16))
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        let [mut t2us, us2t, clock_res, hz] = words[..] else {
            return None;
        };
        if us2t == 0 || clock_res == 0 {
            return None;
        }
        // Nanosecond clocks advertise a multiplier of 1000 that really is 1.
        if clock_res == 1_000_000_000 {
            t2us = us2t;
        }
        let clock_factor = clock_res as f64 / TIME_UNITS_PER_SEC;
        Some(Self {
            tick_in_usec: t2us as f64 / us2t as f64 * clock_factor,
            hz: if (1..=100_000).contains(&hz) { hz } else { 1000 },
        })
    }

    /// Ticks needed to send `size` bytes at `rate` bytes per second.
    pub fn xmit_time(&self, rate: u64, size: u64) -> u32 {
        if rate == 0 {
            return 0;
        }
        let usec = TIME_UNITS_PER_SEC * (size as f64 / rate as f64);
        (usec * self.tick_in_usec).min(u32::MAX as f64) as u32
    }

    /// 256-cell transmission time table and its `cell_log`.
    pub fn rate_table(&self, rate: u64, mtu: u32, mpu: u32) -> (Vec<u8>, u8) {
        let mut cell_log = 0u8;
        while (mtu >> cell_log) > 255 {
            cell_log += 1;
        }
        let mut table = Vec::with_capacity(RTAB_CELLS * 4);
        for i in 0..RTAB_CELLS as u64 {
            let size = ((i + 1) << cell_log).max(mpu as u64);
            table.extend_from_slice(&self.xmit_time(rate, size).to_ne_bytes());
        }
        (table, cell_log)
    }
}

/// Which tc object a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcObject {
    Qdisc,
    Class,
    Filter,
}

impl TcObject {
    fn types(self) -> (u16, u16, u16) {
        match self {
            TcObject::Qdisc => (
                NlMsgType::RTM_NEWQDISC,
                NlMsgType::RTM_DELQDISC,
                NlMsgType::RTM_GETQDISC,
            ),
            TcObject::Class => (
                NlMsgType::RTM_NEWTCLASS,
                NlMsgType::RTM_DELTCLASS,
                NlMsgType::RTM_GETTCLASS,
            ),
            TcObject::Filter => (
                NlMsgType::RTM_NEWTFILTER,
                NlMsgType::RTM_DELTFILTER,
                NlMsgType::RTM_GETTFILTER,
            ),
        }
    }
}

/// Builder for qdisc, class and filter messages.
#[derive(Debug, Clone, PartialEq)]
pub struct TcRequest {
    ifindex: u32,
    handle: u32,
    parent: u32,
    kind: Option<String>,
    /// Filter ethertype, packed into `tcm_info` with the `prio` option.
    protocol: u16,
    options: BTreeMap<String, Value>,
    psched: Psched,
}

impl TcRequest {
    /// A request on `ifindex` attached to the root.
    pub fn new(ifindex: u32) -> Self {
        Self {
            ifindex,
            handle: TC_H_UNSPEC,
            parent: TC_H_ROOT,
            kind: None,
            protocol: libc::ETH_P_ALL as u16,
            options: BTreeMap::new(),
            psched: Psched::load(),
        }
    }

    /// Use a fixed scheduler clock instead of the kernel's.
    pub fn with_psched(mut self, psched: Psched) -> Self {
        self.psched = psched;
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// `ifindex`, `handle`, `parent`, `kind` and `protocol` shape the
    /// header; every other key is an option of the kind. A filter's `prio`
    /// goes to the header as well.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let value = value.into();
        let handle = |v: &Value| match v {
            Value::Int(n) => u32::try_from(*n)
                .map_err(|_| Error::InvalidAttribute(format!("{key}: {v}"))),
            other => parse_handle(&other.to_string()),
        };
        match key {
            "ifindex" | "index" => {
                self.ifindex = value
                    .as_u32()
                    .ok_or_else(|| Error::InvalidAttribute(format!("ifindex: {value}")))?;
            }
            "handle" => self.handle = handle(&value)?,
            "parent" => self.parent = handle(&value)?,
            "kind" => self.kind = Some(value.to_string()),
            "protocol" => {
                self.protocol = match value.as_str() {
                    Some("all") => libc::ETH_P_ALL as u16,
                    Some("ip") => libc::ETH_P_IP as u16,
                    Some("ipv6") => libc::ETH_P_IPV6 as u16,
                    _ => value
                        .as_int()
                        .and_then(|v| u16::try_from(v).ok())
                        .ok_or_else(|| Error::InvalidAttribute(format!("protocol: {value}")))?,
                };
            }
            _ => {
                self.options.insert(key.to_string(), value);
            }
        }
        Ok(self)
    }

    fn opt<T>(&self, key: &str, parse: impl Fn(&Value) -> Result<T>) -> Result<Option<T>> {
        self.options.get(key).map(parse).transpose()
    }

    fn opt_u32(&self, key: &str) -> Result<Option<u32>> {
        self.opt(key, |v| {
            v.as_u32()
                .ok_or_else(|| Error::InvalidAttribute(format!("{key}: {v}")))
        })
    }

    fn check_keys(&self, kind: &str, allowed: &[&str]) -> Result<()> {
        match self.options.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(key) => Err(Error::InvalidAttribute(format!(
                "{kind} has no option {key}"
            ))),
            None => Ok(()),
        }
    }

    fn options_attr(&self, object: TcObject) -> Result<Option<AttrValue>> {
        let Some(kind) = self.kind.as_deref() else {
            return Ok(None);
        };
        let value = match (kind, object) {
            ("htb", TcObject::Qdisc) => Some(self.htb_qdisc()?),
            ("htb", TcObject::Class) => Some(self.htb_class()?),
            ("tbf", _) => Some(self.tbf()?),
            ("sfq", _) => Some(self.sfq()?),
            ("pfifo" | "bfifo", _) => {
                self.check_keys(kind, &["limit"])?;
                let mut r = Record::new(&TC_FIFO_QOPT);
                if let Some(limit) = self.opt(
                    "limit",
                    |v| if kind == "bfifo" { parse_size(v) } else { self.size_or_count(v) },
                )? {
                    r.set("limit", limit)?;
                }
                Some(AttrValue::Record(r))
            }
            ("fw", _) => Some(self.fw()?),
            _ if self.options.is_empty() => None,
            _ => {
                return Err(Error::NotSupported(format!("options of tc kind {kind}")));
            }
        };
        Ok(value)
    }

    fn size_or_count(&self, v: &Value) -> Result<u64> {
        v.as_int()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| Error::InvalidAttribute(format!("limit: {v}")))
    }

    fn htb_qdisc(&self) -> Result<AttrValue> {
        self.check_keys("htb", &["default", "r2q", "direct_qlen"])?;
        let mut glob = Record::new(&TC_HTB_GLOB);
        glob.set("version", 3)?;
        glob.set("rate2quantum", self.opt_u32("r2q")?.unwrap_or(10) as u64)?;
        // `default 10` names class 1:10, as with tc
        let defcls = self.opt("default", |v| {
            u64::from_str_radix(&v.to_string(), 16)
                .map_err(|_| Error::Parse(format!("htb default class: {v}")))
        })?;
        glob.set("defcls", defcls.unwrap_or(0))?;
        let mut attrs = vec![Attribute::named(&HTB_ATTRS, "TCA_HTB_INIT", AttrValue::Record(glob))?];
        if let Some(qlen) = self.opt_u32("direct_qlen")? {
            attrs.push(Attribute::named(&HTB_ATTRS, "TCA_HTB_DIRECT_QLEN", AttrValue::U32(qlen))?);
        }
        Ok(AttrValue::Nested(attrs))
    }

    fn htb_class(&self) -> Result<AttrValue> {
        self.check_keys(
            "htb",
            &["rate", "ceil", "burst", "cburst", "prio", "quantum", "mtu", "mpu", "overhead"],
        )?;
        let rate = self
            .opt("rate", parse_rate)?
            .ok_or_else(|| Error::InvalidAttribute("htb class needs a rate".into()))?;
        let ceil = self.opt("ceil", parse_rate)?.unwrap_or(rate);
        let mtu = self.opt_u32("mtu")?.unwrap_or(DEFAULT_MTU);
        let mpu = self.opt_u32("mpu")?.unwrap_or(0);
        let hz = self.psched.hz as u64;
        let burst = self.opt("burst", parse_size)?.unwrap_or(rate / hz + mtu as u64);
        let cburst = self.opt("cburst", parse_size)?.unwrap_or(ceil / hz + mtu as u64);

        let (rtab, cell_log) = self.psched.rate_table(rate, mtu, mpu);
        let (ctab, ccell_log) = self.psched.rate_table(ceil, mtu, mpu);

        let mut opt = Record::new(&TC_HTB_OPT);
        opt.set("rate_rate", rate.min(u32::MAX as u64))?;
        opt.set("rate_cell_log", cell_log as u64)?;
        opt.set("rate_mpu", mpu as u64)?;
        opt.set("ceil_rate", ceil.min(u32::MAX as u64))?;
        opt.set("ceil_cell_log", ccell_log as u64)?;
        opt.set("ceil_mpu", mpu as u64)?;
        if let Some(overhead) = self.opt_u32("overhead")? {
            opt.set("rate_overhead", overhead as u64)?;
            opt.set("ceil_overhead", overhead as u64)?;
        }
        opt.set("buffer", self.psched.xmit_time(rate, burst) as u64)?;
        opt.set("cbuffer", self.psched.xmit_time(ceil, cburst) as u64)?;
        opt.set("quantum", self.opt_u32("quantum")?.unwrap_or(0) as u64)?;
        opt.set("prio", self.opt_u32("prio")?.unwrap_or(0) as u64)?;

        let mut attrs = Vec::new();
        if rate > u32::MAX as u64 {
            attrs.push(Attribute::named(&HTB_ATTRS, "TCA_HTB_RATE64", AttrValue::U64(rate))?);
        }
        if ceil > u32::MAX as u64 {
            attrs.push(Attribute::named(&HTB_ATTRS, "TCA_HTB_CEIL64", AttrValue::U64(ceil))?);
        }
        attrs.push(Attribute::named(&HTB_ATTRS, "TCA_HTB_PARMS", AttrValue::Record(opt))?);
        attrs.push(Attribute::named(&HTB_ATTRS, "TCA_HTB_RTAB", AttrValue::Hex(rtab))?);
        attrs.push(Attribute::named(&HTB_ATTRS, "TCA_HTB_CTAB", AttrValue::Hex(ctab))?);
        Ok(AttrValue::Nested(attrs))
    }

    fn tbf(&self) -> Result<AttrValue> {
        self.check_keys("tbf", &["rate", "burst", "limit", "latency", "mtu", "peakrate", "mpu"])?;
        let need = |what: &str| Error::InvalidAttribute(format!("tbf needs {what}"));
        let rate = self.opt("rate", parse_rate)?.ok_or_else(|| need("a rate"))?;
        let burst = self.opt("burst", parse_size)?.ok_or_else(|| need("a burst"))?;
        let mtu = self.opt_u32("mtu")?.unwrap_or(DEFAULT_MTU);
        let mpu = self.opt_u32("mpu")?.unwrap_or(0);
        let peakrate = self.opt("peakrate", parse_rate)?;
        let limit = match (
            self.opt("limit", parse_size)?,
            self.opt("latency", parse_time)?,
        ) {
            (Some(limit), _) => limit,
            (None, Some(latency)) => {
                let mut limit = rate as f64 * latency.as_secs_f64() + burst as f64;
                if let Some(peak) = peakrate {
                    limit = limit.min(peak as f64 * latency.as_secs_f64() + mtu as f64);
                }
                limit as u64
            }
            (None, None) => return Err(need("a limit or latency")),
        };

        let (rtab, cell_log) = self.psched.rate_table(rate, mtu, mpu);
        let mut qopt = Record::new(&TC_TBF_QOPT);
        qopt.set("rate_rate", rate.min(u32::MAX as u64))?;
        qopt.set("rate_cell_log", cell_log as u64)?;
        qopt.set("rate_mpu", mpu as u64)?;
        qopt.set("limit", limit)?;
        qopt.set("buffer", self.psched.xmit_time(rate, burst) as u64)?;

        let mut attrs = Vec::new();
        let mut ptab = None;
        if let Some(peak) = peakrate {
            let (table, peak_log) = self.psched.rate_table(peak, mtu, mpu);
            qopt.set("peak_rate", peak.min(u32::MAX as u64))?;
            qopt.set("peak_cell_log", peak_log as u64)?;
            qopt.set("peak_mpu", mpu as u64)?;
            qopt.set("mtu", self.psched.xmit_time(peak, mtu as u64) as u64)?;
            ptab = Some(table);
        }
        attrs.push(Attribute::named(&TBF_ATTRS, "TCA_TBF_PARMS", AttrValue::Record(qopt))?);
        if rate > u32::MAX as u64 {
            attrs.push(Attribute::named(&TBF_ATTRS, "TCA_TBF_RATE64", AttrValue::U64(rate))?);
        }
        attrs.push(Attribute::named(
            &TBF_ATTRS,
            "TCA_TBF_BURST",
            AttrValue::U32(burst.min(u32::MAX as u64) as u32),
        )?);
        attrs.push(Attribute::named(&TBF_ATTRS, "TCA_TBF_RTAB", AttrValue::Hex(rtab))?);
        if let Some(table) = ptab {
            attrs.push(Attribute::named(&TBF_ATTRS, "TCA_TBF_PTAB", AttrValue::Hex(table))?);
        }
        Ok(AttrValue::Nested(attrs))
    }

    fn sfq(&self) -> Result<AttrValue> {
        self.check_keys("sfq", &["quantum", "perturb", "limit", "divisor", "flows"])?;
        let mut qopt = Record::new(&TC_SFQ_QOPT);
        if let Some(quantum) = self.opt("quantum", parse_size)? {
            qopt.set("quantum", quantum)?;
        }
        if let Some(perturb) = self.opt("perturb", parse_time)? {
            qopt.set("perturb_period", perturb.as_secs())?;
        }
        qopt.set("limit", self.opt_u32("limit")?.unwrap_or(127) as u64)?;
        qopt.set("divisor", self.opt_u32("divisor")?.unwrap_or(0) as u64)?;
        qopt.set("flows", self.opt_u32("flows")?.unwrap_or(0) as u64)?;
        Ok(AttrValue::Record(qopt))
    }

    fn fw(&self) -> Result<AttrValue> {
        self.check_keys("fw", &["classid", "mask", "indev", "prio"])?;
        let mut attrs = Vec::new();
        if let Some(classid) = self.opt("classid", |v| parse_handle(&v.to_string()))? {
            attrs.push(Attribute::named(&FW_ATTRS, "TCA_FW_CLASSID", AttrValue::U32(classid))?);
        }
        if let Some(mask) = self.opt_u32("mask")? {
            attrs.push(Attribute::named(&FW_ATTRS, "TCA_FW_MASK", AttrValue::U32(mask))?);
        }
        if let Some(dev) = self.options.get("indev") {
            attrs.push(Attribute::named(&FW_ATTRS, "TCA_FW_INDEV", AttrValue::Str(dev.to_string()))?);
        }
        Ok(AttrValue::Nested(attrs))
    }

    pub fn build(&self, object: TcObject, msg_type: u16, flags: u16) -> Result<Message> {
        let mut msg = Message {
            header: NlMsgHdr::new(msg_type, flags),
            body: Body::new(&TCMSG),
        };
        msg.set_field("ifindex", self.ifindex as u64)?;
        msg.set_field("handle", self.handle as u64)?;
        msg.set_field("parent", self.parent as u64)?;
        if object == TcObject::Filter {
            let prio = self.opt_u32("prio")?.unwrap_or(0) & 0xffff;
            let info = (prio << 16) | self.protocol.to_be() as u32;
            msg.set_field("info", info as u64)?;
        }
        if let Some(kind) = &self.kind {
            msg.push("TCA_KIND", AttrValue::Str(kind.clone()))?;
        }
        if let Some(options) = self.options_attr(object)? {
            msg.push("TCA_OPTIONS", options)?;
        }
        Ok(msg)
    }
}

impl Connection {
    /// Dump qdiscs, classes or filters. Classes and filters are per link.
    pub async fn get_tc(&self, object: TcObject, ifindex: u32) -> Result<Vec<Message>> {
        let (_, _, get) = object.types();
        let mut msg = Message::new(&TCMSG, get, 0);
        msg.set_field("ifindex", ifindex as u64)?;
        self.dump(msg).await
    }

    /// Add a tc object; `replace` overwrites an existing one.
    pub async fn add_tc(&self, object: TcObject, req: &TcRequest, replace: bool) -> Result<()> {
        let (new, _, _) = object.types();
        let flags = if replace {
            NLM_F_CREATE | NLM_F_REPLACE
        } else {
            NLM_F_CREATE | NLM_F_EXCL
        };
        let msg = req.build(object, new, flags)?;
        self.request(msg).await.map_err(|e| {
            e.with_context(format!(
                "adding {object:?} {} on link {}",
                format_handle(req.handle),
                req.ifindex
            ))
        })?;
        Ok(())
    }

    pub async fn del_tc(&self, object: TcObject, req: &TcRequest) -> Result<()> {
        let (_, del, _) = object.types();
        let msg = req.build(object, del, 0)?;
        self.request(msg).await.map_err(|e| {
            e.with_context(format!(
                "deleting {object:?} {} on link {}",
                format_handle(req.handle),
                req.ifindex
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtnl::REGISTRY;

    fn clock() -> Psched {
        Psched {
            tick_in_usec: 1.0,
            hz: 1000,
        }
    }

    #[test]
    fn test_handles() {
        assert_eq!(parse_handle("1:0").unwrap(), 0x1_0000);
        assert_eq!(parse_handle("ffff:").unwrap(), 0xffff_0000);
        assert_eq!(parse_handle("1:a").unwrap(), 0x1_000a);
        assert_eq!(parse_handle("root").unwrap(), TC_H_ROOT);
        assert!(parse_handle("1").is_err());
        assert_eq!(format_handle(0x1_0010), "1:10");
    }

    #[test]
    fn test_units() {
        assert_eq!(parse_rate(&Value::from("1mbit")).unwrap(), 125_000);
        assert_eq!(parse_rate(&Value::from(8000)).unwrap(), 1000);
        assert_eq!(parse_size(&Value::from("10kb")).unwrap(), 10240);
        assert_eq!(
            parse_time(&Value::from("50ms")).unwrap(),
            Duration::from_millis(50)
        );
        assert!(parse_rate(&Value::from("1furlong")).is_err());
    }

    #[test]
    fn test_psched_parse() {
        let p = Psched::parse("000003e8 00000040 000f4240 3b9aca00\n").unwrap();
        assert_eq!(p.tick_in_usec, 15.625);
        let ns = Psched::parse("000003e8 00000040 3b9aca00 3b9aca00").unwrap();
        assert_eq!(ns.tick_in_usec, 1000.0);
        assert!(Psched::parse("garbage").is_none());
    }

    #[test]
    fn test_rate_table() {
        let (table, cell_log) = clock().rate_table(125_000, 1600, 0);
        assert_eq!(cell_log, 3);
        assert_eq!(table.len(), 1024);
        // 8 bytes at 125 kB/s take 64 us
        assert_eq!(u32::from_ne_bytes([table[0], table[1], table[2], table[3]]), 64);
    }

    #[test]
    fn test_htb_class() {
        let mut req = TcRequest::new(2).with_psched(clock());
        req.set("kind", "htb")
            .unwrap()
            .set("handle", "1:10")
            .unwrap()
            .set("parent", "1:0")
            .unwrap()
            .set("rate", "1mbit")
            .unwrap();
        let msg = req
            .build(TcObject::Class, NlMsgType::RTM_NEWTCLASS, NLM_F_CREATE)
            .unwrap();
        let decoded = Message::decode(&msg.encode(), &REGISTRY).unwrap();

        assert_eq!(decoded.field("handle"), Some(0x1_0010));
        assert_eq!(decoded.attr_str("TCA_KIND"), Some("htb"));
        match decoded.get_nested(&["TCA_OPTIONS", "TCA_HTB_PARMS"]) {
            Some(AttrValue::Record(r)) => {
                assert_eq!(r.get("rate_rate"), Some(125_000));
                assert_eq!(r.get("ceil_rate"), Some(125_000));
                assert_eq!(r.get("rate_cell_log"), Some(3));
            }
            other => panic!("unexpected parms: {other:?}"),
        }
        match decoded.get_nested(&["TCA_OPTIONS", "TCA_HTB_RTAB"]) {
            Some(AttrValue::Hex(t)) => assert_eq!(t.len(), 1024),
            other => panic!("unexpected rtab: {other:?}"),
        }
    }

    #[test]
    fn test_tbf_requires_limit() {
        let mut req = TcRequest::new(2).with_psched(clock());
        req.set("kind", "tbf")
            .unwrap()
            .set("rate", "8mbit")
            .unwrap()
            .set("burst", "10kb")
            .unwrap();
        assert!(req.build(TcObject::Qdisc, NlMsgType::RTM_NEWQDISC, 0).is_err());

        req.set("latency", "50ms").unwrap();
        let msg = req.build(TcObject::Qdisc, NlMsgType::RTM_NEWQDISC, 0).unwrap();
        match msg.get_nested(&["TCA_OPTIONS", "TCA_TBF_PARMS"]) {
            Some(AttrValue::Record(r)) => {
                // 1 MB/s * 50 ms + 10 KiB
                assert_eq!(r.get("limit"), Some(50_000 + 10_240));
            }
            other => panic!("unexpected parms: {other:?}"),
        }
    }

    #[test]
    fn test_sfq_and_fw() {
        let mut sfq = TcRequest::new(3).with_psched(clock());
        sfq.set("kind", "sfq").unwrap().set("perturb", 10).unwrap();
        let msg = sfq.build(TcObject::Qdisc, NlMsgType::RTM_NEWQDISC, 0).unwrap();
        let decoded = Message::decode(&msg.encode(), &REGISTRY).unwrap();
        match decoded.get_attr("TCA_OPTIONS") {
            Some(AttrValue::Record(r)) => {
                assert_eq!(r.get("perturb_period"), Some(10));
                assert_eq!(r.get("limit"), Some(127));
            }
            other => panic!("unexpected options: {other:?}"),
        }

        let mut fw = TcRequest::new(3).with_psched(clock());
        fw.set("kind", "fw")
            .unwrap()
            .set("handle", 5)
            .unwrap()
            .set("prio", 1)
            .unwrap()
            .set("protocol", "ip")
            .unwrap()
            .set("classid", "1:10")
            .unwrap();
        let msg = fw.build(TcObject::Filter, NlMsgType::RTM_NEWTFILTER, 0).unwrap();
        assert_eq!(
            msg.field("info"),
            Some(((1u32 << 16) | (libc::ETH_P_IP as u16).to_be() as u32) as u64)
        );
        assert_eq!(
            msg.get_nested(&["TCA_OPTIONS", "TCA_FW_CLASSID"]),
            Some(&AttrValue::U32(0x1_0010))
        );
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut req = TcRequest::new(1).with_psched(clock());
        req.set("kind", "sfq").unwrap().set("colour", "red").unwrap();
        assert!(req.build(TcObject::Qdisc, NlMsgType::RTM_NEWQDISC, 0).is_err());
    }
}
