//! Common test utilities for integration tests.
//!
//! `FakeKernel` answers rtnetlink requests from memory and multicasts the
//! resulting notifications, so the database can be driven without
//! privileges. `TestNamespace` isolates the tests that talk to the real
//! kernel.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ipdb::netlink::channel::{self, ChannelPeer};
use ipdb::netlink::message::{NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_MULTI, NLM_F_REPLACE};
use ipdb::netlink::namespace;
use ipdb::netlink::{AttrValue, Attribute, Body, Connection, Message, NlMsgHdr, NlMsgType};
use ipdb::rtnl::addr::{IFADDRMSG, address_key};
use ipdb::rtnl::link::{IFINFOMSG, LINKINFO_ATTRS, iff};
use ipdb::rtnl::route::{RouteRequest, route_key, route_table};
use ipdb::rtnl::{self, LinkExt, parse_prefix};
use ipdb::{Config, Ipdb};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Link kinds the fake kernel can create.
const KINDS: &[&str] = &["dummy", "veth", "bridge", "bond", "vlan"];

/// Replies are packed into datagrams of at most this size.
const DATAGRAM: usize = 8192;

/// Configuration with timeouts short enough for failing commits.
pub fn config() -> Config {
    Config::new()
        .commit_timeout(Duration::from_secs(1))
        .request_timeout(Duration::from_secs(2))
}

fn notice(msg_type: u16, body: &Body) -> Message {
    Message {
        header: NlMsgHdr::new(msg_type, 0),
        body: body.clone(),
    }
}

fn combine_flags(old: u32, new: u32, change: u32) -> u32 {
    let mut flags = (old & !change) | (new & change);
    if flags & iff::UP != 0 {
        flags |= iff::RUNNING | iff::LOWER_UP;
    } else {
        flags &= !(iff::RUNNING | iff::LOWER_UP);
    }
    flags
}

fn link_body(index: u32, name: &str, kind: Option<&str>, flags: u32) -> Body {
    let mut body = Body::new(&IFINFOMSG);
    body.set_field("index", index as u64).unwrap();
    body.set_field("flags", flags as u64).unwrap();
    body.set_field("ifi_type", 1).unwrap();
    body.push("IFLA_IFNAME", AttrValue::Str(name.to_string()))
        .unwrap();
    body.push("IFLA_MTU", AttrValue::U32(1500)).unwrap();
    body.push("IFLA_TXQLEN", AttrValue::U32(1000)).unwrap();
    body.push(
        "IFLA_ADDRESS",
        AttrValue::LlAddr([0x02, 0, 0, 0, (index >> 8) as u8, index as u8]),
    )
    .unwrap();
    if let Some(kind) = kind {
        let info = Attribute::named(
            &LINKINFO_ATTRS,
            "IFLA_INFO_KIND",
            AttrValue::Str(kind.to_string()),
        )
        .unwrap();
        body.push("IFLA_LINKINFO", AttrValue::Nested(vec![info]))
            .unwrap();
    }
    body
}

/// In-memory model of the kernel's rtnetlink state.
#[derive(Default)]
pub struct Kernel {
    pub links: BTreeMap<u32, Body>,
    pub addresses: Vec<Body>,
    pub routes: Vec<Body>,
    peers: BTreeMap<u32, u32>,
    next_index: u32,
    /// `(type, requests to let through first, errno)`.
    faults: Vec<(u16, usize, i32)>,
    /// Types whose next accepted request sends no notification.
    muted: Vec<u16>,
    /// Links that appear right before a create request for them.
    preempted: Vec<(String, String)>,
    /// The next address added to a bond disappears at once.
    bond_drops_address: bool,
    /// Every accepted request, in order.
    pub requests: Vec<Message>,
    /// Type of every request received, accepted or not.
    pub seen: Vec<u16>,
}

impl Kernel {
    fn seeded() -> Self {
        let mut kernel = Self {
            next_index: 1,
            ..Self::default()
        };
        let lo = link_body(1, "lo", None, iff::UP | iff::LOOPBACK | iff::RUNNING | iff::LOWER_UP);
        kernel.links.insert(1, lo);

        let mut addr = Body::new(&IFADDRMSG);
        addr.set_field("family", libc::AF_INET as u64).unwrap();
        addr.set_field("prefixlen", 8).unwrap();
        addr.set_field("index", 1).unwrap();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        addr.push("IFA_LOCAL", AttrValue::Ip(ip)).unwrap();
        addr.push("IFA_ADDRESS", AttrValue::Ip(ip)).unwrap();
        kernel.addresses.push(addr);
        kernel
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.links
            .iter()
            .find(|(_, body)| body.ifname() == Some(name))
            .map(|(index, _)| *index)
    }

    pub fn has_address(&self, index: u32, spec: &str) -> bool {
        let (ip, prefix) = parse_prefix(spec).unwrap();
        self.addresses
            .iter()
            .any(|a| address_key(a) == Some((index, ip, prefix)))
    }

    /// Number of accepted requests of a type.
    pub fn count(&self, msg_type: u16) -> usize {
        self.requests
            .iter()
            .filter(|m| m.msg_type() == msg_type)
            .count()
    }

    fn allocate(&mut self, requested: u32) -> u32 {
        if requested != 0 {
            return requested;
        }
        loop {
            self.next_index += 1;
            if !self.links.contains_key(&self.next_index) {
                return self.next_index;
            }
        }
    }

    /// Number of received requests of a type, failed ones included.
    pub fn received(&self, msg_type: u16) -> usize {
        self.seen.iter().filter(|t| **t == msg_type).count()
    }

    fn insert_link(&mut self, index: u32, name: &str, kind: &str) -> Body {
        let index = self.allocate(index);
        let body = link_body(index, name, Some(kind), iff::BROADCAST | iff::MULTICAST);
        self.links.insert(index, body.clone());
        body
    }

    /// Put `count` routes into the main table without notifications.
    pub fn insert_routes(&mut self, count: usize) {
        for i in 0..count {
            let dst = format!("10.{}.{}.0/24", 100 + i / 256, i % 256);
            let msg = RouteRequest::to(&dst)
                .unwrap()
                .build(NlMsgType::RTM_NEWROUTE, 0)
                .unwrap();
            self.routes.push(msg.body);
        }
    }

    fn handle(&mut self, req: &Message) -> (Vec<Message>, Vec<Message>) {
        self.seen.push(req.msg_type());
        let flags = req.header.nlmsg_flags;
        if NlMsgType::is_rtm_get(req.msg_type()) && flags & NLM_F_DUMP == NLM_F_DUMP {
            return (self.dump(req), Vec::new());
        }
        if let Some(pos) = self.faults.iter().position(|(t, _, _)| *t == req.msg_type()) {
            match &mut self.faults[pos] {
                (_, 0, errno) => {
                    let errno = *errno;
                    self.faults.remove(pos);
                    return (vec![Message::error(errno, req)], Vec::new());
                }
                (_, skip, _) => *skip -= 1,
            }
        }
        if req.msg_type() == NlMsgType::RTM_NEWLINK && flags & NLM_F_CREATE != 0 {
            let pos = req
                .ifname()
                .and_then(|name| self.preempted.iter().position(|(p, _)| p == name));
            if let Some(pos) = pos {
                let (name, kind) = self.preempted.remove(pos);
                let body = self.insert_link(0, &name, &kind);
                return (
                    vec![Message::error(libc::EEXIST, req)],
                    vec![notice(NlMsgType::RTM_NEWLINK, &body)],
                );
            }
        }
        match self.apply(req) {
            Ok(mut notices) => {
                self.requests.push(req.clone());
                if let Some(pos) = self.muted.iter().position(|t| *t == req.msg_type()) {
                    self.muted.remove(pos);
                    notices.clear();
                }
                (vec![Message::error(0, req)], notices)
            }
            Err(errno) => (vec![Message::error(errno, req)], Vec::new()),
        }
    }

    fn dump(&self, req: &Message) -> Vec<Message> {
        let bodies: Vec<&Body> = match req.msg_type() {
            NlMsgType::RTM_GETLINK => self.links.values().collect(),
            NlMsgType::RTM_GETADDR => self.addresses.iter().collect(),
            NlMsgType::RTM_GETROUTE => self.routes.iter().collect(),
            _ => Vec::new(),
        };
        let reply_type = req.msg_type() - 2;
        let mut replies: Vec<Message> = bodies
            .into_iter()
            .map(|body| {
                let mut msg = Message {
                    header: NlMsgHdr::new(reply_type, NLM_F_MULTI),
                    body: body.clone(),
                };
                msg.header.nlmsg_seq = req.seq();
                msg.header.nlmsg_pid = req.header.nlmsg_pid;
                msg
            })
            .collect();
        replies.push(Message::done(req.seq(), req.header.nlmsg_pid));
        replies
    }

    fn apply(&mut self, req: &Message) -> Result<Vec<Message>, i32> {
        let flags = req.header.nlmsg_flags;
        match req.msg_type() {
            NlMsgType::RTM_NEWLINK if flags & NLM_F_CREATE != 0 => self.new_link(req, flags),
            NlMsgType::RTM_NEWLINK | NlMsgType::RTM_SETLINK => {
                let index = match req.ifindex() {
                    0 => req
                        .ifname()
                        .and_then(|name| self.index_of(name))
                        .ok_or(libc::ENODEV)?,
                    index => index,
                };
                self.set_link(index, req)
            }
            NlMsgType::RTM_DELLINK => self.del_link(req.ifindex()),
            NlMsgType::RTM_NEWADDR => self.new_addr(req, flags),
            NlMsgType::RTM_DELADDR => self.del_addr(req),
            NlMsgType::RTM_NEWROUTE => self.new_route(req, flags),
            NlMsgType::RTM_DELROUTE => self.del_route(req),
            _ => Err(libc::EOPNOTSUPP),
        }
    }

    fn new_link(&mut self, req: &Message, flags: u16) -> Result<Vec<Message>, i32> {
        let name = req.ifname().ok_or(libc::EINVAL)?.to_string();
        if let Some(index) = self.index_of(&name) {
            if flags & NLM_F_EXCL != 0 {
                return Err(libc::EEXIST);
            }
            return self.set_link(index, req);
        }
        let kind = req.link_kind().map(str::to_string);
        if let Some(kind) = &kind {
            if !KINDS.contains(&kind.as_str()) {
                return Err(libc::EOPNOTSUPP);
            }
        }
        let requested = req.ifindex();
        if requested != 0 && self.links.contains_key(&requested) {
            return Err(libc::EEXIST);
        }

        let mut notices = Vec::new();
        let peer_name = req
            .get_nested(&["IFLA_LINKINFO", "IFLA_INFO_DATA", "VETH_INFO_PEER"])
            .and_then(AttrValue::as_body)
            .and_then(|peer| peer.ifname())
            .map(str::to_string);
        if kind.as_deref() == Some("veth") {
            let peer_name = peer_name.as_deref().ok_or(libc::EINVAL)?;
            if self.index_of(peer_name).is_some() {
                return Err(libc::EEXIST);
            }
        }

        let index = self.allocate(requested);
        let base = iff::BROADCAST | iff::MULTICAST;
        let mut body = link_body(index, &name, kind.as_deref(), base);
        let change = req.field_or_zero("change") as u32;
        body.set_field("flags", combine_flags(base, req.link_flags(), change) as u64)
            .unwrap();
        if kind.as_deref() != Some("veth") {
            if let Some(info) = req.get_attr("IFLA_LINKINFO") {
                body.set_attr("IFLA_LINKINFO", info.clone()).unwrap();
            }
        }
        self.copy_attrs(&mut body, req)?;
        self.links.insert(index, body.clone());
        notices.push(notice(NlMsgType::RTM_NEWLINK, &body));

        if let Some(peer_name) = peer_name.filter(|_| kind.as_deref() == Some("veth")) {
            let peer = self.allocate(0);
            let peer_body = link_body(peer, &peer_name, Some("veth"), base);
            self.links.insert(peer, peer_body.clone());
            self.peers.insert(index, peer);
            self.peers.insert(peer, index);
            notices.push(notice(NlMsgType::RTM_NEWLINK, &peer_body));
        }
        Ok(notices)
    }

    /// Copy scalar link attributes from a request.
    fn copy_attrs(&self, body: &mut Body, req: &Message) -> Result<(), i32> {
        for attr in &req.attrs {
            match attr.name {
                "IFLA_LINKINFO" | "IFLA_NET_NS_FD" | "IFLA_NET_NS_PID" => {}
                "IFLA_MASTER" => match attr.value.as_u64().unwrap_or(0) as u32 {
                    0 => body.remove_attr("IFLA_MASTER"),
                    master if self.links.contains_key(&master) => {
                        body.set_attr("IFLA_MASTER", AttrValue::U32(master)).unwrap();
                    }
                    _ => return Err(libc::ENODEV),
                },
                "IFLA_IFALIAS" if matches!(&attr.value, AttrValue::Str(s) if s.is_empty()) => {
                    body.remove_attr("IFLA_IFALIAS")
                }
                name => body.set_attr(name, attr.value.clone()).unwrap(),
            }
        }
        Ok(())
    }

    fn set_link(&mut self, index: u32, req: &Message) -> Result<Vec<Message>, i32> {
        let mut body = self.links.get(&index).cloned().ok_or(libc::ENODEV)?;
        if let Some(other) = req.ifname().and_then(|name| self.index_of(name)) {
            if other != index {
                return Err(libc::EEXIST);
            }
        }
        if req.get_attr("IFLA_NET_NS_FD").is_some() || req.get_attr("IFLA_NET_NS_PID").is_some() {
            return self.del_link(index);
        }
        let change = req.field_or_zero("change") as u32;
        let flags = combine_flags(body.link_flags(), req.link_flags(), change);
        body.set_field("flags", flags as u64).unwrap();
        self.copy_attrs(&mut body, req)?;
        self.links.insert(index, body.clone());
        Ok(vec![notice(NlMsgType::RTM_NEWLINK, &body)])
    }

    fn del_link(&mut self, index: u32) -> Result<Vec<Message>, i32> {
        let body = self.links.remove(&index).ok_or(libc::ENODEV)?;
        let mut notices = Vec::new();
        self.addresses.retain(|a| {
            let gone = a.field_or_zero("index") as u32 == index;
            if gone {
                notices.push(notice(NlMsgType::RTM_DELADDR, a));
            }
            !gone
        });
        self.routes.retain(|r| {
            let gone = route_key(r).oif == index;
            if gone {
                notices.push(notice(NlMsgType::RTM_DELROUTE, r));
            }
            !gone
        });
        notices.push(notice(NlMsgType::RTM_DELLINK, &body));

        let ports: Vec<u32> = self
            .links
            .iter()
            .filter(|(_, l)| l.master() == index)
            .map(|(i, _)| *i)
            .collect();
        for port in ports {
            if let Some(link) = self.links.get_mut(&port) {
                link.remove_attr("IFLA_MASTER");
                notices.push(notice(NlMsgType::RTM_NEWLINK, link));
            }
        }
        if let Some(peer) = self.peers.remove(&index) {
            self.peers.remove(&peer);
            if let Ok(more) = self.del_link(peer) {
                notices.extend(more);
            }
        }
        Ok(notices)
    }

    fn new_addr(&mut self, req: &Message, flags: u16) -> Result<Vec<Message>, i32> {
        let key = address_key(req).ok_or(libc::EINVAL)?;
        if !self.links.contains_key(&key.0) {
            return Err(libc::ENODEV);
        }
        let existing = self
            .addresses
            .iter()
            .position(|a| address_key(a) == Some(key));
        let body = req.body.clone();
        match existing {
            Some(pos) if flags & NLM_F_REPLACE != 0 => self.addresses[pos] = body.clone(),
            Some(_) => return Err(libc::EEXIST),
            None => self.addresses.push(body.clone()),
        }
        let mut notices = vec![notice(NlMsgType::RTM_NEWADDR, &body)];
        let vanish = existing.is_none() && self.links[&key.0].link_kind() == Some("bond");
        if self.bond_drops_address && vanish {
            self.bond_drops_address = false;
            self.addresses.pop();
            notices.push(notice(NlMsgType::RTM_DELADDR, &body));
        }
        Ok(notices)
    }

    fn del_addr(&mut self, req: &Message) -> Result<Vec<Message>, i32> {
        let key = address_key(req).ok_or(libc::EINVAL)?;
        let pos = self
            .addresses
            .iter()
            .position(|a| address_key(a) == Some(key))
            .ok_or(libc::EADDRNOTAVAIL)?;
        let body = self.addresses.remove(pos);
        Ok(vec![notice(NlMsgType::RTM_DELADDR, &body)])
    }

    fn new_route(&mut self, req: &Message, flags: u16) -> Result<Vec<Message>, i32> {
        let (table, key) = (route_table(req), route_key(req));
        if key.oif != 0 && !self.links.contains_key(&key.oif) {
            return Err(libc::ENODEV);
        }
        let existing = self.routes.iter().position(|r| {
            let k = route_key(r);
            route_table(r) == table && k.dst == key.dst && k.dst_len == key.dst_len
        });
        let body = req.body.clone();
        match existing {
            Some(_) if flags & NLM_F_EXCL != 0 => return Err(libc::EEXIST),
            Some(pos) => self.routes[pos] = body.clone(),
            None => self.routes.push(body.clone()),
        }
        Ok(vec![notice(NlMsgType::RTM_NEWROUTE, &body)])
    }

    fn del_route(&mut self, req: &Message) -> Result<Vec<Message>, i32> {
        let (table, key) = (route_table(req), route_key(req));
        let pos = self
            .routes
            .iter()
            .position(|r| route_table(r) == table && route_key(r).matches(&key))
            .ok_or(libc::ESRCH)?;
        let body = self.routes.remove(pos);
        Ok(vec![notice(NlMsgType::RTM_DELROUTE, &body)])
    }
}

async fn serve(kernel: Arc<Mutex<Kernel>>, mut peer: ChannelPeer, events: UnboundedSender<Vec<u8>>) {
    while let Some(data) = peer.recv().await {
        let Ok(requests) = Message::decode_all(&data, &rtnl::REGISTRY) else {
            continue;
        };
        for req in requests {
            let (replies, notices) = kernel.lock().unwrap().handle(&req);
            for msg in notices {
                let _ = events.send(msg.encode());
            }
            let mut datagram = Vec::new();
            for msg in replies {
                let bytes = msg.encode();
                if !datagram.is_empty() && datagram.len() + bytes.len() > DATAGRAM {
                    let _ = peer.send(std::mem::take(&mut datagram));
                }
                datagram.extend(bytes);
            }
            if !datagram.is_empty() {
                let _ = peer.send(datagram);
            }
        }
    }
}

/// A fake kernel wired to a database through in-memory channels.
pub struct FakeKernel {
    kernel: Arc<Mutex<Kernel>>,
    events: UnboundedSender<Vec<u8>>,
    _events_peer: ChannelPeer,
    task: JoinHandle<()>,
}

impl FakeKernel {
    /// Start a kernel holding `lo` and open a database on it.
    pub async fn open(config: Config) -> ipdb::Result<(Ipdb, FakeKernel)> {
        let (cmd_endpoint, cmd_peer) = channel::pair(4000);
        let (event_endpoint, events_peer) = channel::pair(4001);
        let kernel = Arc::new(Mutex::new(Kernel::seeded()));
        let events = events_peer.sender();
        let task = tokio::spawn(serve(Arc::clone(&kernel), cmd_peer, events.clone()));

        let conn = Connection::from_channel(cmd_endpoint, &rtnl::REGISTRY)
            .with_timeout(config.request_timeout);
        let event_conn = Connection::from_channel(event_endpoint, &rtnl::REGISTRY);
        let ipdb = Ipdb::with_connections(conn, event_conn, config).await?;
        Ok((
            ipdb,
            FakeKernel {
                kernel,
                events,
                _events_peer: events_peer,
                task,
            },
        ))
    }

    pub fn state(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock().unwrap()
    }

    /// Fail the next request of `msg_type` with `errno`.
    pub fn fail_next(&self, msg_type: u16, errno: i32) {
        self.fail_nth(msg_type, 1, errno);
    }

    /// Fail the `n`th next request of `msg_type` with `errno`.
    pub fn fail_nth(&self, msg_type: u16, n: usize, errno: i32) {
        self.state().faults.push((msg_type, n.saturating_sub(1), errno));
    }

    /// Accept the next request of `msg_type` without notifying anyone.
    pub fn mute_next(&self, msg_type: u16) {
        self.state().muted.push(msg_type);
    }

    /// Have `name` appear, as if a module load created it, right before
    /// the database asks for it.
    pub fn preempt_create(&self, name: &str, kind: &str) {
        self.state().preempted.push((name.to_string(), kind.to_string()));
    }

    /// Make the next address added to a bond vanish once.
    pub fn bond_drops_first_address(&self) {
        self.state().bond_drops_address = true;
    }

    fn broadcast(&self, notices: Vec<Message>) {
        for msg in notices {
            let _ = self.events.send(msg.encode());
        }
    }

    /// Create a link behind the database's back.
    pub fn add_link(&self, name: &str, kind: &str) -> u32 {
        self.add_link_at(0, name, kind)
    }

    /// Create a link with a given index (0 picks one).
    pub fn add_link_at(&self, index: u32, name: &str, kind: &str) -> u32 {
        let body = self.state().insert_link(index, name, kind);
        let index = body.ifindex();
        self.broadcast(vec![notice(NlMsgType::RTM_NEWLINK, &body)]);
        index
    }

    /// Add an address behind the database's back.
    pub fn add_address(&self, index: u32, spec: &str) {
        let (ip, prefix) = parse_prefix(spec).unwrap();
        let mut body = Body::new(&IFADDRMSG);
        let family = if ip.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        body.set_field("family", family as u64).unwrap();
        body.set_field("prefixlen", prefix as u64).unwrap();
        body.set_field("index", index as u64).unwrap();
        body.push("IFA_LOCAL", AttrValue::Ip(ip)).unwrap();
        body.push("IFA_ADDRESS", AttrValue::Ip(ip)).unwrap();
        self.state().addresses.push(body.clone());
        self.broadcast(vec![notice(NlMsgType::RTM_NEWADDR, &body)]);
    }

    /// Change a link attribute behind the database's back.
    pub fn set_link_attr(&self, index: u32, name: &str, value: AttrValue) {
        let body = {
            let mut kernel = self.state();
            let body = kernel.links.get_mut(&index).unwrap();
            body.set_attr(name, value).unwrap();
            body.clone()
        };
        self.broadcast(vec![notice(NlMsgType::RTM_NEWLINK, &body)]);
    }

    /// Delete a link behind the database's back.
    pub fn remove_link(&self, index: u32) {
        let notices = self.state().del_link(index).unwrap();
        self.broadcast(notices);
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll `cond` until it holds or a second passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

static NAMESPACE_COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

fn unique_ns_name(prefix: &str) -> String {
    let id = NAMESPACE_COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    format!("ipdb-test-{}-{}-{}", prefix, std::process::id(), id)
}

/// A network namespace removed on drop.
pub struct TestNamespace {
    name: String,
}

impl TestNamespace {
    pub fn new(prefix: &str) -> ipdb::Result<Self> {
        let name = unique_ns_name(prefix);
        namespace::create(&name)?;
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a database inside the namespace.
    pub async fn ipdb(&self) -> ipdb::Result<Ipdb> {
        Ipdb::for_netns(&self.name, Default::default(), config()).await
    }
}

impl Drop for TestNamespace {
    fn drop(&mut self) {
        let _ = namespace::remove(&self.name);
    }
}

/// Check if running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Skip the test if not running as root.
#[macro_export]
macro_rules! require_root {
    () => {
        if !crate::common::is_root() {
            eprintln!("Skipping test: requires root");
            return Ok(());
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ns_name() {
        let name1 = unique_ns_name("test");
        let name2 = unique_ns_name("test");
        assert_ne!(name1, name2);
        assert!(name1.starts_with("ipdb-test-test-"));
    }

    #[test]
    fn test_combine_flags_tracks_carrier() {
        let up = combine_flags(iff::BROADCAST, iff::UP, iff::UP);
        assert_eq!(up & (iff::RUNNING | iff::LOWER_UP), iff::RUNNING | iff::LOWER_UP);
        let down = combine_flags(up, 0, iff::UP);
        assert_eq!(down & iff::RUNNING, 0);
    }
}
