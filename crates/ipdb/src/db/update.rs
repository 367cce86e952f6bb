//! Applying kernel notifications to the database.
//!
//! Everything here runs synchronously under the database lock; objects are
//! changed through their [`DirectState`](super::transactional::DirectState)
//! guard so field targets fire as the kernel confirms changes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, trace};

use super::linked_set::{LinkedSet, Raw};
use super::transactional::{Addr, Fields, State, Status, Transactional};
use crate::config::Config;
use crate::netlink::codec::{Body, Message};
use crate::netlink::message::NlMsgType;
use crate::rtnl::addr::address_key;
use crate::rtnl::link::{LinkExt, iff, link_fields};
use crate::rtnl::neigh::{neigh_fields, neigh_key};
use crate::rtnl::route::{RouteKey, route_fields, route_key, route_table};
use crate::rtnl::rule::rule_fields;
use crate::rtnl::{AF_INET, AF_INET6, key_of};
use crate::value::Value;

/// Link fields the database compares and waits for.
pub(crate) const TRACKED: &[&str] = &[
    "ifname", "mtu", "address", "broadcast", "txqlen", "master", "flags", "ifalias", "group",
];

/// Everything the database mirrors.
#[derive(Default)]
pub(crate) struct DbState {
    pub links: BTreeMap<u32, Arc<Transactional>>,
    /// Links by name, including pending and shadow ones.
    pub names: HashMap<String, Arc<Transactional>>,
    /// Addresses by interface index.
    pub addresses: BTreeMap<u32, LinkedSet<Addr>>,
    pub tables: BTreeMap<u32, BTreeMap<RouteKey, Arc<Transactional>>>,
    /// Routes added here that the kernel has not reported yet.
    pub pending_routes: Vec<(u32, RouteKey, Arc<Transactional>)>,
    pub rules: Vec<Fields>,
    pub neighbours: BTreeMap<(u32, IpAddr), Fields>,
}

/// Flatten an address message: header fields plus `IFA_*` keys.
pub(crate) fn address_fields(body: &Body) -> Raw {
    let mut fields = Raw::new();
    for (spec, v) in body.schema.fields.iter().zip(&body.fields) {
        fields.insert(spec.name.to_string(), Value::from(*v));
    }
    for a in &body.attrs {
        if let Some(v) = Value::from_attr(&a.value) {
            fields.insert(key_of(a.name, "IFA_"), v);
        }
    }
    fields
}

/// Whether the kernel moved away from a frozen state.
pub(crate) fn diverged(frozen: &State, current: &State) -> bool {
    let field_moved = TRACKED.iter().any(|key| {
        let (Some(want), have) = (frozen.fields.get(*key), current.fields.get(*key)) else {
            return false;
        };
        if *key == "flags" {
            let mask = !iff::READ_ONLY;
            let want = want.as_u32().unwrap_or(0) & mask;
            let have = have.and_then(Value::as_u32).unwrap_or(0) & mask;
            return want != have;
        }
        have != Some(want)
    });
    let counted = |s: &BTreeSet<Addr>| {
        s.iter()
            .filter(|a| super::transactional::counts_for_target(a))
            .copied()
            .collect::<Vec<_>>()
    };
    field_moved || counted(&frozen.ipaddr) != counted(&current.ipaddr)
}

impl DbState {
    /// Apply one message. Returns frozen objects the change pushed away
    /// from their desired state.
    pub fn apply(&mut self, config: &Config, msg: &Message) -> Option<Arc<Transactional>> {
        match msg.msg_type() {
            NlMsgType::RTM_NEWLINK => return self.new_link(config, msg),
            NlMsgType::RTM_DELLINK => self.del_link(config, msg),
            NlMsgType::RTM_NEWADDR => return self.new_addr(msg),
            NlMsgType::RTM_DELADDR => return self.del_addr(msg),
            NlMsgType::RTM_NEWROUTE => self.new_route(config, msg),
            NlMsgType::RTM_DELROUTE => self.del_route(msg),
            NlMsgType::RTM_NEWRULE => {
                let fields = rule_fields(msg);
                if !self.rules.contains(&fields) {
                    self.rules.push(fields);
                }
            }
            NlMsgType::RTM_DELRULE => {
                let fields = rule_fields(msg);
                self.rules.retain(|r| *r != fields);
            }
            NlMsgType::RTM_NEWNEIGH => {
                if let Some(key) = neigh_key(msg) {
                    self.neighbours.insert(key, neigh_fields(msg));
                }
            }
            NlMsgType::RTM_DELNEIGH => {
                if let Some(key) = neigh_key(msg) {
                    self.neighbours.remove(&key);
                }
            }
            other => trace!(msg_type = other, "ignoring message"),
        }
        None
    }

    /// The link at `index`, unless only a flicker object is left there.
    fn live(&self, index: u32) -> Option<&Arc<Transactional>> {
        self.links.get(&index).filter(|o| o.status() != Status::Flicker)
    }

    fn frozen_check(obj: &Arc<Transactional>) -> Option<Arc<Transactional>> {
        let frozen = obj.lock().frozen.clone()?;
        diverged(&frozen, &obj.state()).then(|| Arc::clone(obj))
    }

    fn new_link(&mut self, config: &Config, body: &Body) -> Option<Arc<Transactional>> {
        let index = body.ifindex();
        if index == 0 {
            return None;
        }
        let name = body.ifname().map(str::to_string);
        let obj = match self.live(index) {
            Some(obj) => Arc::clone(obj),
            None => {
                let adopted = name
                    .as_ref()
                    .and_then(|n| self.names.get(n))
                    .filter(|o| {
                        matches!(o.status(), Status::Pending | Status::Shadow | Status::Flicker)
                    })
                    .cloned();
                if let Some(stale) = self.links.get(&index) {
                    if adopted.as_ref().is_none_or(|o| !Arc::ptr_eq(o, stale)) {
                        // The index was reused; the old link stays reachable by name.
                        debug!(index, "index reused by another link");
                        self.links.remove(&index);
                    }
                }
                let obj = match adopted {
                    Some(obj) => {
                        // A flicker object may still sit under its old index.
                        self.links.retain(|_, o| !Arc::ptr_eq(o, &obj));
                        obj
                    }
                    None => {
                        info!(index, name = ?name, "new link");
                        Arc::new(Transactional::new(config.mode, Status::Active, Fields::new()))
                    }
                };
                let index_set = self.addresses.entry(index).or_default().clone();
                let kernel = index_set.items();
                for addr in obj.ipaddr.items() {
                    if !kernel.contains(&addr) {
                        obj.ipaddr.remove(&addr);
                    }
                }
                for addr in kernel {
                    obj.ipaddr.add(addr, index_set.raw(&addr));
                }
                obj.ipaddr.connect(&index_set);
                self.links.insert(index, Arc::clone(&obj));
                obj
            }
        };

        let old_master = obj.get("master").and_then(|v| v.as_u32()).unwrap_or(0);
        let old_name = obj.get("ifname").and_then(|v| v.as_str().map(str::to_string));
        {
            let fields = link_fields(body);
            let mut direct = obj.direct();
            direct.status = Status::Active;
            // An alias the kernel no longer reports was cleared.
            if !fields.contains_key("ifalias") {
                direct.fields.remove("ifalias");
            }
            direct.load(fields);
        }

        if let Some(name) = name {
            if let Some(old) = old_name.filter(|old| *old != name) {
                if self.names.get(&old).is_some_and(|o| Arc::ptr_eq(o, &obj)) {
                    self.names.remove(&old);
                }
            }
            self.names.insert(name, Arc::clone(&obj));
        }

        let master = body.master();
        if master != old_master {
            if let Some(old) = self.links.get(&old_master) {
                old.ports.remove(&index);
            }
            if let Some(new) = self.links.get(&master) {
                new.ports.add(index, None);
            }
        }
        Self::frozen_check(&obj)
    }

    fn del_link(&mut self, config: &Config, body: &Body) {
        let index = body.ifindex();
        let Some(obj) = self.links.get(&index).cloned() else {
            return;
        };
        let master = obj.get("master").and_then(|v| v.as_u32()).unwrap_or(0);
        if let Some(master) = self.links.get(&master) {
            master.ports.remove(&index);
        }
        if let Some(set) = self.addresses.remove(&index) {
            obj.ipaddr.disconnect(&set);
        }
        let name = obj.get("ifname").and_then(|v| v.as_str().map(str::to_string));

        let shadow = std::mem::take(&mut obj.lock().shadow_on_delete);
        if shadow {
            debug!(index, "link kept as shadow");
            obj.direct().status = Status::Shadow;
            self.links.remove(&index);
        } else if config.keep_flicker {
            debug!(index, "link kept in flicker state");
            obj.direct().status = Status::Flicker;
        } else {
            info!(index, name = ?name, "link removed");
            self.links.remove(&index);
            if let Some(name) = name {
                if self.names.get(&name).is_some_and(|o| Arc::ptr_eq(o, &obj)) {
                    self.names.remove(&name);
                }
            }
            obj.invalidate();
        }
    }

    fn new_addr(&mut self, body: &Body) -> Option<Arc<Transactional>> {
        let (index, ip, len) = address_key(body)?;
        let raw = Some(address_fields(body));
        match self.live(index) {
            Some(obj) => {
                obj.ipaddr.add((ip, len), raw);
                Self::frozen_check(obj)
            }
            None => {
                self.addresses.entry(index).or_default().add((ip, len), raw);
                None
            }
        }
    }

    fn del_addr(&mut self, body: &Body) -> Option<Arc<Transactional>> {
        let (index, ip, len) = address_key(body)?;
        match self.live(index) {
            Some(obj) => {
                obj.ipaddr.remove(&(ip, len));
                Self::frozen_check(obj)
            }
            None => {
                if let Some(set) = self.addresses.get(&index) {
                    set.remove(&(ip, len));
                }
                None
            }
        }
    }

    fn new_route(&mut self, config: &Config, body: &Body) {
        let family = body.field_or_zero("family") as u8;
        if family != AF_INET && family != AF_INET6 {
            return;
        }
        let table = route_table(body);
        let key = route_key(body);
        let existing = self.tables.get(&table).and_then(|t| t.get(&key)).cloned();
        let obj = match existing {
            Some(obj) => obj,
            None => {
                let pos = self
                    .pending_routes
                    .iter()
                    .position(|(t, k, _)| *t == table && key.matches(k));
                let obj = match pos {
                    Some(pos) => self.pending_routes.remove(pos).2,
                    None => Arc::new(Transactional::new(config.mode, Status::Active, Fields::new())),
                };
                self.tables
                    .entry(table)
                    .or_default()
                    .insert(key, Arc::clone(&obj));
                obj
            }
        };
        let mut direct = obj.direct();
        direct.status = Status::Active;
        direct.load(route_fields(body));
    }

    fn del_route(&mut self, body: &Body) {
        let table = route_table(body);
        let key = route_key(body);
        if let Some(obj) = self.tables.get_mut(&table).and_then(|t| t.remove(&key)) {
            obj.invalidate();
        }
    }

    /// Drop objects a fresh dump no longer reports.
    pub fn retain_present(
        &mut self,
        links: &BTreeSet<u32>,
        addresses: &BTreeSet<(u32, Addr)>,
        routes: &BTreeSet<(u32, RouteKey)>,
    ) {
        let gone: Vec<u32> = self
            .links
            .keys()
            .filter(|index| !links.contains(index))
            .copied()
            .collect();
        for index in gone {
            if let Some(obj) = self.links.remove(&index) {
                self.addresses.remove(&index);
                self.names.retain(|_, o| !Arc::ptr_eq(o, &obj));
                obj.invalidate();
            }
        }
        for (index, set) in &self.addresses {
            for addr in set.items() {
                if !addresses.contains(&(*index, addr)) {
                    match self.links.get(index) {
                        Some(obj) => obj.ipaddr.remove(&addr),
                        None => set.remove(&addr),
                    }
                }
            }
        }
        for (table, entries) in &mut self.tables {
            entries.retain(|key, obj| {
                let keep = routes.contains(&(*table, *key));
                if !keep {
                    obj.invalidate();
                }
                keep
            });
        }
    }

    /// Rebuild every link's port set from the `master` fields.
    pub fn rebuild_ports(&self) {
        let mut ports: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for (index, obj) in &self.links {
            let master = obj.get("master").and_then(|v| v.as_u32()).unwrap_or(0);
            if master != 0 {
                ports.entry(master).or_default().push(*index);
            }
        }
        for (index, obj) in &self.links {
            let want = ports.remove(index).unwrap_or_default();
            for port in obj.ports.items() {
                if !want.contains(&port) {
                    obj.ports.remove(&port);
                }
            }
            for port in want {
                if !obj.ports.contains(&port) {
                    obj.ports.add(port, None);
                }
            }
        }
    }
}
