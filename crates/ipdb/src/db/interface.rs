//! Interface handles and the link commit.

use std::collections::BTreeSet;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as Json, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::Ipdb;
use super::linked_set::Raw;
use super::transactional::{
    Addr, Changes, Fields, HookId, Sid, State, Status, Tid, Transaction, Transactional,
    counts_for_target,
};
use super::update::TRACKED;
use crate::config::Mode;
use crate::netlink::codec::{format_lladdr, parse_lladdr};
use crate::netlink::{Connection, Error, Result, namespace};
use crate::rtnl::link::{iff, is_supported_kind};
use crate::rtnl::{AddressRequest, LinkRequest, parse_prefix};
use crate::value::Value;

/// Devices the kernel creates by itself when their module loads.
const DEFAULT_DEVICES: &[&str] = &[
    "dummy0", "gre0", "bond0", "tunl0", "sit0", "ip6tnl0", "gretap0", "erspan0",
];

/// Link fields the kernel clears when set to an empty value.
const CLEARABLE: &[&str] = &["ifalias"];

/// Address metadata carried into add requests.
const ADDRESS_KEYS: &[&str] = &["local", "broadcast", "label", "scope"];

/// Bonds may drop an address while ports are enslaved; it is added again
/// until the kernel reports it exists.
const BOND_ATTEMPTS: usize = 3;
const BOND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Put a value in the form the kernel reports it in.
fn normalize(key: &str, value: Value) -> Value {
    match key {
        "address" | "broadcast" => match value.as_str().map(parse_lladdr) {
            Some(Ok(mac)) => Value::Str(format_lladdr(&mac)),
            _ => value,
        },
        "mtu" | "txqlen" | "master" | "group" | "flags" | "change" | "index" | "link" => {
            value.as_int().map_or(value, Value::Int)
        }
        _ => value,
    }
}

/// Dump of one object: status, fields, addresses and ports.
pub(crate) fn object_json(obj: &Transactional) -> Json {
    let state = obj.state();
    let ipaddr: Vec<String> = state
        .ipaddr
        .iter()
        .map(|(ip, len)| format!("{ip}/{len}"))
        .collect();
    json!({
        "status": obj.status(),
        "fields": state.fields,
        "ipaddr": ipaddr,
        "ports": state.ports,
    })
}

/// An interface given by index, name or handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRef {
    Index(u32),
    Name(String),
}

impl From<u32> for LinkRef {
    fn from(index: u32) -> Self {
        LinkRef::Index(index)
    }
}

impl From<&str> for LinkRef {
    fn from(name: &str) -> Self {
        LinkRef::Name(name.to_string())
    }
}

impl From<String> for LinkRef {
    fn from(name: String) -> Self {
        LinkRef::Name(name)
    }
}

impl From<&Interface> for LinkRef {
    fn from(iface: &Interface) -> Self {
        LinkRef::Index(iface.index())
    }
}

impl LinkRef {
    fn resolve(&self, db: &Ipdb) -> Result<u32> {
        let index = match self {
            LinkRef::Index(index) => *index,
            LinkRef::Name(name) => db.by_name(name).map_or(0, |iface| iface.index()),
        };
        if index == 0 {
            return Err(Error::InterfaceNotFound {
                name: match self {
                    LinkRef::Index(index) => index.to_string(),
                    LinkRef::Name(name) => name.clone(),
                },
            });
        }
        Ok(index)
    }
}

/// Handle to a link in the database.
///
/// Reads show the kernel's view. Mutations go to the open transaction
/// (see [`Mode`]) and reach the kernel on [`commit`](Self::commit).
#[derive(Clone)]
pub struct Interface {
    obj: Arc<Transactional>,
    db: Ipdb,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("index", &self.index())
            .field("ifname", &self.ifname())
            .field("status", &self.status())
            .finish()
    }
}

impl Interface {
    pub(crate) fn new(obj: Arc<Transactional>, db: Ipdb) -> Self {
        Self { obj, db }
    }

    fn conn(&self) -> &Connection {
        &self.db.shared.conn
    }

    fn timeout(&self) -> Duration {
        self.db.shared.config.commit_timeout
    }

    fn name(&self) -> String {
        self.ifname().unwrap_or_else(|| self.index().to_string())
    }

    // Reads.

    pub fn get(&self, field: &str) -> Option<Value> {
        self.obj.get(field)
    }

    /// Value of a field in the open transaction.
    pub fn pending(&self, field: &str) -> Option<Value> {
        let tid = self.obj.top()?;
        self.obj
            .with_tx(tid, |tx| Ok(tx.fields.get(field).cloned()))
            .ok()
            .flatten()
    }

    pub fn fields(&self) -> Fields {
        self.obj.fields()
    }

    /// Interface index, zero until the kernel created the link.
    pub fn index(&self) -> u32 {
        self.get("index").and_then(|v| v.as_u32()).unwrap_or(0)
    }

    pub fn ifname(&self) -> Option<String> {
        self.get("ifname").and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn kind(&self) -> Option<String> {
        self.get("kind").and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn ipaddr(&self) -> BTreeSet<Addr> {
        self.obj.ipaddr.items()
    }

    /// Indexes of the interfaces enslaved to this one.
    pub fn ports(&self) -> BTreeSet<u32> {
        self.obj.ports.items()
    }

    pub fn status(&self) -> Status {
        self.obj.status()
    }

    pub fn state(&self) -> State {
        self.obj.state()
    }

    pub fn is_frozen(&self) -> bool {
        self.obj.lock().frozen.is_some()
    }

    pub fn to_json(&self) -> Json {
        object_json(&self.obj)
    }

    // Transactions.

    pub fn begin(&self) -> Result<Tid> {
        self.obj.begin()
    }

    /// The transaction mutations currently go to.
    pub fn current_tx(&self) -> Option<Tid> {
        self.obj.top()
    }

    /// Commit the topmost transaction.
    pub async fn commit(&self) -> Result<()> {
        let tid = self.obj.top().ok_or(Error::NoTransaction)?;
        self.commit_tid(tid).await
    }

    pub async fn commit_tid(&self, tid: Tid) -> Result<()> {
        let _guard = self.obj.commit_lock.lock().await;
        let tx = self.obj.take_tx(tid).ok_or(Error::NoTransaction)?;
        let desired = tx.desired(&self.obj.fields());
        debug!(ifname = %self.name(), %tid, "committing");
        self.commit_locked(desired, tx.targets.clone(), tx.shadow)
            .await
    }

    /// Discard the topmost transaction.
    pub fn rollback(&self) -> Result<()> {
        let tid = self.obj.top().ok_or(Error::NoTransaction)?;
        self.drop_tx(tid)
    }

    pub fn drop_tx(&self, tid: Tid) -> Result<()> {
        self.obj
            .take_tx(tid)
            .map(|_| ())
            .ok_or(Error::NoTransaction)
    }

    pub fn snapshot(&self) -> Sid {
        self.obj.snapshot()
    }

    /// Bring tracked fields, addresses and ports back to a snapshot.
    pub async fn revert(&self, sid: Sid) -> Result<()> {
        let snap = self
            .obj
            .snapshot_state(sid)
            .ok_or_else(|| Error::InvalidMessage(format!("no snapshot {sid:?}")))?;
        let _guard = self.obj.commit_lock.lock().await;
        let mut desired = self.obj.state();
        for key in TRACKED {
            if let Some(value) = snap.fields.get(*key) {
                desired.fields.insert(key.to_string(), value.clone());
            }
        }
        desired.ipaddr = snap.ipaddr;
        desired.addr_raw = snap.addr_raw;
        desired.ports = snap.ports;
        desired.in_kernel = snap.in_kernel;
        self.commit_locked(desired, Fields::new(), false).await
    }

    /// Run `f` on the transaction a mutation goes to. In direct mode a
    /// transaction opened here is committed at once.
    async fn mutate<R>(&self, f: impl FnOnce(&Transactional, &mut Transaction) -> Result<R>) -> Result<R> {
        let (tid, opened) = self.obj.ensure_tx()?;
        let value = match self.obj.with_tx(tid, |tx| f(&self.obj, tx)) {
            Ok(value) => value,
            Err(e) => {
                if opened {
                    self.obj.take_tx(tid);
                }
                return Err(e);
            }
        };
        if opened && self.obj.mode == Mode::Direct {
            self.commit_tid(tid).await?;
        }
        Ok(value)
    }

    // Mutations.

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = normalize(key, value.into());
        match key {
            "ipaddr" | "ports" => Err(Error::InvalidAttribute(format!(
                "{key} is changed through add/del calls"
            ))),
            "state" => {
                let up = value
                    .as_bool()
                    .ok_or_else(|| Error::InvalidAttribute(format!("state: {value}")))?;
                self.set_flag(iff::UP, up).await
            }
            "flags" => {
                self.mutate(|_, tx| {
                    tx.set("flags", value);
                    if !tx.touched.contains("change") {
                        tx.set("change", Value::from(!iff::READ_ONLY));
                    }
                    Ok(())
                })
                .await
            }
            _ => {
                self.mutate(|_, tx| {
                    tx.set(key, value);
                    Ok(())
                })
                .await
            }
        }
    }

    pub async fn up(&self) -> Result<()> {
        self.set_flag(iff::UP, true).await
    }

    pub async fn down(&self) -> Result<()> {
        self.set_flag(iff::UP, false).await
    }

    async fn set_flag(&self, bit: u32, on: bool) -> Result<()> {
        self.mutate(|_, tx| {
            let flags = tx.fields.get("flags").and_then(Value::as_u32).unwrap_or(0);
            let flags = if on { flags | bit } else { flags & !bit };
            let change = tx
                .fields
                .get("change")
                .filter(|_| tx.touched.contains("change"))
                .and_then(Value::as_u32)
                .unwrap_or(0);
            tx.set("flags", Value::from(flags));
            tx.set("change", Value::from(change | bit));
            Ok(())
        })
        .await
    }

    /// Add `"ip/prefix"` (or a bare address with a full-length prefix).
    pub async fn add_ip(&self, spec: &str) -> Result<()> {
        self.add_ip_with(spec, Raw::new()).await
    }

    /// Add an address with extra attributes: `broadcast`, `label`,
    /// `local`, `scope`.
    pub async fn add_ip_with(&self, spec: &str, raw: Raw) -> Result<()> {
        let addr = parse_prefix(spec)?;
        if !counts_for_target(&addr) {
            if self.db.shared.config.strict_addresses {
                return Err(Error::InvalidAttribute(format!(
                    "{spec}: link-local /64 addresses are managed by the kernel"
                )));
            }
            debug!(address = spec, "ignoring link-local address");
            return self.mutate(|_, _| Ok(())).await;
        }
        let mut check = AddressRequest::new(0, addr.0, addr.1);
        for (key, value) in &raw {
            check.set(key, value.clone())?;
        }
        let raw = (!raw.is_empty()).then_some(raw);
        self.mutate(|obj, tx| {
            obj.ipaddr.exclude(&tx.ipaddr, addr);
            tx.ipaddr.add(addr, raw);
            Ok(())
        })
        .await
    }

    /// Remove an address. A bare address matches any prefix length.
    pub async fn del_ip(&self, spec: &str) -> Result<()> {
        let bare = !spec.contains('/');
        let (ip, len) = parse_prefix(spec)?;
        self.mutate(|obj, tx| {
            let addr = tx
                .ipaddr
                .items()
                .into_iter()
                .find(|a| a.0 == ip && (bare || a.1 == len))
                .unwrap_or((ip, len));
            obj.ipaddr.exclude(&tx.ipaddr, addr);
            tx.ipaddr.remove(&addr);
            Ok(())
        })
        .await
    }

    pub async fn add_port(&self, port: impl Into<LinkRef>) -> Result<()> {
        let port = self.port_index(port.into())?;
        self.mutate(|obj, tx| {
            obj.ports.exclude(&tx.ports, port);
            tx.ports.add(port, None);
            Ok(())
        })
        .await
    }

    pub async fn del_port(&self, port: impl Into<LinkRef>) -> Result<()> {
        let port = self.port_index(port.into())?;
        self.mutate(|obj, tx| {
            obj.ports.exclude(&tx.ports, port);
            tx.ports.remove(&port);
            Ok(())
        })
        .await
    }

    fn port_index(&self, port: LinkRef) -> Result<u32> {
        let index = port.resolve(&self.db)?;
        if index == self.index() {
            return Err(Error::InvalidAttribute(format!(
                "{} cannot be its own port",
                self.name()
            )));
        }
        Ok(index)
    }

    /// Delete the link on commit.
    pub async fn remove(&self) -> Result<()> {
        self.mutate(|_, tx| {
            tx.in_kernel = false;
            Ok(())
        })
        .await
    }

    /// Delete the link on commit but keep it here, so a later commit
    /// creates it again.
    pub async fn shadow(&self) -> Result<()> {
        self.mutate(|_, tx| {
            tx.in_kernel = false;
            tx.shadow = true;
            Ok(())
        })
        .await
    }

    /// Wait for `field` to reach `value` on commit, besides the fields the
    /// commit changes.
    pub async fn set_target(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = normalize(field, value.into());
        self.mutate(|_, tx| {
            tx.targets.insert(field.to_string(), value);
            Ok(())
        })
        .await
    }

    /// Run `hook` after every successful commit. An error rolls the
    /// commit back.
    pub fn register_commit_hook<F>(&self, hook: F) -> HookId
    where
        F: Fn(&Changes) -> Result<()> + Send + Sync + 'static,
    {
        self.obj.register_hook(Arc::new(hook))
    }

    pub fn unregister_commit_hook(&self, id: HookId) -> bool {
        self.obj.unregister_hook(id)
    }

    /// Keep the current state: whenever the kernel moves away from it,
    /// it is committed again.
    pub fn freeze(&self) {
        let state = self.obj.state();
        self.obj.lock().frozen = Some(state);
        info!(ifname = %self.name(), "interface frozen");
    }

    pub fn unfreeze(&self) {
        self.obj.lock().frozen = None;
    }

    pub(crate) async fn recommit_frozen(&self) -> Result<()> {
        let Some(frozen) = self.obj.lock().frozen.clone() else {
            return Ok(());
        };
        let _guard = self.obj.commit_lock.lock().await;
        let current = self.obj.state();
        if !current.in_kernel {
            return Ok(());
        }
        let mut desired = current.clone();
        for key in TRACKED {
            if let Some(value) = frozen.fields.get(*key) {
                desired.fields.insert(key.to_string(), value.clone());
            }
        }
        let flags = |s: &State| s.fields.get("flags").and_then(Value::as_u32).unwrap_or(0);
        let restored = (flags(&current) & iff::READ_ONLY) | (flags(&frozen) & !iff::READ_ONLY);
        desired.fields.insert("flags".into(), Value::from(restored));
        desired.ipaddr = frozen.ipaddr;
        desired.addr_raw = frozen.addr_raw;

        info!(ifname = %self.name(), "restoring frozen interface");
        self.apply(&desired, &current, &Fields::new(), false).await?;
        Ok(())
    }

    // Commit.

    async fn commit_locked(&self, desired: State, targets: Fields, shadow: bool) -> Result<()> {
        let snapshot = self.obj.state();
        let failure = match self.apply(&desired, &snapshot, &targets, shadow).await {
            Ok(changes) => match self.run_hooks(&changes) {
                Ok(()) => {
                    debug!(ifname = %self.name(), "commit done");
                    return Ok(());
                }
                Err(e) => e,
            },
            Err(e) => e,
        };
        Err(self.roll_back(&snapshot, &desired, failure).await)
    }

    fn run_hooks(&self, changes: &Changes) -> Result<()> {
        for hook in self.obj.hooks() {
            hook(changes)?;
        }
        Ok(())
    }

    /// Push `snapshot` back after a failed commit of `failed`. Every field
    /// the failed commit touched is sent again.
    async fn roll_back(&self, snapshot: &State, failed: &State, error: Error) -> Error {
        let name = self.name();
        warn!(ifname = %name, error = %error, "commit failed, rolling back");
        let current = self.obj.state();
        let base = State {
            fields: failed.fields.clone(),
            ..current
        };
        match self.apply(snapshot, &base, &Fields::new(), false).await {
            Ok(_) => match error {
                e @ Error::CommitFailed { .. } => e,
                e => Error::commit_failed(format!("committing {name}"), Some(e)),
            },
            Err(rollback) => {
                error!(ifname = %name, error = %rollback, "rollback failed");
                if let Err(e) = self.db.refresh().await {
                    warn!(error = %e, "reload after failed rollback");
                }
                Error::Broken {
                    original: Box::new(error),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    /// Make the kernel go from `base` to `desired`.
    async fn apply(&self, desired: &State, base: &State, targets: &Fields, shadow: bool) -> Result<Changes> {
        let mut changes = Changes::between(base, desired);

        if !desired.in_kernel {
            if base.in_kernel && self.obj.status() == Status::Active {
                self.delete(shadow).await?;
            }
            return Ok(changes);
        }

        if !self.obj.status().in_kernel() {
            self.create(desired).await?;
            changes = Changes::between(&self.obj.state(), desired);
            changes.added.retain(|k, _| TRACKED.contains(&k.as_str()));
            let added = &changes.added;
            changes.removed.retain(|k, _| added.contains_key(k));
        }
        let index = self.index();
        if index == 0 {
            return Err(Error::InterfaceNotFound { name: self.name() });
        }

        self.apply_ports(index, &changes).await?;
        if !self.apply_link(index, desired, &changes).await? {
            return Ok(changes);
        }
        self.apply_addresses(index, desired, &changes).await?;
        self.await_targets(desired, &changes, targets).await?;
        Ok(changes)
    }

    async fn create(&self, desired: &State) -> Result<()> {
        let fields = &desired.fields;
        let name = fields
            .get("ifname")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidAttribute("a new link needs an ifname".into()))?;
        let kind = fields.get("kind").and_then(Value::as_str);
        if kind == Some("veth") && fields.get("peer").and_then(Value::as_str).is_none() {
            return Err(Error::commit_failed(format!("veth {name} needs a peer"), None));
        }

        let mut req = LinkRequest::new();
        if let Some(kind) = kind {
            if !is_supported_kind(kind) {
                return Err(Error::commit_failed(format!("unknown kind {kind}"), None));
            }
            req.set("kind", kind)?;
        }
        for (key, value) in fields {
            match key.as_str() {
                "kind" | "flags" | "change" | "state" | "ifi_type" | "slave_kind" => {}
                "index" | "master" if value.as_int() == Some(0) => {}
                _ => {
                    req.set(key, value.clone())?;
                }
            }
        }

        info!(ifname = name, kind = ?kind, "creating link");
        match self.conn().add_link(&req).await {
            Ok(()) => {}
            Err(e)
                if e.is_already_exists()
                    && !self.db.shared.config.strict_create
                    && DEFAULT_DEVICES.contains(&name) =>
            {
                debug!(ifname = name, "default device already present");
            }
            Err(e) if e.is_not_supported() && req.index() != 0 => {
                debug!(ifname = name, index = req.index(), "retrying without an index");
                req.set("index", 0)?;
                self.conn().add_link(&req).await?;
            }
            Err(e) => return Err(e),
        }

        let timeout = self.timeout();
        let obj = Arc::clone(&self.obj);
        let created = self
            .db
            .shared
            .wait_until(timeout, |_| obj.status() == Status::Active)
            .await;
        if !created {
            return Err(Error::TargetMissed {
                field: "index".into(),
            });
        }
        if kind == Some("veth") {
            if let Some(peer) = fields.get("peer").and_then(Value::as_str) {
                let appeared = self
                    .db
                    .shared
                    .wait_until(timeout, |s| {
                        s.names.get(peer).is_some_and(|o| o.status() == Status::Active)
                    })
                    .await;
                if !appeared {
                    return Err(Error::TargetMissed {
                        field: "peer".into(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, shadow: bool) -> Result<()> {
        let index = self.index();
        if shadow {
            self.obj.lock().shadow_on_delete = true;
        }
        if let Err(e) = self.conn().del_link(index).await {
            self.obj.lock().shadow_on_delete = false;
            return Err(e);
        }
        let obj = Arc::clone(&self.obj);
        let gone = self
            .db
            .shared
            .wait_until(self.timeout(), |_| obj.status() != Status::Active)
            .await;
        if !gone {
            return Err(Error::TargetMissed {
                field: "index".into(),
            });
        }
        info!(index, shadow, "link deleted");
        Ok(())
    }

    async fn apply_ports(&self, index: u32, changes: &Changes) -> Result<()> {
        let moves = changes
            .ports_removed
            .iter()
            .map(|port| (*port, 0))
            .chain(changes.ports_added.iter().map(|port| (*port, index)));
        let mut waits = Vec::new();
        for (port, master) in moves {
            let obj = self
                .db
                .link_object(port)
                .ok_or(Error::PortTargetMissed { port })?;
            let mut req = LinkRequest::for_index(port);
            req.set("master", master)?;
            self.conn().set_link(&req).await?;
            waits.push((port, obj.watch("master", Value::from(master), None), obj));
        }
        for (port, target, obj) in waits {
            if !target.done.wait_timeout(self.timeout()).await {
                obj.unwatch(&target);
                return Err(Error::PortTargetMissed { port });
            }
        }
        Ok(())
    }

    /// Send the scalar changes. Returns `false` when the link left this
    /// namespace.
    async fn apply_link(&self, index: u32, desired: &State, changes: &Changes) -> Result<bool> {
        let mut req = LinkRequest::for_index(index);
        if let Some(kind) = desired
            .fields
            .get("kind")
            .and_then(Value::as_str)
            .filter(|k| is_supported_kind(k))
        {
            req.set("kind", kind)?;
        }

        let mut netns: Option<File> = None;
        let mut moved = false;
        let mut any = false;
        for (key, value) in &changes.added {
            match key.as_str() {
                "index" | "peer" | "kind" | "change" | "ifi_type" | "slave_kind" => continue,
                "flags" => {
                    req.set("flags", value.clone())?;
                    if let Some(change) = desired.fields.get("change") {
                        req.set("change", change.clone())?;
                    }
                }
                "net_ns_fd" | "net_ns_pid" => {
                    match value.as_str().filter(|s| s.parse::<i64>().is_err()) {
                        Some(ns) => {
                            let file = namespace::open(ns)?;
                            req.set("net_ns_fd", file.as_raw_fd())?;
                            netns = Some(file);
                        }
                        None => {
                            req.set(key, value.clone())?;
                        }
                    }
                    moved = true;
                }
                _ => {
                    req.set(key, value.clone())?;
                }
            }
            any = true;
        }
        for key in changes.removed.keys() {
            if CLEARABLE.contains(&key.as_str()) && !changes.added.contains_key(key) {
                req.set(key, "")?;
                any = true;
            }
        }
        if !any {
            return Ok(true);
        }

        self.conn().set_link(&req).await?;
        drop(netns);
        if !moved {
            return Ok(true);
        }

        let obj = Arc::clone(&self.obj);
        let gone = self
            .db
            .shared
            .wait_until(self.timeout(), |s| {
                !s.links.get(&index).is_some_and(|o| Arc::ptr_eq(o, &obj))
            })
            .await;
        if !gone {
            return Err(Error::TargetMissed {
                field: "net_ns_fd".into(),
            });
        }
        info!(index, "link moved to another namespace");
        Ok(false)
    }

    async fn apply_addresses(&self, index: u32, desired: &State, changes: &Changes) -> Result<()> {
        for addr in changes.ipaddr_removed.iter().filter(|a| counts_for_target(a)) {
            let req = AddressRequest::new(index, addr.0, addr.1);
            match self.conn().del_address(&req).await {
                Ok(()) => {}
                Err(e) if e.is_errno(libc::EADDRNOTAVAIL) => {
                    debug!(address = %addr.0, "address already gone");
                }
                Err(e) => return Err(e),
            }
        }

        let bond = desired.fields.get("kind").and_then(Value::as_str) == Some("bond");
        for addr in changes.ipaddr_added.iter().filter(|a| counts_for_target(a)) {
            let mut req = AddressRequest::new(index, addr.0, addr.1);
            if let Some(raw) = desired.addr_raw.get(addr) {
                for (key, value) in raw
                    .iter()
                    .filter(|(k, _)| ADDRESS_KEYS.contains(&k.as_str()))
                {
                    req.set(key, value.clone())?;
                }
            }
            self.add_address(&req, bond).await?;
        }
        Ok(())
    }

    async fn add_address(&self, req: &AddressRequest, bond: bool) -> Result<()> {
        for attempt in 1..=BOND_ATTEMPTS {
            match self.conn().add_address(req).await {
                Ok(()) if bond && attempt < BOND_ATTEMPTS => {
                    tokio::time::sleep(BOND_RETRY_DELAY).await;
                }
                Ok(()) => return Ok(()),
                Err(e) if e.is_already_exists() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn await_targets(&self, desired: &State, changes: &Changes, explicit: &Fields) -> Result<()> {
        let deadline = Instant::now() + self.timeout();
        let change = desired
            .fields
            .get("change")
            .and_then(Value::as_u32)
            .unwrap_or(u32::MAX);

        let mut waits = Vec::new();
        for (key, value) in &changes.added {
            if !TRACKED.contains(&key.as_str()) {
                continue;
            }
            let mask = (key == "flags").then_some(change & !iff::READ_ONLY);
            waits.push(self.obj.watch(key, value.clone(), mask));
        }
        for (key, value) in explicit {
            waits.push(self.obj.watch(key, value.clone(), None));
        }
        for target in &waits {
            let left = deadline.saturating_duration_since(Instant::now());
            if !target.done.wait_timeout(left).await {
                for t in &waits {
                    self.obj.unwatch(t);
                }
                return Err(Error::TargetMissed {
                    field: target.field.clone(),
                });
            }
        }

        let sets = [
            ("ipaddr", self.obj.ipaddr.set_target(desired.ipaddr.clone())),
            ("ports", self.obj.ports.set_target(desired.ports.clone())),
        ];
        for (field, done) in sets {
            let left = deadline.saturating_duration_since(Instant::now());
            if !done.wait_timeout(left).await {
                return Err(Error::TargetMissed {
                    field: field.into(),
                });
            }
        }
        Ok(())
    }
}

/// A link to be created. See [`Ipdb::create`].
#[derive(Debug)]
pub struct CreateBuilder {
    db: Ipdb,
    ifname: String,
    fields: Vec<(String, Value)>,
    ipaddr: Vec<String>,
    ports: Vec<LinkRef>,
}

impl CreateBuilder {
    pub(crate) fn new(db: Ipdb, kind: &str, ifname: &str) -> Self {
        Self {
            db,
            ifname: ifname.to_string(),
            fields: vec![("kind".to_string(), Value::from(kind))],
            ipaddr: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    /// Name of the other end of a veth pair.
    pub fn peer(self, name: &str) -> Self {
        self.set("peer", name)
    }

    pub fn add_ip(mut self, spec: &str) -> Self {
        self.ipaddr.push(spec.to_string());
        self
    }

    pub fn add_port(mut self, port: impl Into<LinkRef>) -> Self {
        self.ports.push(port.into());
        self
    }

    /// Create the link and wait until the kernel reports it with every
    /// requested setting. Nothing stays behind on failure.
    pub async fn commit(self) -> Result<Interface> {
        let config = &self.db.shared.config;
        if config.mode == Mode::Snapshot {
            return Err(Error::ReadOnly);
        }
        let ports = self
            .ports
            .iter()
            .map(|port| port.resolve(&self.db))
            .collect::<Result<Vec<_>>>()?;
        let mut addresses = Vec::new();
        for spec in &self.ipaddr {
            let addr = parse_prefix(spec)?;
            if counts_for_target(&addr) {
                addresses.push(addr);
            } else if config.strict_addresses {
                return Err(Error::InvalidAttribute(format!(
                    "{spec}: link-local /64 addresses are managed by the kernel"
                )));
            }
        }

        let obj = Arc::new(Transactional::new(
            config.mode,
            Status::Pending,
            Fields::from([("ifname".to_string(), Value::from(self.ifname.as_str()))]),
        ));
        self.db.insert_pending(&self.ifname, Arc::clone(&obj))?;
        let iface = Interface::new(obj, self.db.clone());

        let opened = iface.obj.begin().and_then(|tid| {
            iface.obj.with_tx(tid, |tx| {
                for (key, value) in self.fields {
                    let value = normalize(&key, value);
                    tx.set(&key, value);
                }
                for addr in addresses {
                    tx.ipaddr.add(addr, None);
                }
                for port in ports {
                    tx.ports.add(port, None);
                }
                Ok(())
            })?;
            Ok(tid)
        });
        let result = match opened {
            Ok(tid) => iface.commit_tid(tid).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.db.remove_pending(&self.ifname, &iface.obj);
            return Err(e);
        }
        Ok(iface)
    }
}
