//! State shared by every database object: current fields, the stack of
//! open transactions, snapshots, field targets and commit hooks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use super::completion::FieldTarget;
use super::linked_set::{LinkedSet, Raw};
use crate::config::Mode;
use crate::netlink::{Error, Result};
use crate::rtnl::addr::is_link_local_64;
use crate::value::Value;

/// Field name to value.
pub type Fields = BTreeMap<String, Value>;

/// An interface address: `(ip, prefix length)`.
pub type Addr = (IpAddr, u8);

/// Handle of an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Tid(u64);

/// Handle of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Sid(u64);

/// Handle of a registered commit hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HookId(u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Where an object stands with respect to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Created in the database, not yet in the kernel.
    Pending,
    /// Mirrors a kernel object.
    Active,
    /// Removed from the kernel, kept here to be created again.
    Shadow,
    /// Removed from the kernel, kept for inspection.
    Flicker,
    /// Gone for good.
    Removed,
}

impl Status {
    pub fn in_kernel(self) -> bool {
        self == Status::Active
    }
}

/// Addresses the kernel configures on its own are left out of comparisons.
pub(crate) fn counts_for_target(addr: &Addr) -> bool {
    !is_link_local_64(&addr.0, addr.1)
}

/// A point-in-time copy of an object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub fields: Fields,
    pub ipaddr: BTreeSet<Addr>,
    pub addr_raw: BTreeMap<Addr, Raw>,
    pub ports: BTreeSet<u32>,
    /// Whether the object should exist in the kernel.
    pub in_kernel: bool,
}

/// What a commit changes, handed to commit hooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    /// Fields with their new values.
    pub added: Fields,
    /// Fields with their old values, including fields `to` no longer has.
    pub removed: Fields,
    pub ipaddr_added: BTreeSet<Addr>,
    pub ipaddr_removed: BTreeSet<Addr>,
    pub ports_added: BTreeSet<u32>,
    pub ports_removed: BTreeSet<u32>,
}

impl Changes {
    /// Differences needed to go from `from` to `to`.
    pub fn between(from: &State, to: &State) -> Self {
        let mut changes = Changes::default();
        for (key, value) in &to.fields {
            if from.fields.get(key) != Some(value) {
                changes.added.insert(key.clone(), value.clone());
                if let Some(old) = from.fields.get(key) {
                    changes.removed.insert(key.clone(), old.clone());
                }
            }
        }
        for (key, old) in &from.fields {
            if !to.fields.contains_key(key) {
                changes.removed.insert(key.clone(), old.clone());
            }
        }
        changes.ipaddr_added = to.ipaddr.difference(&from.ipaddr).copied().collect();
        changes.ipaddr_removed = from.ipaddr.difference(&to.ipaddr).copied().collect();
        changes.ports_added = to.ports.difference(&from.ports).copied().collect();
        changes.ports_removed = from.ports.difference(&to.ports).copied().collect();
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.ipaddr_added.is_empty()
            && self.ipaddr_removed.is_empty()
            && self.ports_added.is_empty()
            && self.ports_removed.is_empty()
    }
}

/// Callback run at the end of a successful commit. An error rolls the
/// commit back.
pub type Hook = Arc<dyn Fn(&Changes) -> Result<()> + Send + Sync>;

/// An open transaction: the desired state of the object.
pub(crate) struct Transaction {
    pub tid: Tid,
    pub fields: Fields,
    /// Keys changed inside the transaction.
    pub touched: BTreeSet<String>,
    pub ipaddr: LinkedSet<Addr>,
    pub ports: LinkedSet<u32>,
    /// Explicit targets, awaited on commit.
    pub targets: Fields,
    pub in_kernel: bool,
    pub shadow: bool,
}

impl Transaction {
    pub fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
        self.touched.insert(key.to_string());
    }

    /// The state to commit: `current` fields with the keys changed here
    /// laid over them. Fields the kernel changed meanwhile are left alone.
    pub fn desired(&self, current: &Fields) -> State {
        let mut state = self.state();
        state.fields = current.clone();
        for key in &self.touched {
            if let Some(value) = self.fields.get(key) {
                state.fields.insert(key.clone(), value.clone());
            }
        }
        state
    }

    pub fn state(&self) -> State {
        let ipaddr = self.ipaddr.items();
        let addr_raw = ipaddr
            .iter()
            .filter_map(|a| self.ipaddr.raw(a).map(|raw| (*a, raw)))
            .collect();
        State {
            fields: self.fields.clone(),
            ipaddr,
            addr_raw,
            ports: self.ports.items(),
            in_kernel: self.in_kernel,
        }
    }
}

pub(crate) struct Inner {
    pub fields: Fields,
    pub status: Status,
    stack: Vec<Transaction>,
    snapshots: HashMap<Sid, State>,
    targets: Vec<Arc<FieldTarget>>,
    hooks: Vec<(HookId, Hook)>,
    direct: usize,
    /// State re-applied whenever the kernel diverges from it.
    pub frozen: Option<State>,
    /// Mark the object as shadow when the kernel deletes it.
    pub shadow_on_delete: bool,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn fire_targets(&mut self) {
        let fields = &self.fields;
        self.targets.retain(|target| {
            if target.matches(fields.get(&target.field)) {
                target.done.set();
                false
            } else {
                true
            }
        });
    }
}

/// Guard under which changes go straight to the current state.
///
/// Held by the update loop while it applies a notification. It keeps the
/// object locked, so the change and the target checks it triggers are
/// atomic for other readers; nested users get the same guard passed down.
pub(crate) struct DirectState<'a> {
    inner: MutexGuard<'a, Inner>,
}

impl DirectState<'_> {
    /// Set one field and fire the targets it satisfies.
    pub fn set(&mut self, key: &str, value: Value) {
        self.inner.fields.insert(key.to_string(), value);
        self.inner.fire_targets();
    }

    /// Merge a full field map from the kernel.
    pub fn load(&mut self, fields: Fields) {
        self.inner.fields.extend(fields);
        self.inner.fire_targets();
    }

    pub fn depth(&self) -> usize {
        self.inner.direct
    }
}

impl Deref for DirectState<'_> {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.inner
    }
}

impl DerefMut for DirectState<'_> {
    fn deref_mut(&mut self) -> &mut Inner {
        &mut self.inner
    }
}

impl Drop for DirectState<'_> {
    fn drop(&mut self) {
        self.inner.direct -= 1;
    }
}

/// A database object.
pub(crate) struct Transactional {
    pub mode: Mode,
    inner: Mutex<Inner>,
    /// Held for the whole of a commit.
    pub commit_lock: tokio::sync::Mutex<()>,
    pub ipaddr: LinkedSet<Addr>,
    pub ports: LinkedSet<u32>,
}

impl fmt::Debug for Transactional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Transactional")
            .field("status", &inner.status)
            .field("fields", &inner.fields)
            .field("transactions", &inner.stack.len())
            .finish()
    }
}

impl Transactional {
    pub fn new(mode: Mode, status: Status, fields: Fields) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner {
                fields,
                status,
                stack: Vec::new(),
                snapshots: HashMap::new(),
                targets: Vec::new(),
                hooks: Vec::new(),
                direct: 0,
                frozen: None,
                shadow_on_delete: false,
                next_id: 0,
            }),
            commit_lock: tokio::sync::Mutex::new(()),
            ipaddr: LinkedSet::with_filter(counts_for_target),
            ports: LinkedSet::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn direct(&self) -> DirectState<'_> {
        let mut inner = self.lock();
        inner.direct += 1;
        DirectState { inner }
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn fields(&self) -> Fields {
        self.lock().fields.clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().fields.get(key).cloned()
    }

    pub fn state(&self) -> State {
        let (fields, in_kernel) = {
            let inner = self.lock();
            (inner.fields.clone(), inner.status.in_kernel())
        };
        let ipaddr = self.ipaddr.items();
        let addr_raw = ipaddr
            .iter()
            .filter_map(|a| self.ipaddr.raw(a).map(|raw| (*a, raw)))
            .collect();
        State {
            fields,
            ipaddr,
            addr_raw,
            ports: self.ports.items(),
            in_kernel,
        }
    }

    /// Open a transaction on top of the stack.
    pub fn begin(&self) -> Result<Tid> {
        if self.mode == Mode::Snapshot {
            return Err(Error::ReadOnly);
        }
        let mut inner = self.lock();
        let tid = Tid(inner.next_id());
        let ipaddr = self.ipaddr.detached();
        let ports = self.ports.detached();
        self.ipaddr.connect(&ipaddr);
        self.ports.connect(&ports);
        let in_kernel = inner.status != Status::Removed;
        let fields = inner.fields.clone();
        inner.stack.push(Transaction {
            tid,
            fields,
            touched: BTreeSet::new(),
            ipaddr,
            ports,
            targets: Fields::new(),
            in_kernel,
            shadow: false,
        });
        Ok(tid)
    }

    /// The transaction a mutation goes to, opening one when the mode
    /// allows. The flag tells whether it was opened here.
    pub fn ensure_tx(&self) -> Result<(Tid, bool)> {
        if self.mode == Mode::Snapshot {
            return Err(Error::ReadOnly);
        }
        if let Some(tid) = self.top() {
            return Ok((tid, false));
        }
        if self.mode == Mode::Explicit {
            return Err(Error::NoTransaction);
        }
        Ok((self.begin()?, true))
    }

    pub fn top(&self) -> Option<Tid> {
        self.lock().stack.last().map(|tx| tx.tid)
    }

    pub fn with_tx<R>(&self, tid: Tid, f: impl FnOnce(&mut Transaction) -> Result<R>) -> Result<R> {
        let mut inner = self.lock();
        let tx = inner
            .stack
            .iter_mut()
            .find(|tx| tx.tid == tid)
            .ok_or(Error::NoTransaction)?;
        f(tx)
    }

    /// Remove a transaction from the stack.
    pub fn take_tx(&self, tid: Tid) -> Option<Transaction> {
        let tx = {
            let mut inner = self.lock();
            let pos = inner.stack.iter().position(|tx| tx.tid == tid)?;
            inner.stack.remove(pos)
        };
        self.ipaddr.disconnect(&tx.ipaddr);
        self.ports.disconnect(&tx.ports);
        Some(tx)
    }

    pub fn snapshot(&self) -> Sid {
        let state = self.state();
        let mut inner = self.lock();
        let sid = Sid(inner.next_id());
        inner.snapshots.insert(sid, state);
        sid
    }

    pub fn snapshot_state(&self, sid: Sid) -> Option<State> {
        self.lock().snapshots.get(&sid).cloned()
    }

    pub fn forget_snapshot(&self, sid: Sid) -> bool {
        self.lock().snapshots.remove(&sid).is_some()
    }

    /// Arm a target on a field. It fires at once when already met.
    pub fn watch(&self, field: &str, value: Value, mask: Option<u32>) -> Arc<FieldTarget> {
        let target = Arc::new(FieldTarget::new(field, value, mask));
        let mut inner = self.lock();
        if target.matches(inner.fields.get(field)) {
            target.done.set();
        } else {
            inner.targets.push(Arc::clone(&target));
        }
        target
    }

    pub fn unwatch(&self, target: &Arc<FieldTarget>) {
        self.lock().targets.retain(|t| !Arc::ptr_eq(t, target));
    }

    pub fn register_hook(&self, hook: Hook) -> HookId {
        let mut inner = self.lock();
        let id = HookId(inner.next_id());
        inner.hooks.push((id, hook));
        id
    }

    pub fn unregister_hook(&self, id: HookId) -> bool {
        let mut inner = self.lock();
        let before = inner.hooks.len();
        inner.hooks.retain(|(h, _)| *h != id);
        inner.hooks.len() != before
    }

    pub fn hooks(&self) -> Vec<Hook> {
        self.lock().hooks.iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    /// Drop every open transaction and pending target.
    pub fn invalidate(&self) {
        let stack = {
            let mut inner = self.lock();
            inner.status = Status::Removed;
            inner.targets.clear();
            std::mem::take(&mut inner.stack)
        };
        for tx in stack {
            self.ipaddr.disconnect(&tx.ipaddr);
            self.ports.disconnect(&tx.ports);
        }
    }
}
