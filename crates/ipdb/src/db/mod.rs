//! Transactional database of the kernel's network configuration.
//!
//! [`Ipdb`] mirrors links, addresses, routes, rules and neighbours. A
//! background task applies every RTNL notification as it arrives, so the
//! objects always show what the kernel reports. Changes are made on
//! [`Interface`] and [`Route`] handles inside transactions and pushed to
//! the kernel by `commit()`, which waits until the kernel confirms every
//! change and rolls back if it does not.
//!
//! ```ignore
//! use ipdb::{Config, Ipdb};
//!
//! let ipdb = Ipdb::new(Config::default()).await?;
//! let veth = ipdb
//!     .create("veth", "v0p0")
//!     .peer("v0p1")
//!     .commit()
//!     .await?;
//! veth.add_ip("10.0.0.1/24").await?;
//! veth.up().await?;
//! veth.commit().await?;
//! ```

pub mod completion;
mod interface;
pub mod linked_set;
mod route;
pub mod transactional;
mod update;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::{Value as Json, json};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::netlink::{Connection, Error, Message, NetNsFlags, Protocol, Proxy, Result};
use crate::rtnl::LinkExt;
use crate::rtnl::addr::address_key;
use crate::rtnl::route::{RouteKey, route_key, route_table};

pub use completion::{Completion, FieldTarget};
pub use interface::{CreateBuilder, Interface, LinkRef};
pub use linked_set::{LinkedSet, Raw};
pub use route::{Route, Routes};
pub use transactional::{Addr, Changes, Fields, Hook, HookId, Sid, State, Status, Tid};

use transactional::Transactional;
use update::DbState;

/// Called with every notification after it was applied.
pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handle of a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Notifications kept for slow event stream readers.
const EVENT_BACKLOG: usize = 1024;

pub(crate) struct Shared {
    pub config: Config,
    /// Requests go here.
    pub conn: Connection,
    /// Notifications come from here.
    events: Connection,
    state: Mutex<DbState>,
    /// Signalled after every applied notification.
    changed: Notify,
    callbacks: Mutex<Vec<(CallbackId, Callback)>>,
    next_callback: AtomicU64,
    stream: broadcast::Sender<Message>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.events.close();
        self.conn.close();
    }
}

impl Shared {
    pub fn state(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn callbacks(&self) -> Vec<Callback> {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }

    /// Apply one notification, then tell everyone who listens.
    fn dispatch(self: &Arc<Self>, msg: Message) {
        let diverged = self.state().apply(&self.config, &msg);
        self.changed.notify_waiters();

        if let Some(obj) = diverged {
            self.spawn_recommit(obj);
        }
        for cb in self.callbacks() {
            cb(&msg);
        }
        // No subscribers is fine.
        let _ = self.stream.send(msg);
    }

    /// Push a frozen object back to its frozen state.
    fn spawn_recommit(self: &Arc<Self>, obj: Arc<Transactional>) {
        // A commit in progress (possibly the recommit itself) settles first.
        if obj.commit_lock.try_lock().is_err() {
            return;
        }
        let db = Ipdb {
            shared: Arc::clone(self),
        };
        tokio::spawn(async move {
            let iface = Interface::new(obj, db);
            if let Err(e) = iface.recommit_frozen().await {
                warn!(error = %e, "restoring frozen interface failed");
            }
        });
    }

    /// Load every object family from scratch.
    async fn load(&self) -> Result<()> {
        let links = self.conn.get_links().await?;
        let addresses = self.conn.get_addresses().await?;
        let routes = self.conn.get_routes().await?;
        let rules = self.conn.get_rules().await?;
        let neighbours = self.conn.get_neighbours().await?;

        let present_links: BTreeSet<u32> = links.iter().map(|m| m.ifindex()).collect();
        let present_addresses: BTreeSet<(u32, Addr)> = addresses
            .iter()
            .filter_map(|m| address_key(m))
            .map(|(index, ip, len)| (index, (ip, len)))
            .collect();
        let present_routes: BTreeSet<(u32, RouteKey)> = routes
            .iter()
            .map(|m| (route_table(m), route_key(m)))
            .collect();

        let mut state = self.state();
        for msg in links.iter().chain(&addresses).chain(&routes) {
            state.apply(&self.config, msg);
        }
        state.retain_present(&present_links, &present_addresses, &present_routes);
        state.rules.clear();
        state.neighbours.clear();
        for msg in rules.iter().chain(&neighbours) {
            state.apply(&self.config, msg);
        }
        state.rebuild_ports();
        debug!(
            links = state.links.len(),
            routes = state.tables.values().map(BTreeMap::len).sum::<usize>(),
            "database loaded"
        );
        Ok(())
    }

    /// Wait until `pred` holds for the database state.
    pub async fn wait_until<F>(&self, timeout: Duration, mut pred: F) -> bool
    where
        F: FnMut(&DbState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if pred(&self.state()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return pred(&self.state());
            }
        }
    }
}

async fn update_loop(shared: Weak<Shared>, events: Connection) {
    loop {
        let msg = events.recv().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match msg {
            Ok(msg) => shared.dispatch(msg),
            Err(_) if events.is_closed() => break,
            Err(e) => {
                // Lost notifications (overrun, truncation): start over.
                warn!(error = %e, "event socket error, reloading");
                if let Err(e) = shared.load().await {
                    warn!(error = %e, "reload failed");
                }
                shared.changed.notify_waiters();
            }
        }
    }
    debug!("update loop finished");
}

/// The database handle. Clones share the same database.
#[derive(Clone)]
pub struct Ipdb {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for Ipdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Ipdb")
            .field("mode", &self.shared.config.mode)
            .field("links", &state.links.len())
            .field("tables", &state.tables.len())
            .finish()
    }
}

impl Ipdb {
    /// Open the database on the current network namespace.
    pub async fn new(config: Config) -> Result<Self> {
        let conn = Connection::with_rcvbuf(Protocol::Route, config.rcvbuf)?
            .with_timeout(config.request_timeout);
        conn.set_proxy(Some(Arc::new(Proxy::rtnl(&config))));
        let events = Connection::with_rcvbuf(Protocol::Route, config.rcvbuf)?
            .with_timeout(config.request_timeout);
        Self::with_connections(conn, events, config).await
    }

    /// Open the database on a named network namespace.
    ///
    /// Helper programs cannot reach into the namespace, so no link proxy is
    /// installed.
    pub async fn for_netns(name: &str, flags: NetNsFlags, config: Config) -> Result<Self> {
        let conn = Connection::for_netns(name, flags)
            .await?
            .with_timeout(config.request_timeout);
        let events = Connection::for_netns(name, NetNsFlags::default())
            .await?
            .with_timeout(config.request_timeout);
        Self::with_connections(conn, events, config).await
    }

    /// Open the database on existing connections: `conn` for requests,
    /// `events` for notifications.
    pub async fn with_connections(conn: Connection, events: Connection, config: Config) -> Result<Self> {
        events.bind(config.groups, true).await?;
        let (stream, _) = broadcast::channel(EVENT_BACKLOG);
        let shared = Arc::new(Shared {
            config,
            conn,
            events: events.clone(),
            state: Mutex::new(DbState::default()),
            changed: Notify::new(),
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(1),
            stream,
            task: Mutex::new(None),
        });
        shared.load().await?;

        let task = tokio::spawn(update_loop(Arc::downgrade(&shared), events));
        *shared.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!(mode = ?shared.config.mode, "database ready");
        Ok(Self { shared })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The request connection.
    pub fn connection(&self) -> &Connection {
        &self.shared.conn
    }

    /// Interfaces by index. Pending, shadow and flicker interfaces are
    /// reachable through [`by_name`](Self::by_name).
    pub fn interfaces(&self) -> BTreeMap<u32, Interface> {
        self.shared
            .state()
            .links
            .iter()
            .map(|(index, obj)| (*index, Interface::new(Arc::clone(obj), self.clone())))
            .collect()
    }

    /// Interface names, including ones not in the kernel.
    pub fn names(&self) -> Vec<String> {
        self.shared.state().names.keys().cloned().collect()
    }

    pub fn by_index(&self, index: u32) -> Option<Interface> {
        let obj = self.shared.state().links.get(&index).cloned()?;
        Some(Interface::new(obj, self.clone()))
    }

    pub fn by_name(&self, name: &str) -> Option<Interface> {
        let obj = self.shared.state().names.get(name).cloned()?;
        Some(Interface::new(obj, self.clone()))
    }

    /// Addresses of an interface, by index.
    pub fn addresses(&self, index: u32) -> Vec<Addr> {
        self.shared
            .state()
            .addresses
            .get(&index)
            .map(|set| set.items().into_iter().collect())
            .unwrap_or_default()
    }

    pub fn routes(&self) -> Routes {
        Routes::new(self.clone())
    }

    /// Policy rules, as reported by the kernel.
    pub fn rules(&self) -> Vec<Fields> {
        self.shared.state().rules.clone()
    }

    /// Neighbour entries by `(ifindex, address)`.
    pub fn neighbours(&self) -> BTreeMap<(u32, IpAddr), Fields> {
        self.shared.state().neighbours.clone()
    }

    /// Start creating an interface. Nothing reaches the kernel before
    /// [`CreateBuilder::commit`].
    pub fn create(&self, kind: &str, ifname: &str) -> CreateBuilder {
        CreateBuilder::new(self.clone(), kind, ifname)
    }

    /// Reload everything from the kernel.
    pub async fn refresh(&self) -> Result<()> {
        self.shared.load().await?;
        self.shared.changed.notify_waiters();
        Ok(())
    }

    /// Stop the update task and close both connections. Other clones of
    /// this handle stop seeing notifications.
    pub fn release(&self) {
        if let Some(task) = self
            .shared
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.shared.events.close();
        self.shared.conn.close();
        info!("database released");
    }

    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = CallbackId(self.shared.next_callback.fetch_add(1, Ordering::Relaxed));
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.shared.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(c, _)| *c != id);
        callbacks.len() != before
    }

    /// Applied notifications as a stream. A reader that falls too far
    /// behind skips the messages it missed.
    pub fn events(&self) -> impl Stream<Item = Message> + Send + 'static {
        BroadcastStream::new(self.shared.stream.subscribe()).filter_map(|msg| msg.ok())
    }

    /// Wait until an interface called `name` is in the kernel.
    pub async fn wait_interface(&self, name: &str, timeout: Duration) -> Result<Interface> {
        let found = self
            .shared
            .wait_until(timeout, |s| {
                s.names.get(name).is_some_and(|o| o.status() == Status::Active)
            })
            .await;
        if !found {
            return Err(Error::Timeout(timeout));
        }
        self.by_name(name).ok_or_else(|| Error::InterfaceNotFound {
            name: name.to_string(),
        })
    }

    /// Dump of the whole database.
    pub fn to_json(&self) -> Json {
        let state = self.shared.state();
        let interfaces: Vec<Json> = state
            .names
            .values()
            .map(|obj| interface::object_json(obj))
            .collect();
        let routes: BTreeMap<String, Vec<Fields>> = state
            .tables
            .iter()
            .map(|(table, routes)| {
                (
                    table.to_string(),
                    routes.values().map(|obj| obj.fields()).collect(),
                )
            })
            .collect();
        let neighbours: Vec<&Fields> = state.neighbours.values().collect();
        json!({
            "interfaces": interfaces,
            "routes": routes,
            "rules": state.rules,
            "neighbours": neighbours,
        })
    }

    /// Register a pending object under its name.
    pub(crate) fn insert_pending(&self, name: &str, obj: Arc<Transactional>) -> Result<()> {
        let mut state = self.shared.state();
        if let Some(existing) = state.names.get(name) {
            if matches!(existing.status(), Status::Active | Status::Pending | Status::Flicker) {
                return Err(Error::from_errno_with_context(
                    libc::EEXIST,
                    format!("creating {name}"),
                ));
            }
        }
        state.names.insert(name.to_string(), obj);
        Ok(())
    }

    /// Forget a pending object that never made it to the kernel.
    pub(crate) fn remove_pending(&self, name: &str, obj: &Arc<Transactional>) {
        let mut state = self.shared.state();
        if state.names.get(name).is_some_and(|o| Arc::ptr_eq(o, obj)) && obj.status() == Status::Pending {
            state.names.remove(name);
        }
    }

    pub(crate) fn link_object(&self, index: u32) -> Option<Arc<Transactional>> {
        self.shared.state().links.get(&index).cloned()
    }
}
