//! Routing tables.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value as Json;
use tracing::{debug, info, trace, warn};

use super::Ipdb;
use super::transactional::{Changes, Fields, State, Status, Tid, Transactional};
use crate::config::Mode;
use crate::netlink::{Error, Result};
use crate::rtnl::RouteRequest;
use crate::rtnl::route::{RT_TABLE_MAIN, RouteKey};
use crate::value::Value;

/// Header fields the kernel reports that a request never carries.
const REPORTED_ONLY: &[&str] = &["flags", "cacheinfo", "expires"];

/// Build a request from route fields. Keys outside `strict` that the
/// builder does not know are kernel reports and are skipped.
fn request(fields: &Fields, strict: &BTreeSet<String>) -> Result<RouteRequest> {
    let mut req = RouteRequest::new();
    for (key, value) in fields {
        if REPORTED_ONLY.contains(&key.as_str()) && !strict.contains(key) {
            continue;
        }
        match req.set(key, value.clone()) {
            Ok(_) => {}
            Err(e) if !strict.contains(key) => trace!(key, error = %e, "skipping route field"),
            Err(e) => return Err(e),
        }
    }
    Ok(req)
}

/// Every routing table in the database.
#[derive(Debug, Clone)]
pub struct Routes {
    db: Ipdb,
}

impl Routes {
    pub(crate) fn new(db: Ipdb) -> Self {
        Self { db }
    }

    /// Ids of the tables that hold routes.
    pub fn tables(&self) -> Vec<u32> {
        self.db
            .shared
            .state()
            .tables
            .iter()
            .filter(|(_, routes)| !routes.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn table(&self, table: u32) -> Vec<Route> {
        self.db
            .shared
            .state()
            .tables
            .get(&table)
            .map(|routes| {
                routes
                    .values()
                    .map(|obj| Route::new(Arc::clone(obj), self.db.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A route of the main table by destination (`"default"` or
    /// `"addr/len"`).
    pub fn get(&self, dst: &str) -> Result<Option<Route>> {
        self.get_in(RT_TABLE_MAIN, &RouteKey::parse(dst)?)
    }

    /// A route whose key matches `key`; interfaces left zero match any.
    pub fn get_in(&self, table: u32, key: &RouteKey) -> Result<Option<Route>> {
        let state = self.db.shared.state();
        let found = state
            .tables
            .get(&table)
            .and_then(|routes| routes.iter().find(|(k, _)| k.matches(key)))
            .map(|(_, obj)| Route::new(Arc::clone(obj), self.db.clone()));
        Ok(found)
    }

    /// A new route with an open transaction. It reaches the kernel on
    /// [`Route::commit`].
    ///
    /// ```ignore
    /// let route = ipdb.routes().add([
    ///     ("dst", Value::from("10.1.0.0/24")),
    ///     ("gateway", Value::from("10.0.0.254")),
    /// ])?;
    /// route.commit().await?;
    /// ```
    pub fn add<I, K, V>(&self, spec: I) -> Result<Route>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mode = self.db.shared.config.mode;
        if mode == Mode::Snapshot {
            return Err(Error::ReadOnly);
        }
        let fields: Fields = spec
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if !fields.contains_key("dst") {
            return Err(Error::InvalidAttribute("a route needs a dst".into()));
        }
        let strict = fields.keys().cloned().collect();
        request(&fields, &strict)?;

        let obj = Arc::new(Transactional::new(mode, Status::Pending, Fields::new()));
        let tid = obj.begin()?;
        obj.with_tx(tid, |tx| {
            for (key, value) in fields {
                tx.set(&key, value);
            }
            Ok(())
        })?;
        Ok(Route::new(obj, self.db.clone()))
    }
}

/// Handle to a route.
#[derive(Clone)]
pub struct Route {
    obj: Arc<Transactional>,
    db: Ipdb,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("table", &self.table())
            .field("key", &self.key())
            .field("status", &self.status())
            .finish()
    }
}

impl Route {
    fn new(obj: Arc<Transactional>, db: Ipdb) -> Self {
        Self { obj, db }
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.obj.get(field)
    }

    pub fn fields(&self) -> Fields {
        self.obj.fields()
    }

    pub fn status(&self) -> Status {
        self.obj.status()
    }

    pub fn table(&self) -> u32 {
        self.get("table")
            .and_then(|v| v.as_u32())
            .unwrap_or(RT_TABLE_MAIN)
    }

    pub fn key(&self) -> Option<RouteKey> {
        request(&self.fields(), &BTreeSet::new())
            .ok()
            .map(|req| req.key())
    }

    pub fn to_json(&self) -> Json {
        super::interface::object_json(&self.obj)
    }

    pub fn begin(&self) -> Result<Tid> {
        self.obj.begin()
    }

    pub fn rollback(&self) -> Result<()> {
        let tid = self.obj.top().ok_or(Error::NoTransaction)?;
        self.obj
            .take_tx(tid)
            .map(|_| ())
            .ok_or(Error::NoTransaction)
    }

    async fn mutate(&self, f: impl FnOnce(&mut super::transactional::Transaction)) -> Result<()> {
        let (tid, opened) = self.obj.ensure_tx()?;
        self.obj.with_tx(tid, |tx| {
            f(tx);
            Ok(())
        })?;
        if opened && self.obj.mode == Mode::Direct {
            self.commit_tid(tid).await?;
        }
        Ok(())
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.mutate(|tx| tx.set(key, value)).await
    }

    /// Delete the route on commit.
    pub async fn remove(&self) -> Result<()> {
        self.mutate(|tx| tx.in_kernel = false).await
    }

    pub async fn commit(&self) -> Result<()> {
        let tid = self.obj.top().ok_or(Error::NoTransaction)?;
        self.commit_tid(tid).await
    }

    pub async fn commit_tid(&self, tid: Tid) -> Result<()> {
        let _guard = self.obj.commit_lock.lock().await;
        let tx = self.obj.take_tx(tid).ok_or(Error::NoTransaction)?;
        let desired = tx.desired(&self.obj.fields());
        let current = self.obj.state();

        match (current.in_kernel, desired.in_kernel) {
            (false, true) => self.create(&desired, &tx.touched).await,
            (true, true) => self.change(&current, &desired, &tx.touched).await,
            (true, false) => self.delete(&current).await,
            (false, false) => Ok(()),
        }
    }

    async fn create(&self, desired: &State, touched: &BTreeSet<String>) -> Result<()> {
        let req = request(&desired.fields, touched)?;
        let (table, key) = (req.table(), req.key());
        self.db
            .shared
            .state()
            .pending_routes
            .push((table, key, Arc::clone(&self.obj)));

        info!(table, route = %key, "adding route");
        let result = self.add_and_wait(&req).await;
        if result.is_err() {
            self.db
                .shared
                .state()
                .pending_routes
                .retain(|(_, _, o)| !Arc::ptr_eq(o, &self.obj));
        }
        result
    }

    async fn add_and_wait(&self, req: &RouteRequest) -> Result<()> {
        self.db.shared.conn.add_route(req, false).await?;
        let obj = Arc::clone(&self.obj);
        let added = self
            .db
            .shared
            .wait_until(self.db.shared.config.commit_timeout, |_| {
                obj.status() == Status::Active
            })
            .await;
        if !added {
            return Err(Error::TargetMissed {
                field: "dst".into(),
            });
        }
        Ok(())
    }

    async fn change(&self, current: &State, desired: &State, touched: &BTreeSet<String>) -> Result<()> {
        let changes = Changes::between(current, desired);
        if changes.added.is_empty() {
            return Ok(());
        }
        let req = request(&desired.fields, touched)?;
        debug!(route = %req.key(), "replacing route");
        let result = match self.db.shared.conn.add_route(&req, true).await {
            Ok(()) => self.await_fields(&changes).await,
            Err(e) => Err(e),
        };
        let Err(error) = result else {
            return Ok(());
        };

        warn!(error = %error, "route change failed, rolling back");
        let restore = async {
            let req = request(&current.fields, &BTreeSet::new())?;
            self.db.shared.conn.add_route(&req, true).await
        };
        match restore.await {
            Ok(()) => Err(Error::commit_failed(
                format!("changing route {}", req.key()),
                Some(error),
            )),
            Err(rollback) => {
                if let Err(e) = self.db.refresh().await {
                    warn!(error = %e, "reload after failed rollback");
                }
                Err(Error::Broken {
                    original: Box::new(error),
                    rollback: Box::new(rollback),
                })
            }
        }
    }

    /// Wait for every changed field outside the route's identity.
    async fn await_fields(&self, changes: &Changes) -> Result<()> {
        const IDENTITY: &[&str] = &["dst", "dst_len", "oif", "iif", "table", "family"];
        let timeout = self.db.shared.config.commit_timeout;
        let targets: Vec<_> = changes
            .added
            .iter()
            .filter(|(k, _)| !IDENTITY.contains(&k.as_str()))
            .map(|(k, v)| self.obj.watch(k, v.clone(), None))
            .collect();
        for target in &targets {
            if !target.done.wait_timeout(timeout).await {
                for t in &targets {
                    self.obj.unwatch(t);
                }
                return Err(Error::TargetMissed {
                    field: target.field.clone(),
                });
            }
        }
        Ok(())
    }

    async fn delete(&self, current: &State) -> Result<()> {
        let req = request(&current.fields, &BTreeSet::new())?;
        info!(table = req.table(), route = %req.key(), "deleting route");
        // A missing route comes back as the kernel's ESRCH; nothing changes.
        self.db.shared.conn.del_route(&req).await?;
        let obj = Arc::clone(&self.obj);
        let gone = self
            .db
            .shared
            .wait_until(self.db.shared.config.commit_timeout, |_| {
                obj.status() != Status::Active
            })
            .await;
        if !gone {
            return Err(Error::TargetMissed {
                field: "dst".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_request_skips_reported_fields() {
        let kernel = fields(&[
            ("dst", Value::from("10.1.0.0/24")),
            ("dst_len", Value::Int(24)),
            ("flags", Value::Int(0x200)),
            ("table", Value::Int(254)),
            ("mfc_stats", Value::Int(1)),
            ("oif", Value::Int(3)),
        ]);
        let req = request(&kernel, &BTreeSet::new()).unwrap();
        let key = req.key();
        assert_eq!(key.dst_len, 24);
        assert_eq!(key.oif, 3);
        assert_eq!(req.table(), 254);
    }

    #[test]
    fn test_request_rejects_unknown_user_keys() {
        let spec = fields(&[("dst", Value::from("default")), ("bogus", Value::Int(1))]);
        let strict = spec.keys().cloned().collect();
        assert!(request(&spec, &strict).is_err());
    }
}
