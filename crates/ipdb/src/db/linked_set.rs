//! Sets whose changes cascade to downstream sets.
//!
//! An interface's `ipaddr` set feeds the database-wide address index and
//! every open transaction on the interface, so kernel notifications show up
//! everywhere at once. A transaction that changed a member itself excludes
//! that member from the cascade, keeping the caller's intent.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::completion::Completion;
use crate::value::Value;

/// Metadata kept alongside a member (address broadcast, label, ...).
pub type Raw = BTreeMap<String, Value>;

struct Downstream<T> {
    set: Weak<Mutex<Inner<T>>>,
    exclude: BTreeSet<T>,
}

struct Inner<T> {
    items: BTreeSet<T>,
    raw: BTreeMap<T, Raw>,
    links: Vec<Downstream<T>>,
    /// Members that take part in target comparison.
    filter: fn(&T) -> bool,
    target: Option<(BTreeSet<T>, Arc<Completion>)>,
}

impl<T: Ord + Clone> Inner<T> {
    fn check_target(&mut self) -> bool {
        let filter = self.filter;
        let Some((target, done)) = &self.target else {
            return false;
        };
        let current: BTreeSet<&T> = self.items.iter().filter(|x| filter(x)).collect();
        let wanted: BTreeSet<&T> = target.iter().filter(|x| filter(x)).collect();
        if current != wanted {
            return false;
        }
        done.set();
        self.target = None;
        true
    }
}

enum Op<T> {
    Add(T, Option<Raw>),
    Remove(T),
}

impl<T> Op<T> {
    fn item(&self) -> &T {
        match self {
            Op::Add(x, _) | Op::Remove(x) => x,
        }
    }
}

/// Shared handle to a linked set. Clones refer to the same set.
pub struct LinkedSet<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for LinkedSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Ord + Clone + fmt::Debug> fmt::Debug for LinkedSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.lock().items.iter()).finish()
    }
}

impl<T: Ord + Clone> Default for LinkedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Ord + Clone> LinkedSet<T> {
    pub fn new() -> Self {
        Self::with_filter(|_| true)
    }

    /// A set whose target comparison only looks at members passing `filter`.
    pub fn with_filter(filter: fn(&T) -> bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: BTreeSet::new(),
                raw: BTreeMap::new(),
                links: Vec::new(),
                filter,
                target: None,
            })),
        }
    }

    /// An unlinked copy of the members and their metadata.
    pub fn detached(&self) -> Self {
        let src = self.lock();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: src.items.clone(),
                raw: src.raw.clone(),
                links: Vec::new(),
                filter: src.filter,
                target: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        lock(&self.inner)
    }

    pub fn add(&self, item: T, raw: Option<Raw>) {
        self.cascade(Op::Add(item, raw));
    }

    pub fn remove(&self, item: &T) {
        self.cascade(Op::Remove(item.clone()));
    }

    /// Apply `op` here, then breadth-first to every downstream set that
    /// does not exclude the member. Each set is locked only while it is
    /// updated.
    fn cascade(&self, op: Op<T>) {
        let mut queue = VecDeque::from([Arc::clone(&self.inner)]);
        let mut seen = Vec::new();
        while let Some(set) = queue.pop_front() {
            if seen.contains(&Arc::as_ptr(&set)) {
                continue;
            }
            seen.push(Arc::as_ptr(&set));
            let mut inner = lock(&set);
            match &op {
                Op::Add(item, raw) => {
                    inner.items.insert(item.clone());
                    if let Some(raw) = raw {
                        inner.raw.insert(item.clone(), raw.clone());
                    }
                }
                Op::Remove(item) => {
                    inner.items.remove(item);
                    inner.raw.remove(item);
                }
            }
            inner.check_target();
            inner.links.retain(|link| link.set.strong_count() > 0);
            queue.extend(
                inner
                    .links
                    .iter()
                    .filter(|link| !link.exclude.contains(op.item()))
                    .filter_map(|link| link.set.upgrade()),
            );
        }
    }

    /// Forward future changes to `downstream`.
    pub fn connect(&self, downstream: &LinkedSet<T>) {
        if Arc::ptr_eq(&self.inner, &downstream.inner) {
            return;
        }
        self.lock().links.push(Downstream {
            set: Arc::downgrade(&downstream.inner),
            exclude: BTreeSet::new(),
        });
    }

    pub fn disconnect(&self, downstream: &LinkedSet<T>) {
        let target = Arc::as_ptr(&downstream.inner);
        self.lock()
            .links
            .retain(|link| link.set.as_ptr() != target);
    }

    /// Stop cascading changes of `item` to `downstream`.
    pub fn exclude(&self, downstream: &LinkedSet<T>, item: T) {
        let target = Arc::as_ptr(&downstream.inner);
        if let Some(link) = self
            .lock()
            .links
            .iter_mut()
            .find(|link| link.set.as_ptr() == target)
        {
            link.exclude.insert(item);
        }
    }

    pub fn items(&self) -> BTreeSet<T> {
        self.lock().items.clone()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.lock().items.contains(item)
    }

    pub fn raw(&self, item: &T) -> Option<Raw> {
        self.lock().raw.get(item).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Whether `item` counts for target comparison.
    pub fn counts(&self, item: &T) -> bool {
        (self.lock().filter)(item)
    }

    /// Arm a target. The returned event fires once the members equal
    /// `target` under the filter; it may already be set.
    pub fn set_target(&self, target: BTreeSet<T>) -> Arc<Completion> {
        let done = Arc::new(Completion::new());
        let mut inner = self.lock();
        inner.target = Some((target, Arc::clone(&done)));
        inner.check_target();
        done
    }

    /// Fire the armed target if the members match it.
    pub fn check_target(&self) -> bool {
        self.lock().check_target()
    }
}
