//! One-shot completion events and field targets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::value::Value;

/// An event that is set once and stays set.
#[derive(Debug, Default)]
pub struct Completion {
    set: AtomicBool,
    notify: Notify,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event. Returns `true` for the call that actually set it.
    pub fn set(&self) -> bool {
        let first = !self.set.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Wait at most `timeout`. Returns whether the event is set.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

/// `V & M' & M == V' & M' & M`: the bits both masks cover agree.
pub fn flags_match(value: u32, mask: u32, observed: u32, observed_mask: u32) -> bool {
    let m = mask & observed_mask;
    value & m == observed & m
}

/// A value a field is expected to take once the kernel confirms a change.
#[derive(Debug)]
pub struct FieldTarget {
    pub field: String,
    pub value: Value,
    /// Change mask for `flags`; other fields compare by equality.
    pub mask: Option<u32>,
    pub done: Completion,
}

impl FieldTarget {
    pub fn new(field: impl Into<String>, value: Value, mask: Option<u32>) -> Self {
        Self {
            field: field.into(),
            value,
            mask,
            done: Completion::new(),
        }
    }

    pub fn matches(&self, current: Option<&Value>) -> bool {
        match (self.mask, current) {
            (Some(mask), Some(current)) => match (self.value.as_u32(), current.as_u32()) {
                (Some(v), Some(c)) => flags_match(v, mask, c, u32::MAX),
                _ => false,
            },
            (None, Some(current)) => *current == self.value,
            (_, None) => self.value.is_null(),
        }
    }
}
