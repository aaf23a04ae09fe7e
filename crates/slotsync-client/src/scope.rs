use crate::fanout::{invoke_all, lock, FanoutReport, HandlerId, HandlerList};
use chrono::NaiveDate;
use slotsync_core::{Branch, InboundEvent, Scope};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub type ObserverId = HandlerId;

struct ScopeInner {
    scope: Scope,
    observers: HandlerList<Scope>,
}

/// Branch/date filter shared by the views of one screen. Every mutation
/// notifies all observers synchronously, in registration order, before it
/// returns.
pub struct ScopeState {
    inner: Mutex<ScopeInner>,
}

impl Default for ScopeState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeState {
    pub fn new() -> Self {
        Self::with_scope(Scope::today())
    }

    pub fn with_scope(scope: Scope) -> Self {
        Self {
            inner: Mutex::new(ScopeInner {
                scope,
                observers: HandlerList::new(),
            }),
        }
    }

    pub fn current(&self) -> Scope {
        lock(&self.inner).scope
    }

    pub fn branch(&self) -> Branch {
        self.current().branch
    }

    pub fn date(&self) -> NaiveDate {
        self.current().date
    }

    pub fn set_branch(&self, branch: Branch) -> FanoutReport {
        self.mutate(|scope| scope.branch = branch)
    }

    pub fn set_date(&self, date: NaiveDate) -> FanoutReport {
        self.mutate(|scope| scope.date = date)
    }

    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&Scope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        lock(&self.inner).observers.add(Arc::new(observer))
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        lock(&self.inner).observers.remove(id)
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner).observers.len()
    }

    pub fn is_relevant(&self, event: &InboundEvent) -> bool {
        self.current().is_relevant(event)
    }

    /// Date path segment and optional `branch` query value for the
    /// appointments endpoint.
    pub fn appointments_query(&self) -> (String, Option<&'static str>) {
        let scope = self.current();
        (scope.date_key(), scope.branch_query())
    }

    fn mutate(&self, apply: impl FnOnce(&mut Scope)) -> FanoutReport {
        let (scope, observers) = {
            let mut inner = lock(&self.inner);
            apply(&mut inner.scope);
            (inner.scope, inner.observers.snapshot())
        };
        debug!(event = "scope_changed", scope = %scope, observers = observers.len());
        invoke_all(&observers, &scope, "scope_observer")
    }
}
