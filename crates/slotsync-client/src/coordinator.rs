use crate::channel::ChannelClient;
use crate::fanout::{lock, HandlerId};
use crate::scope::{ObserverId, ScopeState};
use crate::source::{AppointmentSource, FetchError};
use anyhow::anyhow;
use serde::Serialize;
use slotsync_core::{Appointment, EventType, InboundEvent, Scope};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const LOAD_FAILED: &str = "failed to load appointments";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("refresh coordinator must be attached inside a tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Warning,
    Error,
}

/// User-facing toast raised by a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Refresh,
    RefreshWithNotice(Notice),
    /// Flag the referenced entry (`taskId`, else `appointment_id`) as done
    /// without a re-fetch.
    MarkCompleted,
}

/// Which events a view reacts to, and how.
#[derive(Debug, Clone)]
pub struct ViewProfile {
    name: String,
    actions: Vec<(EventType, EventAction)>,
}

impl ViewProfile {
    pub fn new(name: impl Into<String>, actions: Vec<(EventType, EventAction)>) -> Self {
        Self {
            name: name.into(),
            actions,
        }
    }

    pub fn calendar() -> Self {
        Self::new(
            "calendar",
            vec![
                (
                    EventType::AppointmentCreated,
                    EventAction::RefreshWithNotice(Notice::success("appointment added")),
                ),
                (EventType::AppointmentUpdated, EventAction::Refresh),
                (
                    EventType::AppointmentDeleted,
                    EventAction::RefreshWithNotice(Notice::warning("appointment removed")),
                ),
                (
                    EventType::AppointmentCompleted,
                    EventAction::RefreshWithNotice(Notice::success("appointment completed")),
                ),
            ],
        )
    }

    pub fn task_list() -> Self {
        Self::new(
            "task_list",
            vec![
                (EventType::AppointmentUpdated, EventAction::Refresh),
                (EventType::AppointmentCreated, EventAction::Refresh),
                (EventType::AppointmentDeleted, EventAction::Refresh),
                (EventType::TaskUpdated, EventAction::Refresh),
                (EventType::TaskCompleted, EventAction::MarkCompleted),
            ],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[(EventType, EventAction)] {
        &self.actions
    }

    pub fn action_for(&self, event_type: &str) -> Option<&EventAction> {
        self.actions
            .iter()
            .find(|(kind, _)| kind.as_str() == event_type)
            .map(|(_, action)| action)
    }
}

/// Presentation side of a view. Called from runtime worker threads.
pub trait ViewRenderer: Send + Sync + 'static {
    fn render(&self, scope: &Scope, appointments: &[Appointment]) -> anyhow::Result<()>;
    fn notify(&self, notice: Notice);
    fn mark_completed(&self, id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewPhase {
    Idle,
    Fetching,
    Rendering,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub fetches_started: u64,
    pub renders: u64,
    pub stale_discarded: u64,
    pub fetch_errors: u64,
    pub events_ignored: u64,
}

struct Progress {
    next_seq: u64,
    in_flight: usize,
    phase: ViewPhase,
    stats: CoordinatorStats,
}

#[derive(Default)]
struct Registrations {
    observer: Option<ObserverId>,
    handlers: Vec<(EventType, HandlerId)>,
}

struct CoordinatorInner {
    profile: ViewProfile,
    channel: ChannelClient,
    scope: Arc<ScopeState>,
    source: Arc<dyn AppointmentSource>,
    renderer: Arc<dyn ViewRenderer>,
    runtime: Handle,
    progress: Mutex<Progress>,
    // Sequence number of the fetch currently on screen.
    render_gate: Mutex<u64>,
    registrations: Mutex<Registrations>,
}

/// Keeps one view in sync with its scope: any scope change and any relevant
/// realtime event re-fetches the appointments and re-renders them.
///
/// Fetches are sequence-numbered. A result is rendered only if no newer
/// fetch has rendered yet and the scope it was fetched for is still current.
/// Rendered entries are limited to staff working at the scope's branch.
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RefreshCoordinator {
    pub fn attach(
        channel: ChannelClient,
        scope: Arc<ScopeState>,
        source: Arc<dyn AppointmentSource>,
        renderer: Arc<dyn ViewRenderer>,
        profile: ViewProfile,
    ) -> Result<Self, CoordinatorError> {
        let runtime = Handle::try_current().map_err(|_| CoordinatorError::NoRuntime)?;
        let inner = Arc::new(CoordinatorInner {
            profile,
            channel,
            scope,
            source,
            renderer,
            runtime,
            progress: Mutex::new(Progress {
                next_seq: 0,
                in_flight: 0,
                phase: ViewPhase::Idle,
                stats: CoordinatorStats::default(),
            }),
            render_gate: Mutex::new(0),
            registrations: Mutex::new(Registrations::default()),
        });

        let weak = Arc::downgrade(&inner);
        let observer = inner.scope.add_observer(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.refresh("scope_changed");
            }
            Ok(())
        });

        let mut handlers = Vec::new();
        for (kind, action) in inner.profile.actions().to_vec() {
            let weak: Weak<CoordinatorInner> = Arc::downgrade(&inner);
            let id = inner.channel.on(kind.as_str(), move |event| match weak.upgrade() {
                Some(inner) => inner.handle_event(event, &action),
                None => Ok(()),
            });
            handlers.push((kind, id));
        }

        {
            let mut registrations = lock(&inner.registrations);
            registrations.observer = Some(observer);
            registrations.handlers = handlers;
        }
        info!(
            event = "view_attached",
            view = inner.profile.name(),
            scope = %inner.scope.current()
        );
        inner.refresh("attach");
        Ok(Self { inner })
    }

    pub fn profile(&self) -> &ViewProfile {
        &self.inner.profile
    }

    pub fn phase(&self) -> ViewPhase {
        lock(&self.inner.progress).phase
    }

    pub fn stats(&self) -> CoordinatorStats {
        lock(&self.inner.progress).stats
    }

    /// Starts a fetch for the current scope and returns its sequence number.
    pub fn refresh_now(&self) -> u64 {
        self.inner.refresh("manual")
    }

    /// Removes the scope observer and every channel handler. Idempotent.
    pub fn detach(&self) {
        let registrations = std::mem::take(&mut *lock(&self.inner.registrations));
        if let Some(observer) = registrations.observer {
            self.inner.scope.remove_observer(observer);
        } else {
            return;
        }
        for (kind, id) in registrations.handlers {
            self.inner.channel.off(kind.as_str(), id);
        }
        info!(event = "view_detached", view = self.inner.profile.name());
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        self.detach();
    }
}

impl CoordinatorInner {
    fn handle_event(self: &Arc<Self>, event: &InboundEvent, action: &EventAction) -> anyhow::Result<()> {
        if !self.scope.is_relevant(event) {
            lock(&self.progress).stats.events_ignored += 1;
            debug!(
                event = "event_ignored",
                view = self.profile.name(),
                event_type = %event.event_type,
                branch = ?event.branch,
                date = ?event.date
            );
            return Ok(());
        }

        match action {
            EventAction::Refresh => {
                self.refresh(&event.event_type);
            }
            EventAction::RefreshWithNotice(notice) => {
                self.renderer.notify(notice.clone());
                self.refresh(&event.event_type);
            }
            EventAction::MarkCompleted => {
                let id = event
                    .id_field("taskId")
                    .or_else(|| event.id_field("appointment_id"))
                    .ok_or_else(|| anyhow!("{} without taskId or appointment_id", event.event_type))?;
                debug!(event = "entry_completed", view = self.profile.name(), id = %id);
                self.renderer.mark_completed(&id)?;
            }
        }
        Ok(())
    }

    fn refresh(self: &Arc<Self>, reason: &str) -> u64 {
        let scope = self.scope.current();
        let seq = {
            let mut progress = lock(&self.progress);
            progress.next_seq += 1;
            progress.in_flight += 1;
            progress.phase = ViewPhase::Fetching;
            progress.stats.fetches_started += 1;
            progress.next_seq
        };
        debug!(
            event = "refresh_started",
            view = self.profile.name(),
            reason = reason,
            seq = seq,
            scope = %scope
        );

        let inner = self.clone();
        self.runtime.spawn(async move {
            let result = inner.source.fetch(&scope).await;
            inner.complete(seq, scope, result);
        });
        seq
    }

    fn complete(&self, seq: u64, scope: Scope, result: Result<Vec<Appointment>, FetchError>) {
        let mut gate = lock(&self.render_gate);
        if seq <= *gate || scope != self.scope.current() {
            drop(gate);
            debug!(
                event = "refresh_discarded",
                view = self.profile.name(),
                seq = seq,
                scope = %scope,
                failed = result.is_err()
            );
            self.finish(|stats| stats.stale_discarded += 1);
            return;
        }

        match result {
            Ok(fetched) => {
                let total = fetched.len();
                let appointments: Vec<Appointment> = fetched
                    .into_iter()
                    .filter(|item| item.belongs_to(scope.branch))
                    .collect();
                lock(&self.progress).phase = ViewPhase::Rendering;
                let rendered = match self.renderer.render(&scope, &appointments) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(event = "render_failed", view = self.profile.name(), error = %err);
                        false
                    }
                };
                *gate = seq;
                drop(gate);
                debug!(
                    event = "refresh_rendered",
                    view = self.profile.name(),
                    seq = seq,
                    count = appointments.len(),
                    filtered = total - appointments.len()
                );
                self.finish(|stats| {
                    if rendered {
                        stats.renders += 1;
                    }
                });
            }
            Err(err) => {
                drop(gate);
                warn!(
                    event = "refresh_failed",
                    view = self.profile.name(),
                    seq = seq,
                    scope = %scope,
                    error = %err
                );
                self.renderer.notify(Notice::error(LOAD_FAILED));
                self.finish(|stats| stats.fetch_errors += 1);
            }
        }
    }

    fn finish(&self, record: impl FnOnce(&mut CoordinatorStats)) {
        let mut progress = lock(&self.progress);
        progress.in_flight = progress.in_flight.saturating_sub(1);
        progress.phase = if progress.in_flight == 0 {
            ViewPhase::Idle
        } else {
            ViewPhase::Fetching
        };
        record(&mut progress.stats);
    }
}
