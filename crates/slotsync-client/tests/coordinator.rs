mod common;

use async_trait::async_trait;
use chrono::NaiveDate;
use common::{eventually, next_peer, scripted_channel, Step};
use serde_json::json;
use slotsync_client::{
    AppointmentSource, ChannelClient, FetchError, Notice, NoticeLevel, Peer, RefreshCoordinator,
    ScopeState, ViewPhase, ViewProfile, ViewRenderer,
};
use slotsync_core::{Appointment, Branch, Scope};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeSource {
    calls: Mutex<Vec<Scope>>,
    delays: Mutex<VecDeque<Duration>>,
    failing: AtomicBool,
}

impl FakeSource {
    fn with_delays(delays: &[Duration]) -> Arc<Self> {
        let source = Self::default();
        source.delays.lock().unwrap().extend(delays.iter().copied());
        Arc::new(source)
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AppointmentSource for FakeSource {
    async fn fetch(&self, scope: &Scope) -> Result<Vec<Appointment>, FetchError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(*scope);
            calls.len()
        };
        let delay = self.delays.lock().unwrap().pop_front().unwrap_or_default();
        tokio::time::sleep(delay).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Status(500));
        }
        let record = json!({
            "id": call,
            "date_of_appointment": format!("{}T10:00:00", scope.date_key()),
            "user": {"f_name": "Aigerim", "l_name": "S.", "gagarina": true},
        });
        let appointment: Appointment = serde_json::from_value(record).expect("appointment");
        Ok(vec![appointment])
    }
}

#[derive(Default)]
struct RecordingRenderer {
    renders: Mutex<Vec<(Scope, Vec<String>)>>,
    notices: Mutex<Vec<Notice>>,
    completed: Mutex<Vec<String>>,
}

impl RecordingRenderer {
    fn render_count(&self) -> usize {
        self.renders.lock().unwrap().len()
    }

    fn last_render(&self) -> (Scope, Vec<String>) {
        self.renders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("rendered at least once")
    }

    fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl ViewRenderer for RecordingRenderer {
    fn render(&self, scope: &Scope, appointments: &[Appointment]) -> anyhow::Result<()> {
        let ids = appointments.iter().map(|item| item.id.clone()).collect();
        self.renders.lock().unwrap().push((*scope, ids));
        Ok(())
    }

    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }

    fn mark_completed(&self, id: &str) -> anyhow::Result<()> {
        self.completed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

fn june_first(branch: Branch) -> Scope {
    let date = NaiveDate::from_ymd_opt(2024, 6, 1).expect("valid date");
    Scope::new(branch, date)
}

struct Fixture {
    channel: ChannelClient,
    peer: Peer,
    scope: Arc<ScopeState>,
    source: Arc<FakeSource>,
    renderer: Arc<RecordingRenderer>,
    coordinator: RefreshCoordinator,
}

async fn attach(scope: Scope, profile: ViewProfile, source: Arc<FakeSource>) -> Fixture {
    let (channel, _connector, mut peers) = scripted_channel(&[Step::Accept], 3);
    channel.connect().await.expect("connect");
    let peer = next_peer(&mut peers).await;
    let scope = Arc::new(ScopeState::with_scope(scope));
    let renderer = Arc::new(RecordingRenderer::default());
    let coordinator = RefreshCoordinator::attach(
        channel.clone(),
        scope.clone(),
        source.clone(),
        renderer.clone(),
        profile,
    )
    .expect("attach inside runtime");
    Fixture {
        channel,
        peer,
        scope,
        source,
        renderer,
        coordinator,
    }
}

fn frame(event_type: &str, branch: &str, date: &str) -> String {
    json!({"type": event_type, "branch": branch, "date": date, "appointment_id": 9}).to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attach_renders_current_scope() {
    let fx = attach(june_first(Branch::All), ViewProfile::calendar(), FakeSource::with_delays(&[])).await;

    eventually(|| fx.renderer.render_count() == 1).await;
    eventually(|| fx.coordinator.phase() == ViewPhase::Idle).await;
    assert_eq!(fx.renderer.last_render().0, june_first(Branch::All));
    assert_eq!(fx.coordinator.stats().fetches_started, 1);
    assert_eq!(fx.channel.router().handler_count("appointment_created"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_for_any_branch_refreshes_all_branches_view() {
    let fx = attach(june_first(Branch::All), ViewProfile::calendar(), FakeSource::with_delays(&[])).await;
    eventually(|| fx.renderer.render_count() == 1).await;

    fx.peer
        .deliver
        .send(frame("appointment_created", "gagarina", "2024-06-01"))
        .expect("deliver");

    eventually(|| fx.renderer.render_count() == 2).await;
    assert_eq!(fx.source.calls(), 2);
    assert_eq!(fx.renderer.notices(), vec![Notice::success("appointment added")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_for_other_branch_is_ignored() {
    let fx = attach(
        june_first(Branch::Baitursynov),
        ViewProfile::calendar(),
        FakeSource::with_delays(&[]),
    )
    .await;
    eventually(|| fx.renderer.render_count() == 1).await;

    fx.peer
        .deliver
        .send(frame("appointment_created", "gagarina", "2024-06-01"))
        .expect("deliver");
    fx.peer
        .deliver
        .send(frame("appointment_deleted", "baitursynov", "2024-06-02"))
        .expect("deliver");

    eventually(|| fx.coordinator.stats().events_ignored == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.source.calls(), 1);
    assert!(fx.renderer.notices().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scope_change_refetches_for_new_scope() {
    let fx = attach(june_first(Branch::All), ViewProfile::calendar(), FakeSource::with_delays(&[])).await;
    eventually(|| fx.renderer.render_count() == 1).await;

    fx.scope.set_branch(Branch::Gagarina);

    eventually(|| fx.renderer.render_count() == 2).await;
    assert_eq!(fx.renderer.last_render().0, june_first(Branch::Gagarina));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renders_only_staff_of_selected_branch() {
    let fx = attach(
        june_first(Branch::Baitursynov),
        ViewProfile::calendar(),
        FakeSource::with_delays(&[]),
    )
    .await;
    eventually(|| fx.renderer.render_count() == 1).await;
    assert_eq!(
        fx.renderer.last_render(),
        (june_first(Branch::Baitursynov), Vec::new())
    );

    fx.scope.set_branch(Branch::Gagarina);
    eventually(|| fx.renderer.render_count() == 2).await;
    assert_eq!(
        fx.renderer.last_render(),
        (june_first(Branch::Gagarina), vec!["2".to_string()])
    );

    fx.scope.set_branch(Branch::All);
    eventually(|| fx.renderer.render_count() == 3).await;
    assert_eq!(fx.renderer.last_render().1, vec!["3".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_stale_fetch_never_overwrites_newer_render() {
    let source = FakeSource::with_delays(&[Duration::from_millis(200)]);
    let fx = attach(june_first(Branch::All), ViewProfile::calendar(), source).await;
    eventually(|| fx.source.calls() == 1).await;

    let seq = fx.coordinator.refresh_now();
    assert_eq!(seq, 2);
    eventually(|| fx.renderer.render_count() == 1).await;
    assert_eq!(fx.renderer.last_render().1, vec!["2".to_string()]);

    eventually(|| fx.coordinator.stats().stale_discarded == 1).await;
    assert_eq!(fx.renderer.render_count(), 1);
    assert_eq!(fx.renderer.last_render().1, vec!["2".to_string()]);
    eventually(|| fx.coordinator.phase() == ViewPhase::Idle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetch_failure_keeps_previous_render_and_notifies() {
    let fx = attach(june_first(Branch::All), ViewProfile::calendar(), FakeSource::with_delays(&[])).await;
    eventually(|| fx.renderer.render_count() == 1).await;

    fx.source.failing.store(true, Ordering::SeqCst);
    fx.coordinator.refresh_now();

    eventually(|| fx.coordinator.stats().fetch_errors == 1).await;
    let notices = fx.renderer.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
    assert_eq!(fx.renderer.render_count(), 1);
    eventually(|| fx.coordinator.phase() == ViewPhase::Idle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn task_completion_marks_entry_without_refetch() {
    let fx = attach(june_first(Branch::All), ViewProfile::task_list(), FakeSource::with_delays(&[])).await;
    eventually(|| fx.renderer.render_count() == 1).await;

    let completed = json!({"type": "task_completed", "branch": "all", "date": "2024-06-01", "taskId": "42"});
    let missing_id = json!({"type": "task_completed", "branch": "all", "date": "2024-06-01"});
    fx.peer.deliver.send(missing_id.to_string()).expect("deliver");
    fx.peer.deliver.send(completed.to_string()).expect("deliver");

    eventually(|| !fx.renderer.completed.lock().unwrap().is_empty()).await;
    assert_eq!(*fx.renderer.completed.lock().unwrap(), vec!["42".to_string()]);
    assert_eq!(fx.source.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detach_unregisters_observer_and_handlers() {
    let fx = attach(june_first(Branch::All), ViewProfile::task_list(), FakeSource::with_delays(&[])).await;
    eventually(|| fx.renderer.render_count() == 1).await;

    fx.coordinator.detach();
    fx.coordinator.detach();
    assert_eq!(fx.scope.observer_count(), 0);
    assert_eq!(fx.channel.router().handler_count("task_updated"), 0);

    fx.scope.set_date(NaiveDate::from_ymd_opt(2024, 6, 2).expect("valid date"));
    fx.peer
        .deliver
        .send(frame("task_updated", "all", "2024-06-02"))
        .expect("deliver");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.source.calls(), 1);
}
