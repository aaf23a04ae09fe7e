use crate::config::ChannelConfig;
use crate::connector::{Connection, Connector, WsConnector};
use crate::fanout::{lock, HandlerId};
use crate::router::EventRouter;
use serde::Serialize;
use serde_json::Value;
use slotsync_core::{encode_frame, InboundEvent};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("gave up after {attempts} reconnect attempts")]
    MaxAttemptsExceeded { attempts: u32 },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub state: ConnectionStatus,
    pub connected: bool,
    pub pending_messages: usize,
    pub reconnect_attempts: u32,
}

type Outcome = Option<Result<(), ChannelError>>;

struct PendingMessage {
    event_type: String,
    text: String,
    done: oneshot::Sender<bool>,
}

struct ConnectionState {
    status: ConnectionStatus,
    reconnect_attempts: u32,
    pending: VecDeque<PendingMessage>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    // Shared outcome of the attempt cycle in flight, if any.
    cycle: Option<watch::Receiver<Outcome>>,
    retry_task: Option<JoinHandle<()>>,
    // Bumped on open and on disconnect; tasks holding an older value are stale.
    generation: u64,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            pending: VecDeque::new(),
            outbound: None,
            cycle: None,
            retry_task: None,
            generation: 0,
        }
    }

    fn write(&self, text: String) -> Result<(), ChannelError> {
        let outbound = self.outbound.as_ref().ok_or(ChannelError::Closed)?;
        outbound.send(text).map_err(|_| ChannelError::Closed)
    }
}

struct Shared {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    router: EventRouter,
    state: Mutex<ConnectionState>,
}

enum Retry {
    After(Duration),
    Exhausted(u32),
    Stale,
}

/// Reconnecting message channel. Cheap to clone; clones share one
/// connection, one outbound queue and one handler registry.
///
/// Outbound messages sent while the channel is not open are queued and
/// flushed in FIFO order as soon as the next connection opens. Failed
/// attempts and abrupt closes are retried after a fixed interval until
/// `max_reconnect_attempts` consecutive retries have failed.
#[derive(Clone)]
pub struct ChannelClient {
    shared: Arc<Shared>,
}

impl ChannelClient {
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: ChannelConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                router: EventRouter::new(),
                state: Mutex::new(ConnectionState::new()),
            }),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn router(&self) -> &EventRouter {
        &self.shared.router
    }

    /// Resolves once the channel is open. Concurrent callers share the
    /// attempt cycle already in flight.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let mut cycle = {
            let mut state = lock(&self.shared.state);
            if state.status == ConnectionStatus::Connected {
                return Ok(());
            }
            match state.cycle.clone() {
                Some(cycle) => cycle,
                None => start_cycle(&self.shared, &mut state, Duration::ZERO),
            }
        };
        wait_outcome(&mut cycle).await
    }

    /// Returns `true` when the frame reached the live connection.
    pub async fn send(&self, event_type: &str, payload: Value) -> bool {
        let text = match encode_frame(event_type, &payload, self.shared.config.max_frame_bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "send_rejected", event_type = event_type, error = %err);
                return false;
            }
        };

        let delivered = {
            let mut state = lock(&self.shared.state);
            if state.status == ConnectionStatus::Connected {
                return log_write(event_type, state.write(text));
            }
            // Only `open` drains `pending`, so nothing sent before the
            // connection opens can overtake an earlier message.
            let (done, delivered) = oneshot::channel();
            state.pending.push_back(PendingMessage {
                event_type: event_type.to_string(),
                text,
                done,
            });
            debug!(
                event = "message_queued",
                event_type = event_type,
                pending = state.pending.len()
            );
            if state.cycle.is_none() {
                start_cycle(&self.shared, &mut state, Duration::ZERO);
            }
            delivered
        };
        delivered.await.unwrap_or(false)
    }

    pub fn on<F>(&self, event_type: &str, handler: F) -> HandlerId
    where
        F: Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.router.on(event_type, handler)
    }

    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        self.shared.router.off(event_type, id)
    }

    /// Closes the live connection, cancels any retry and fails every queued
    /// message.
    pub fn disconnect(&self) {
        let (pending, retry_task) = {
            let mut state = lock(&self.shared.state);
            state.generation += 1;
            state.status = ConnectionStatus::Disconnected;
            state.cycle = None;
            state.outbound = None;
            (
                std::mem::take(&mut state.pending),
                state.retry_task.take(),
            )
        };
        if let Some(task) = retry_task {
            task.abort();
        }
        let dropped = pending.len();
        for message in pending {
            let _ = message.done.send(false);
        }
        info!(event = "channel_disconnected", url = %self.shared.config.url, dropped = dropped);
    }

    pub fn status(&self) -> ChannelStatus {
        let state = lock(&self.shared.state);
        ChannelStatus {
            state: state.status,
            connected: state.status == ConnectionStatus::Connected,
            pending_messages: state.pending.len(),
            reconnect_attempts: state.reconnect_attempts,
        }
    }
}

fn log_write(event_type: &str, result: Result<(), ChannelError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(event = "send_failed", event_type = event_type, error = %err);
            false
        }
    }
}

async fn wait_outcome(cycle: &mut watch::Receiver<Outcome>) -> Result<(), ChannelError> {
    loop {
        let current = cycle.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if cycle.changed().await.is_err() {
            let last = cycle.borrow().clone();
            return last.unwrap_or(Err(ChannelError::Cancelled));
        }
    }
}

fn start_cycle(
    shared: &Arc<Shared>,
    state: &mut ConnectionState,
    delay: Duration,
) -> watch::Receiver<Outcome> {
    let (outcome, cycle) = watch::channel(None);
    state.cycle = Some(cycle.clone());
    let generation = state.generation;
    state.retry_task = Some(tokio::spawn(run_cycle(
        shared.clone(),
        outcome,
        delay,
        generation,
    )));
    cycle
}

async fn run_cycle(
    shared: Arc<Shared>,
    outcome: watch::Sender<Outcome>,
    mut delay: Duration,
    generation: u64,
) {
    loop {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !begin_attempt(&shared, generation) {
            return;
        }
        match shared.connector.connect(&shared.config.url).await {
            Ok(connection) => {
                if open(&shared, generation, connection) {
                    let _ = outcome.send(Some(Ok(())));
                }
                return;
            }
            Err(err) => match attempt_failed(&shared, generation, &err) {
                Retry::After(next) => delay = next,
                Retry::Exhausted(attempts) => {
                    let _ = outcome.send(Some(Err(ChannelError::MaxAttemptsExceeded {
                        attempts,
                    })));
                    return;
                }
                Retry::Stale => return,
            },
        }
    }
}

fn begin_attempt(shared: &Shared, generation: u64) -> bool {
    let mut state = lock(&shared.state);
    if state.generation != generation {
        return false;
    }
    state.status = ConnectionStatus::Connecting;
    debug!(
        event = "channel_connecting",
        url = %shared.config.url,
        attempt = state.reconnect_attempts
    );
    true
}

fn open(shared: &Arc<Shared>, generation: u64, connection: Connection) -> bool {
    let Connection { outbound, inbound } = connection;
    let (reader_generation, flushed) = {
        let mut state = lock(&shared.state);
        if state.generation != generation {
            return false;
        }
        state.generation += 1;
        state.status = ConnectionStatus::Connected;
        state.reconnect_attempts = 0;
        state.cycle = None;
        state.retry_task = None;
        state.outbound = Some(outbound);

        let mut flushed = 0usize;
        while let Some(message) = state.pending.pop_front() {
            let sent = match state.write(message.text) {
                Ok(()) => true,
                Err(err) => {
                    warn!(event = "flush_failed", event_type = %message.event_type, error = %err);
                    false
                }
            };
            let _ = message.done.send(sent);
            flushed += 1;
        }
        (state.generation, flushed)
    };
    info!(event = "channel_open", url = %shared.config.url, flushed = flushed);
    tokio::spawn(read_loop(shared.clone(), inbound, reader_generation));
    true
}

fn attempt_failed(shared: &Shared, generation: u64, err: &ChannelError) -> Retry {
    let pending = {
        let mut state = lock(&shared.state);
        if state.generation != generation {
            return Retry::Stale;
        }
        state.status = ConnectionStatus::Disconnected;
        state.outbound = None;
        let max = shared.config.max_reconnect_attempts;
        if state.reconnect_attempts < max {
            state.reconnect_attempts += 1;
            warn!(
                event = "channel_connect_failed",
                url = %shared.config.url,
                attempt = state.reconnect_attempts,
                max_attempts = max,
                retry_in_ms = shared.config.reconnect_interval.as_millis() as u64,
                error = %err
            );
            return Retry::After(shared.config.reconnect_interval);
        }
        state.cycle = None;
        state.retry_task = None;
        std::mem::take(&mut state.pending)
    };

    let attempts = shared.config.max_reconnect_attempts;
    error!(
        event = "max_reconnect_attempts",
        url = %shared.config.url,
        attempts = attempts,
        dropped = pending.len(),
        error = %err
    );
    for message in pending {
        let _ = message.done.send(false);
    }
    Retry::Exhausted(attempts)
}

async fn read_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    generation: u64,
) {
    while let Some(text) = inbound.recv().await {
        if lock(&shared.state).generation != generation {
            debug!(event = "stale_reader_stopped", url = %shared.config.url);
            break;
        }
        shared
            .router
            .dispatch_text(&text, shared.config.max_frame_bytes);
    }
    connection_lost(&shared, generation);
}

fn connection_lost(shared: &Arc<Shared>, generation: u64) {
    let mut state = lock(&shared.state);
    if state.generation != generation || state.status != ConnectionStatus::Connected {
        return;
    }
    state.status = ConnectionStatus::Disconnected;
    state.outbound = None;
    let max = shared.config.max_reconnect_attempts;
    if state.reconnect_attempts >= max {
        warn!(event = "channel_closed", url = %shared.config.url, retry = false);
        return;
    }
    state.reconnect_attempts += 1;
    warn!(
        event = "channel_closed",
        url = %shared.config.url,
        retry = true,
        attempt = state.reconnect_attempts,
        max_attempts = max
    );
    start_cycle(shared, &mut state, shared.config.reconnect_interval);
}
