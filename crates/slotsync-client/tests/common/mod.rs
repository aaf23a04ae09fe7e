#![allow(dead_code)]

use async_trait::async_trait;
use slotsync_client::{ChannelClient, ChannelConfig, ChannelError, Connection, Connector, Peer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

pub const RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Refuse,
    Accept,
}

/// Connector that follows a script of refusals and accepts. Accepted
/// connections hand their far end to the test through `peers`. Once the
/// script runs out every attempt is refused.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Step>>,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<Peer>,
}

impl ScriptedConnector {
    pub fn new(steps: &[Step]) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(steps.iter().copied().collect()),
            attempts: AtomicUsize::new(0),
            peers,
        });
        (connector, accepted)
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &Url) -> Result<Connection, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Refuse);
        match step {
            Step::Refuse => Err(ChannelError::Connect("connection refused".to_string())),
            Step::Accept => {
                let (connection, peer) = Connection::channel();
                let _ = self.peers.send(peer);
                Ok(connection)
            }
        }
    }
}

pub fn config(max_attempts: u32) -> ChannelConfig {
    let url = Url::parse("ws://127.0.0.1:8000/ws").expect("url");
    ChannelConfig::new(url)
        .with_reconnect_interval(RETRY)
        .with_max_reconnect_attempts(max_attempts)
}

pub fn scripted_channel(
    steps: &[Step],
    max_attempts: u32,
) -> (ChannelClient, Arc<ScriptedConnector>, mpsc::UnboundedReceiver<Peer>) {
    let (connector, peers) = ScriptedConnector::new(steps);
    let channel = ChannelClient::with_connector(config(max_attempts), connector.clone());
    (channel, connector, peers)
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    tokio::time::timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("connection accepted in time")
        .expect("connector alive")
}

pub async fn recv_frame(peer: &mut Peer) -> serde_json::Value {
    let text = tokio::time::timeout(Duration::from_secs(2), peer.sent.recv())
        .await
        .expect("frame in time")
        .expect("connection open");
    serde_json::from_str(&text).expect("json frame")
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
