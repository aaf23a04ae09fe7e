use crate::fanout::{invoke_all, lock, FanoutReport, HandlerId, HandlerList};
use slotsync_core::{decode_frame, InboundEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Named-event handler registry. Handlers for one type run in registration
/// order and are isolated from each other's failures.
#[derive(Default)]
pub struct EventRouter {
    handlers: Mutex<HashMap<String, HandlerList<InboundEvent>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event_type: &str, handler: F) -> HandlerId
    where
        F: Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut handlers = lock(&self.handlers);
        let list = handlers.entry(event_type.to_string()).or_default();
        let id = list.add(Arc::new(handler));
        debug!(
            event = "handler_registered",
            event_type = event_type,
            total = list.len()
        );
        id
    }

    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        let mut handlers = lock(&self.handlers);
        let Some(list) = handlers.get_mut(event_type) else {
            return false;
        };
        let removed = list.remove(id);
        if list.is_empty() {
            handlers.remove(event_type);
        }
        removed
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        lock(&self.handlers)
            .get(event_type)
            .map(HandlerList::len)
            .unwrap_or(0)
    }

    pub fn dispatch(&self, event: &InboundEvent) -> FanoutReport {
        let snapshot = lock(&self.handlers)
            .get(&event.event_type)
            .map(HandlerList::snapshot)
            .unwrap_or_default();
        if snapshot.is_empty() {
            debug!(event = "no_handlers", event_type = %event.event_type);
            return FanoutReport::default();
        }
        invoke_all(&snapshot, event, &event.event_type)
    }

    /// Decodes one wire frame and dispatches it. Malformed frames are logged
    /// and yield `None`.
    pub fn dispatch_text(&self, text: &str, max_frame_bytes: usize) -> Option<FanoutReport> {
        match decode_frame(text, max_frame_bytes) {
            Ok(event) => Some(self.dispatch(&event)),
            Err(err) => {
                warn!(event = "frame_invalid", error = %err, size = text.len());
                None
            }
        }
    }
}
