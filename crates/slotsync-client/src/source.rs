use async_trait::async_trait;
use slotsync_core::{Appointment, Scope};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("appointments request failed with status {0}")]
    Status(u16),
    #[error("session expired; login required")]
    SessionExpired,
    #[error("appointments request failed: {0}")]
    Transport(String),
    #[error("invalid appointments payload: {0}")]
    Decode(String),
}

/// Loads the appointments visible in one scope.
#[async_trait]
pub trait AppointmentSource: Send + Sync + 'static {
    async fn fetch(&self, scope: &Scope) -> Result<Vec<Appointment>, FetchError>;
}
