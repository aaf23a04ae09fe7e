use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Realtime event kinds produced and consumed by the scheduling views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AppointmentCreated,
    AppointmentUpdated,
    AppointmentDeleted,
    AppointmentCompleted,
    ClientUpdated,
    TaskUpdated,
    TaskCompleted,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::AppointmentCreated,
        EventType::AppointmentUpdated,
        EventType::AppointmentDeleted,
        EventType::AppointmentCompleted,
        EventType::ClientUpdated,
        EventType::TaskUpdated,
        EventType::TaskCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AppointmentCreated => "appointment_created",
            EventType::AppointmentUpdated => "appointment_updated",
            EventType::AppointmentDeleted => "appointment_deleted",
            EventType::AppointmentCompleted => "appointment_completed",
            EventType::ClientUpdated => "client_updated",
            EventType::TaskUpdated => "task_updated",
            EventType::TaskCompleted => "task_completed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        EventType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown event type: {normalized}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_names() {
        assert_eq!(
            "appointment_completed".parse::<EventType>(),
            Ok(EventType::AppointmentCompleted)
        );
        assert_eq!(" TASK_UPDATED".parse::<EventType>(), Ok(EventType::TaskUpdated));
        assert!("appointment_moved".parse::<EventType>().is_err());
    }
}
