use crate::scope::Branch;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_opt_datetime")]
    pub date_of_creation: Option<NaiveDateTime>,
    #[serde(deserialize_with = "deserialize_datetime")]
    pub date_of_appointment: NaiveDateTime,
    #[serde(default)]
    pub is_finished: bool,
    #[serde(default)]
    pub user: Option<StaffMember>,
    #[serde(default)]
    pub clients: Option<ClientRef>,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub discount: Option<i64>,
    #[serde(default)]
    pub type_of_payment: Option<String>,
    #[serde(default)]
    pub type_of_massage: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaffMember {
    #[serde(default)]
    pub f_name: Option<String>,
    #[serde(default)]
    pub l_name: Option<String>,
    #[serde(default)]
    pub baitursynov: bool,
    #[serde(default)]
    pub gagarina: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRef {
    #[serde(default)]
    pub f_name: Option<String>,
    #[serde(default)]
    pub l_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Appointment {
    /// `HH:MM` slot the appointment occupies on the day grid.
    pub fn slot_label(&self) -> String {
        self.date_of_appointment.format("%H:%M").to_string()
    }

    pub fn staff_name(&self) -> Option<String> {
        self.user
            .as_ref()
            .and_then(|user| full_name(user.f_name.as_deref(), user.l_name.as_deref()))
    }

    pub fn client_name(&self) -> Option<String> {
        self.clients
            .as_ref()
            .and_then(|client| full_name(client.f_name.as_deref(), client.l_name.as_deref()))
    }

    pub fn belongs_to(&self, branch: Branch) -> bool {
        match branch {
            Branch::All => true,
            Branch::Baitursynov => self.user.as_ref().is_some_and(|user| user.baitursynov),
            Branch::Gagarina => self.user.as_ref().is_some_and(|user| user.gagarina),
        }
    }
}

fn full_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let joined = format!("{} {}", first.unwrap_or(""), last.unwrap_or(""));
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Accepts naive ISO date-times as well as RFC 3339 values with an offset.
fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_local());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

fn deserialize_datetime<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_datetime(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid date-time: {raw}")))
}

fn deserialize_opt_datetime<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(value) => parse_datetime(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid date-time: {value}"))),
    }
}
